//! Download sources (the official site and its mirrors) and probe results.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the primary upstream source.
pub const PRIMARY_SOURCE: &str = "official";

/// A named, prioritized base location from which toolchain archives are fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSource {
    /// Unique key across built-in and custom sources.
    pub name: String,
    /// Base URL that archive filenames are appended to.
    pub base_url: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Region hint (e.g. `global`, `cn`).
    #[serde(default)]
    pub region: String,
    /// Lower numbers are preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_priority() -> u32 {
    100
}

impl DownloadSource {
    /// Create a source with an empty description and region.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            description: String::new(),
            region: String::new(),
            priority,
        }
    }

    /// Builder-style description setter.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder-style region setter.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Join an archive filename onto the base URL with exactly one `/` between them.
    pub fn url_for(&self, filename: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            filename.trim_start_matches('/')
        )
    }
}

/// The sources shipped with tvm, in priority order.
pub fn builtin_sources() -> Vec<DownloadSource> {
    vec![
        DownloadSource::new(PRIMARY_SOURCE, "https://go.dev/dl/", 1)
            .with_description("Official download site")
            .with_region("global"),
        DownloadSource::new("google", "https://dl.google.com/go/", 2)
            .with_description("Google download CDN")
            .with_region("global"),
        DownloadSource::new("aliyun", "https://mirrors.aliyun.com/golang/", 3)
            .with_description("Alibaba Cloud mirror")
            .with_region("cn"),
        DownloadSource::new("tencent", "https://mirrors.cloud.tencent.com/go/", 4)
            .with_description("Tencent Cloud mirror")
            .with_region("cn"),
        DownloadSource::new("huawei", "https://mirrors.huaweicloud.com/go/", 5)
            .with_description("Huawei Cloud mirror")
            .with_region("cn"),
        DownloadSource::new("ustc", "https://mirrors.ustc.edu.cn/golang/", 6)
            .with_description("USTC open source mirror")
            .with_region("cn"),
    ]
}

/// Outcome of probing one source for availability and latency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorProbeResult {
    /// Name of the probed source.
    pub source_name: String,
    /// Time until the response headers arrived (or until the probe gave up).
    #[serde(with = "duration_ms")]
    pub response_time: Duration,
    /// Whether the source answered with a 2xx or 3xx status.
    pub available: bool,
    /// The error that made the source unavailable, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MirrorProbeResult {
    /// A successful probe.
    pub fn available(source_name: impl Into<String>, response_time: Duration) -> Self {
        Self {
            source_name: source_name.into(),
            response_time,
            available: true,
            error: None,
        }
    }

    /// A failed probe retaining the triggering error.
    pub fn unavailable(
        source_name: impl Into<String>,
        response_time: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            response_time,
            available: false,
            error: Some(error.into()),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_for_uses_single_separator() {
        let with_slash = DownloadSource::new("a", "https://example.com/dl/", 1);
        let without = DownloadSource::new("b", "https://example.com/dl", 1);
        assert_eq!(with_slash.url_for("x.tar.gz"), "https://example.com/dl/x.tar.gz");
        assert_eq!(without.url_for("/x.tar.gz"), "https://example.com/dl/x.tar.gz");
    }

    #[test]
    fn builtins_have_unique_names_and_primary_first() {
        let sources = builtin_sources();
        assert_eq!(sources[0].name, PRIMARY_SOURCE);
        let mut names: Vec<_> = sources.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), sources.len());
    }

    #[test]
    fn probe_result_serializes_millis() {
        let r = MirrorProbeResult::available("official", Duration::from_millis(42));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["response_time"], 42);
        assert!(json.get("error").is_none());
    }
}
