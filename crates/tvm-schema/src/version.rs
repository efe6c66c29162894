//! Toolchain version strings.
//!
//! Accepted grammar (an optional leading `go` is stripped):
//!
//! ```text
//! MAJOR "." MINOR [ "." PATCH ] [ ("rc" | "beta") N ]
//! ```
//!
//! Every numeric component is plain ASCII digits. Anything else, including
//! doubled dots and bare words, is rejected.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:go)?(\d+)\.(\d+)(?:\.(\d+))?(?:(rc|beta)(\d+))?$")
        .expect("version grammar is a valid regex")
});

/// Pre-release channel of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PreRelease {
    /// Beta build (`1.22beta1`).
    Beta(u32),
    /// Release candidate (`1.22rc2`).
    Rc(u32),
}

/// A parsed toolchain version such as `1.21.5` or `1.22rc1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolchainVersion {
    major: u32,
    minor: u32,
    patch: Option<u32>,
    pre: Option<PreRelease>,
    raw: String,
}

/// Errors produced while parsing a version string.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The input is empty or whitespace.
    #[error("Version string is empty")]
    Empty,

    /// The input does not match the accepted grammar.
    #[error("Invalid version '{0}': expected MAJOR.MINOR[.PATCH][rcN|betaN]")]
    Invalid(String),
}

impl ToolchainVersion {
    /// Parse and normalize a version string.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError`] when the input is empty or outside the grammar.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(VersionError::Empty);
        }

        let caps = VERSION_RE
            .captures(s)
            .ok_or_else(|| VersionError::Invalid(s.to_string()))?;

        let num = |i: usize| -> Result<Option<u32>, VersionError> {
            caps.get(i)
                .map(|m| m.as_str().parse::<u32>())
                .transpose()
                .map_err(|_| VersionError::Invalid(s.to_string()))
        };

        let major = num(1)?.ok_or_else(|| VersionError::Invalid(s.to_string()))?;
        let minor = num(2)?.ok_or_else(|| VersionError::Invalid(s.to_string()))?;
        let patch = num(3)?;
        let pre = match (caps.get(4).map(|m| m.as_str()), num(5)?) {
            (Some("rc"), Some(n)) => Some(PreRelease::Rc(n)),
            (Some("beta"), Some(n)) => Some(PreRelease::Beta(n)),
            _ => None,
        };

        let raw = s.strip_prefix("go").unwrap_or(s).to_string();
        Ok(Self {
            major,
            minor,
            patch,
            pre,
            raw,
        })
    }

    /// Normalized version without the `go` prefix, e.g. `1.21.5`.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Major component.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Minor component.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Patch component, if present.
    pub fn patch(&self) -> Option<u32> {
        self.patch
    }

    /// Returns `true` for beta and release-candidate builds.
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }
}

impl Ord for ToolchainVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // A pre-release sorts before the final release of the same MAJOR.MINOR.PATCH.
        let pre_rank = |p: Option<PreRelease>| match p {
            Some(PreRelease::Beta(n)) => (0, n),
            Some(PreRelease::Rc(n)) => (1, n),
            None => (2, 0),
        };
        (self.major, self.minor, self.patch.unwrap_or(0), pre_rank(self.pre))
            .cmp(&(
                other.major,
                other.minor,
                other.patch.unwrap_or(0),
                pre_rank(other.pre),
            ))
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for ToolchainVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ToolchainVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl std::str::FromStr for ToolchainVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ToolchainVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for ToolchainVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_release_forms() {
        for v in ["1.21", "1.21.5", "go1.22.0", "1.22rc1", "1.21beta2"] {
            assert!(ToolchainVersion::parse(v).is_ok(), "{v} should parse");
        }
        assert_eq!(ToolchainVersion::parse("go1.22.0").unwrap().as_str(), "1.22.0");
    }

    #[test]
    fn rejects_loose_forms() {
        for v in ["", "1..2", "latest", "abc", "1", "1.2.3.4", "1.21-rc1", " go "] {
            assert!(ToolchainVersion::parse(v).is_err(), "{v:?} should be rejected");
        }
    }

    #[test]
    fn orders_numerically() {
        let mut versions: Vec<ToolchainVersion> = ["1.9", "1.21.0", "1.21rc1", "1.10.3", "1.21beta1"]
            .iter()
            .map(|v| ToolchainVersion::parse(v).unwrap())
            .collect();
        versions.sort();
        let sorted: Vec<&str> = versions.iter().map(ToolchainVersion::as_str).collect();
        assert_eq!(sorted, ["1.9", "1.10.3", "1.21beta1", "1.21rc1", "1.21.0"]);
    }

    #[test]
    fn serde_uses_plain_string() {
        let v = ToolchainVersion::parse("1.20.4").unwrap();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"1.20.4\"");
        let back: ToolchainVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
