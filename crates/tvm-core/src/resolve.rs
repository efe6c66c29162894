//! Target resolution: (version, platform, source) -> archive filename and URL.

use reqwest::Url;
use thiserror::Error;

use crate::error::{ClassifiedError, ErrorKind};
use tvm_schema::{
    Arch, ArchiveKind, DownloadSource, InstallTarget, Os, PRIMARY_SOURCE, Platform,
    ToolchainVersion,
};

/// Source name recorded when the caller passes a URL instead of a source name.
pub const CUSTOM_URL_SOURCE: &str = "custom-url";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Unsupported platform: no archive is published for {0}")]
    UnsupportedPlatform(Platform),

    #[error("No primary source configured")]
    NoPrimarySource,
}

impl From<ResolveError> for ClassifiedError {
    fn from(err: ResolveError) -> Self {
        let kind = match &err {
            ResolveError::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            ResolveError::NoPrimarySource => ErrorKind::Configuration,
        };
        let mut classified = ClassifiedError::new(kind, err.to_string());
        if let ResolveError::UnsupportedPlatform(p) = &err {
            classified = classified
                .with_context("os", p.os)
                .with_context("arch", p.arch);
        }
        classified.with_cause(err)
    }
}

/// Archive kind published for a platform, or `None` when nothing is published.
pub fn archive_kind_for(platform: Platform) -> Option<ArchiveKind> {
    match (platform.os, platform.arch) {
        (Os::Linux, Arch::X86 | Arch::Amd64 | Arch::Arm64 | Arch::Armv6l)
        | (Os::Darwin, Arch::Amd64 | Arch::Arm64) => Some(ArchiveKind::TarGz),
        (Os::Windows, Arch::X86 | Arch::Amd64 | Arch::Arm64) => Some(ArchiveKind::Zip),
        _ => None,
    }
}

/// Canonical archive filename, e.g. `go1.21.5.linux-amd64.tar.gz`.
pub fn archive_filename(version: &ToolchainVersion, platform: Platform) -> Result<String, ResolveError> {
    let kind = archive_kind_for(platform).ok_or(ResolveError::UnsupportedPlatform(platform))?;
    Ok(format!(
        "go{}.{}-{}.{}",
        version.as_str(),
        platform.os,
        platform.arch,
        kind.extension()
    ))
}

/// Returns the URL if `s` is an absolute http(s) URL.
fn absolute_url(s: &str) -> Option<Url> {
    Url::parse(s)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
}

/// Resolve the install target for a version on a platform from a named source.
///
/// `source_name` may name any entry of `sources`, or be an absolute URL used
/// directly as the base. Anything else falls back to the primary source.
pub fn resolve_target(
    version: &ToolchainVersion,
    platform: Platform,
    source_name: &str,
    sources: &[DownloadSource],
) -> Result<InstallTarget, ResolveError> {
    let filename = archive_filename(version, platform)?;

    let (source_name, download_url) =
        if let Some(source) = sources.iter().find(|s| s.name == source_name) {
            (source.name.clone(), source.url_for(&filename))
        } else if absolute_url(source_name).is_some() {
            let base = DownloadSource::new(CUSTOM_URL_SOURCE, source_name, 0);
            (CUSTOM_URL_SOURCE.to_string(), base.url_for(&filename))
        } else {
            if !source_name.is_empty() {
                tracing::warn!(source = source_name, "Unknown source, falling back to primary");
            }
            let primary = sources
                .iter()
                .find(|s| s.name == PRIMARY_SOURCE)
                .ok_or(ResolveError::NoPrimarySource)?;
            (primary.name.clone(), primary.url_for(&filename))
        };

    Ok(InstallTarget {
        os: platform.os,
        arch: platform.arch,
        version: version.clone(),
        archive_filename: filename,
        download_url,
        source_name,
    })
}
