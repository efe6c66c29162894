use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::platform::{Arch, Os};
use crate::version::ToolchainVersion;

/// Archive container format, detected from the filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    /// Gzip-compressed tar archive (`.tar.gz` / `.tgz`).
    #[serde(rename = "tar.gz")]
    TarGz,
    /// Uncompressed tar archive (`.tar`).
    Tar,
    /// Zip archive (`.zip`).
    Zip,
    /// Anything else.
    Unknown,
}

impl ArchiveKind {
    /// Detect the archive kind from a path's extension.
    pub fn detect(path: &Path) -> Self {
        let name = path.to_string_lossy().to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar") {
            Self::Tar
        } else if name.ends_with(".zip") {
            Self::Zip
        } else {
            Self::Unknown
        }
    }

    /// Filename extension used when publishing archives of this kind.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
            Self::Tar => "tar",
            Self::Zip => "zip",
            Self::Unknown => "",
        }
    }
}

/// The resolved download for one installation attempt.
///
/// Immutable once built; resolving against a different source produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallTarget {
    /// Operating system the archive is built for.
    pub os: Os,
    /// Architecture the archive is built for.
    pub arch: Arch,
    /// Version being installed.
    pub version: ToolchainVersion,
    /// Archive filename, e.g. `go1.21.5.linux-amd64.tar.gz`.
    pub archive_filename: String,
    /// Full download URL.
    pub download_url: String,
    /// Name of the source the URL was built from.
    pub source_name: String,
}

impl InstallTarget {
    /// Archive kind implied by the filename.
    pub fn archive_kind(&self) -> ArchiveKind {
        ArchiveKind::detect(Path::new(&self.archive_filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_kinds() {
        assert_eq!(ArchiveKind::detect(Path::new("go1.21.linux-amd64.tar.gz")), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect(Path::new("GO.ZIP")), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::detect(Path::new("go.tgz")), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect(Path::new("go.pkg")), ArchiveKind::Unknown);
    }
}
