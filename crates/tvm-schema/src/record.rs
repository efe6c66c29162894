use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::version::ToolchainVersion;

/// Bookkeeping entry for one installed toolchain version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Installed version.
    pub version: ToolchainVersion,
    /// Installation directory.
    pub path: PathBuf,
    /// Source the archive was downloaded from.
    pub source: String,
    /// Exact download URL.
    pub url: String,
    /// SHA-256 of the archive, when it was computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Total size of the installed files.
    pub size_bytes: u64,
    /// Completion time of the installation.
    pub installed_at: DateTime<Utc>,
    /// Whether this version is the one the `current` link points at.
    #[serde(default)]
    pub active: bool,
}
