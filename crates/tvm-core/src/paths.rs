use dirs::home_dir;
use std::path::{Path, PathBuf};

use tvm_schema::ToolchainVersion;

/// Returns the tvm home directory, or None if the user's home cannot be resolved.
pub fn try_tvm_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("TVM_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".tvm"))
}

/// On-disk layout rooted at a base directory.
///
/// ```text
/// ~/.tvm/
/// ├── versions/<version>/   # one extracted toolchain per version
/// ├── tmp/                  # per-attempt download and staging dirs, lock files
/// ├── current -> versions/<version>
/// ├── versions.json         # installed version records
/// ├── mirrors.json          # custom sources + probe cache
/// └── settings.toml         # user settings
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    base: PathBuf,
}

impl Layout {
    /// Layout rooted at an explicit directory.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Layout rooted at `TVM_HOME` or `~/.tvm`.
    pub fn from_env() -> Option<Self> {
        try_tvm_home().map(Self::new)
    }

    /// Base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory holding all installed versions.
    pub fn versions_dir(&self) -> PathBuf {
        self.base.join("versions")
    }

    /// Default installation directory for one version.
    pub fn version_dir(&self, version: &ToolchainVersion) -> PathBuf {
        self.versions_dir().join(version.as_str())
    }

    /// Temp path: ~/.tvm/tmp (same volume as the versions dir, so renames stay cheap)
    pub fn tmp_dir(&self) -> PathBuf {
        self.base.join("tmp")
    }

    /// Lock file guarding concurrent installs of the same version.
    pub fn lock_path(&self, version: &ToolchainVersion) -> PathBuf {
        self.tmp_dir().join(format!("{}.lock", version.as_str()))
    }

    /// Symlink pointing at the active version.
    pub fn current_link(&self) -> PathBuf {
        self.base.join("current")
    }

    /// Installed version records.
    pub fn records_path(&self) -> PathBuf {
        self.base.join("versions.json")
    }

    /// Custom sources and probe cache.
    pub fn mirrors_path(&self) -> PathBuf {
        self.base.join("mirrors.json")
    }

    /// User settings.
    pub fn settings_path(&self) -> PathBuf {
        self.base.join("settings.toml")
    }
}
