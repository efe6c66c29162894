//! Per-attempt installation state.
//!
//! An [`InstallationContext`] is created once per install attempt and owned by
//! the orchestrator. It holds the resolved target, the attempt's paths and the
//! state machine; it also owns the same-version guard, so at most one context
//! exists per version at a time.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{ClassifiedError, ErrorKind};
use crate::paths::Layout;
use tvm_schema::{HashAlgorithm, InstallTarget, ToolchainVersion};

/// Stage of one installation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationStatus {
    Pending,
    Downloading,
    Extracting,
    Configuring,
    Completed,
    Failed,
    Cancelled,
}

impl InstallationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Configuring => "configuring",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Forward one stage at a time; `Failed`/`Cancelled` from any non-terminal state.
    pub fn can_transition_to(&self, next: Self) -> bool {
        use InstallationStatus::{Cancelled, Completed, Configuring, Downloading, Extracting, Failed, Pending};

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed | Cancelled)
                | (Pending, Downloading)
                | (Downloading, Extracting)
                | (Extracting, Configuring)
                | (Configuring, Completed)
        )
    }
}

impl std::fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing knobs for one installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// Reinstall over an existing installation.
    pub force: bool,
    /// Install here instead of `versions/<version>`.
    pub custom_path: Option<PathBuf>,
    pub skip_verification: bool,
    /// Deadline for the whole attempt; zero disables it.
    pub timeout_seconds: u64,
    pub max_retries: u32,
    /// Source name or absolute base URL.
    pub mirror: String,
    /// Rank all sources by probe latency and fail over between them.
    pub auto_mirror: bool,
    /// Expected digest. When absent the `.sha256` sidecar is consulted.
    pub checksum: Option<String>,
    pub checksum_algorithm: HashAlgorithm,
    /// Point `current` at the new installation once it succeeds.
    pub activate: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl InstallOptions {
    /// Options seeded from the user's settings; CLI flags are applied on top.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            force: false,
            custom_path: None,
            skip_verification: false,
            timeout_seconds: settings.timeout_seconds,
            max_retries: settings.max_retries,
            mirror: settings.default_mirror.clone(),
            auto_mirror: settings.auto_mirror,
            checksum: None,
            checksum_algorithm: HashAlgorithm::Sha256,
            activate: false,
        }
    }

    pub fn validate(&self) -> Result<(), ClassifiedError> {
        if let Some(expected) = &self.checksum {
            let expected = expected.trim();
            if expected.is_empty() {
                return Err(ClassifiedError::new(ErrorKind::Configuration, "Expected checksum is empty"));
            }
            if expected.len() != self.checksum_algorithm.hex_len()
                || !expected.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(ClassifiedError::new(
                    ErrorKind::Validation,
                    format!("'{expected}' is not a {} digest", self.checksum_algorithm),
                )
                .with_context("algorithm", self.checksum_algorithm));
            }
        }
        if self.mirror.trim().is_empty() && !self.auto_mirror {
            return Err(ClassifiedError::new(ErrorKind::Validation, "No download source given"));
        }
        Ok(())
    }
}

static IN_PROGRESS: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());
static ATTEMPTS: AtomicU64 = AtomicU64::new(0);

/// Exclusive claim on a version for the lifetime of one attempt.
///
/// Held in-process through a registry and across processes through
/// `tmp/<version>.lock`, created with create-new semantics. Both are released on drop.
#[derive(Debug)]
pub struct InstallGuard {
    version: String,
    lock_path: PathBuf,
}

impl InstallGuard {
    pub fn acquire(layout: &Layout, version: &ToolchainVersion) -> Result<Self, ClassifiedError> {
        let key = version.as_str().to_string();
        let in_progress = || {
            ClassifiedError::new(
                ErrorKind::VersionExists,
                format!("Installation of {version} already in progress"),
            )
            .with_context("version", version)
        };

        if !IN_PROGRESS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone())
        {
            return Err(in_progress());
        }
        let release = |key: &str| {
            IN_PROGRESS.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        };

        let lock_path = layout.lock_path(version);
        if let Err(e) = std::fs::create_dir_all(layout.tmp_dir()) {
            release(&key);
            return Err(e.into());
        }
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                release(&key);
                return Err(in_progress().with_context("lock", lock_path.display()));
            }
            Err(e) => {
                release(&key);
                return Err(e.into());
            }
        }
        debug!(lock = %lock_path.display(), "Acquired install lock");

        Ok(Self { version: key, lock_path })
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!(error = %e, lock = %self.lock_path.display(), "Failed to remove install lock");
        }
        IN_PROGRESS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.version);
    }
}

/// Everything one install attempt knows about itself.
#[derive(Debug)]
pub struct InstallationContext {
    pub version: ToolchainVersion,
    pub target: InstallTarget,
    pub base_dir: PathBuf,
    /// Final destination (`versions/<version>` or the custom path).
    pub version_dir: PathBuf,
    /// Scoped to this version and attempt.
    pub temp_dir: PathBuf,
    pub archive_path: PathBuf,
    pub options: InstallOptions,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
    status: InstallationStatus,
    _guard: InstallGuard,
}

impl InstallationContext {
    /// Claim `target.version` and lay out the attempt's paths. Touches nothing but the lock.
    pub fn new(layout: &Layout, target: InstallTarget, options: InstallOptions) -> Result<Self, ClassifiedError> {
        let version = target.version.clone();
        let guard = InstallGuard::acquire(layout, &version)?;

        let attempt = ATTEMPTS.fetch_add(1, Ordering::Relaxed);
        let temp_dir = layout
            .tmp_dir()
            .join(format!("{}-{}-{attempt}", version.as_str(), std::process::id()));
        let version_dir = options
            .custom_path
            .clone()
            .unwrap_or_else(|| layout.version_dir(&version));
        let archive_path = temp_dir.join(&target.archive_filename);

        Ok(Self {
            version,
            target,
            base_dir: layout.base().to_path_buf(),
            version_dir,
            temp_dir,
            archive_path,
            options,
            start_time: Instant::now(),
            started_at: Utc::now(),
            status: InstallationStatus::Pending,
            _guard: guard,
        })
    }

    pub fn status(&self) -> InstallationStatus {
        self.status
    }

    /// Move the state machine. An illegal transition is a programming error.
    pub fn transition(&mut self, next: InstallationStatus) -> Result<(), ClassifiedError> {
        if !self.status.can_transition_to(next) {
            return Err(ClassifiedError::new(
                ErrorKind::Configuration,
                format!("Illegal installation transition {} -> {next}", self.status),
            )
            .with_context("version", &self.version));
        }
        debug!(version = %self.version, from = %self.status, to = %next, "Installation stage");
        self.status = next;
        Ok(())
    }

    /// Point the attempt at a different source. The archive path follows the new filename.
    pub fn retarget(&mut self, target: InstallTarget) {
        self.archive_path = self.temp_dir.join(&target.archive_filename);
        self.target = target;
    }

    /// Backup location for a force reinstall.
    pub fn backup_dir(&self) -> PathBuf {
        self.temp_dir.join("backup")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.temp_dir.join("staging")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tvm_schema::{Arch, Os};

    fn target(version: &str) -> InstallTarget {
        InstallTarget {
            os: Os::Linux,
            arch: Arch::Amd64,
            version: ToolchainVersion::parse(version).unwrap(),
            archive_filename: format!("go{version}.linux-amd64.tar.gz"),
            download_url: format!("https://go.dev/dl/go{version}.linux-amd64.tar.gz"),
            source_name: "official".into(),
        }
    }

    #[test]
    fn happy_path_is_monotonic() {
        use InstallationStatus::*;
        let path = [Pending, Downloading, Extracting, Configuring, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_transition_to(pair[0]), "{} -> {}", pair[1], pair[0]);
        }
        assert!(!Pending.can_transition_to(Extracting));
        assert!(!Downloading.can_transition_to(Downloading));
    }

    #[test]
    fn failure_exits_from_any_non_terminal_state() {
        use InstallationStatus::*;
        for from in [Pending, Downloading, Extracting, Configuring] {
            assert!(from.can_transition_to(Failed));
            assert!(from.can_transition_to(Cancelled));
        }
        for terminal in [Completed, Failed, Cancelled] {
            assert!(!terminal.can_transition_to(Failed));
            assert!(!terminal.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn illegal_transition_is_configuration_error() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let mut ctx = InstallationContext::new(&layout, target("1.30.1"), InstallOptions::default()).unwrap();
        let err = ctx.transition(InstallationStatus::Configuring).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert_eq!(ctx.status(), InstallationStatus::Pending);

        ctx.transition(InstallationStatus::Downloading).unwrap();
        ctx.transition(InstallationStatus::Cancelled).unwrap();
        assert!(ctx.transition(InstallationStatus::Failed).is_err());
    }

    #[test]
    fn second_context_for_same_version_is_rejected() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let first = InstallationContext::new(&layout, target("1.30.2"), InstallOptions::default()).unwrap();
        assert!(layout.lock_path(&first.version).exists());

        let err = InstallationContext::new(&layout, target("1.30.2"), InstallOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::VersionExists);

        let other = InstallationContext::new(&layout, target("1.30.3"), InstallOptions::default()).unwrap();
        assert_ne!(first.temp_dir, other.temp_dir);

        let lock = layout.lock_path(&first.version);
        drop(first);
        assert!(!lock.exists());
        InstallationContext::new(&layout, target("1.30.2"), InstallOptions::default()).unwrap();
    }

    #[test]
    fn stale_lock_file_blocks_other_processes() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let version = ToolchainVersion::parse("1.30.4").unwrap();
        std::fs::create_dir_all(layout.tmp_dir()).unwrap();
        std::fs::write(layout.lock_path(&version), "1\n").unwrap();

        let err = InstallGuard::acquire(&layout, &version).unwrap_err();
        assert_eq!(err.kind, ErrorKind::VersionExists);
        assert!(err.context.contains_key("lock"));
        // The in-process claim was released again.
        std::fs::remove_file(layout.lock_path(&version)).unwrap();
        InstallGuard::acquire(&layout, &version).unwrap();
    }

    #[test]
    fn checksum_option_is_checked_against_algorithm() {
        let mut options = InstallOptions {
            checksum: Some("abc".into()),
            ..InstallOptions::default()
        };
        assert_eq!(options.validate().unwrap_err().kind, ErrorKind::Validation);
        options.checksum = Some("  ".into());
        assert_eq!(options.validate().unwrap_err().kind, ErrorKind::Configuration);
        options.checksum = Some("a".repeat(64));
        options.validate().unwrap();
    }
}
