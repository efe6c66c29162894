//! Reporter trait for dependency injection
//!
//! This trait allows the installation pipeline to report progress and status
//! without being coupled to a specific terminal UI.

use std::path::Path;
use std::time::Duration;

use tvm_schema::ToolchainVersion;

use crate::ops::InstallationStatus;

pub trait Reporter: Send + Sync {
    /// The installation moved to a new stage.
    fn stage(&self, version: &ToolchainVersion, status: InstallationStatus);

    /// Updates the progress of a download. `total` is `None` when the size is unknown.
    fn downloading(&self, version: &ToolchainVersion, current: u64, total: Option<u64>, bytes_per_sec: f64);

    /// Updates the progress of an extraction.
    fn extracting(&self, version: &ToolchainVersion, current: u64, total: Option<u64>);

    /// A failed attempt is about to be retried after `delay`.
    fn retrying(&self, version: &ToolchainVersion, attempt: u32, delay: Duration, reason: &str);

    /// Marks an installation as successfully completed.
    fn done(&self, version: &ToolchainVersion, path: &Path, elapsed_secs: f64);

    /// Marks an installation as failed with a specific reason.
    fn failed(&self, version: &ToolchainVersion, reason: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn stage(&self, version: &ToolchainVersion, status: InstallationStatus) {
        (**self).stage(version, status);
    }
    fn downloading(&self, version: &ToolchainVersion, current: u64, total: Option<u64>, bytes_per_sec: f64) {
        (**self).downloading(version, current, total, bytes_per_sec);
    }
    fn extracting(&self, version: &ToolchainVersion, current: u64, total: Option<u64>) {
        (**self).extracting(version, current, total);
    }
    fn retrying(&self, version: &ToolchainVersion, attempt: u32, delay: Duration, reason: &str) {
        (**self).retrying(version, attempt, delay, reason);
    }
    fn done(&self, version: &ToolchainVersion, path: &Path, elapsed_secs: f64) {
        (**self).done(version, path, elapsed_secs);
    }
    fn failed(&self, version: &ToolchainVersion, reason: &str) {
        (**self).failed(version, reason);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
}

/// A no-op reporter for silent operations (e.g., scripting, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn stage(&self, _: &ToolchainVersion, _: InstallationStatus) {}
    fn downloading(&self, _: &ToolchainVersion, _: u64, _: Option<u64>, _: f64) {}
    fn extracting(&self, _: &ToolchainVersion, _: u64, _: Option<u64>) {}
    fn retrying(&self, _: &ToolchainVersion, _: u32, _: Duration, _: &str) {}
    fn done(&self, _: &ToolchainVersion, _: &Path, _: f64) {}
    fn failed(&self, _: &ToolchainVersion, _: &str) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
}

/// Byte or file progress callback used by the fetcher and the extractor.
///
/// Arguments are `(current, total, units_per_sec)`; `total` is `None` when unknown.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, current: u64, total: Option<u64>, rate: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, Option<u64>, f64) + Send + Sync,
{
    fn progress(&self, current: u64, total: Option<u64>, rate: f64) {
        self(current, total, rate);
    }
}

/// Progress sink that drops every update.
pub fn no_progress() -> impl ProgressSink {
    |_: u64, _: Option<u64>, _: f64| {}
}

/// Percentage for display; `None` when the total is unknown or zero.
pub fn percent(current: u64, total: Option<u64>) -> Option<f64> {
    total
        .filter(|&t| t > 0)
        .map(|t| (current.min(t) as f64 / t as f64) * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_unknown_and_zero_totals() {
        assert_eq!(percent(50, Some(200)), Some(25.0));
        assert_eq!(percent(10, None), None);
        assert_eq!(percent(10, Some(0)), None);
        assert_eq!(percent(300, Some(200)), Some(100.0));
    }
}
