//! Progress line formatting

use tvm_core::ops::InstallationStatus;
use tvm_core::reporter::percent;

use super::theme::format_size;

/// Human label for an installation stage.
pub fn stage_label(status: InstallationStatus) -> &'static str {
    match status {
        InstallationStatus::Pending => "queued",
        InstallationStatus::Downloading => "downloading",
        InstallationStatus::Extracting => "extracting",
        InstallationStatus::Configuring => "configuring",
        InstallationStatus::Completed => "installed",
        InstallationStatus::Failed => "failed",
        InstallationStatus::Cancelled => "cancelled",
    }
}

/// `12.0 MB / 64.0 MB  18%  4.2 MB/s`, or without the total and percentage when unknown.
pub fn format_download_progress(current: u64, total: Option<u64>, bytes_per_sec: f64) -> String {
    let speed = format!("{}/s", format_size(bytes_per_sec.max(0.0) as u64));
    match (total.filter(|&t| t > 0), percent(current, total)) {
        (Some(t), Some(pct)) => format!(
            "{} / {}  {pct:>3.0}%  {speed}",
            format_size(current),
            format_size(t)
        ),
        _ => format!("{}  {speed}", format_size(current)),
    }
}
