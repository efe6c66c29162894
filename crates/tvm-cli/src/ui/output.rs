//! Terminal output for commands.
//!
//! [`TerminalReporter`] is the [`Reporter`] handed to the installation
//! pipeline. Status lines go to stderr so stdout stays clean for tables. On a
//! terminal the progress line is redrawn in place; otherwise only stage changes
//! are printed.

use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossterm::QueueableCommand;
use crossterm::style::{Color, Stylize};
use crossterm::terminal::{Clear, ClearType};

use tvm_core::ClassifiedError;
use tvm_core::ops::InstallationStatus;
use tvm_core::reporter::Reporter;
use tvm_schema::ToolchainVersion;

use super::progress::{format_download_progress, stage_label};
use super::theme::{Theme, format_size};

/// Minimum spacing between redraws of the progress line.
const REDRAW_INTERVAL: Duration = Duration::from_millis(80);

struct LineState {
    out: Box<dyn Write + Send>,
    /// A progress line is on screen and must be cleared before printing.
    dirty: bool,
    last_draw: Option<Instant>,
}

impl LineState {
    fn clear(&mut self) {
        if self.dirty {
            let _ = self.out.queue(Clear(ClearType::CurrentLine));
            let _ = write!(self.out, "\r");
            self.dirty = false;
        }
    }
}

/// Writes pipeline events to stderr.
pub struct TerminalReporter {
    theme: Theme,
    quiet: bool,
    interactive: bool,
    line: Mutex<LineState>,
}

impl std::fmt::Debug for TerminalReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalReporter")
            .field("quiet", &self.quiet)
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}

impl TerminalReporter {
    pub fn new(quiet: bool) -> Self {
        let interactive = std::io::stderr().is_terminal();
        Self::with_writer(Box::new(std::io::stderr()), quiet, interactive)
    }

    pub fn with_writer(out: Box<dyn Write + Send>, quiet: bool, interactive: bool) -> Self {
        Self {
            theme: Theme::default(),
            quiet,
            interactive,
            line: Mutex::new(LineState {
                out,
                dirty: false,
                last_draw: None,
            }),
        }
    }

    fn println(&self, text: &str) {
        let mut state = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        state.clear();
        let _ = writeln!(state.out, "{text}");
        let _ = state.out.flush();
    }

    fn redraw(&self, text: &str, force: bool) {
        if self.quiet || !self.interactive {
            return;
        }
        let mut state = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        let due = state.last_draw.is_none_or(|t| t.elapsed() >= REDRAW_INTERVAL);
        if !due && !force {
            return;
        }
        state.clear();
        let _ = write!(state.out, "{text}");
        let _ = state.out.flush();
        state.dirty = true;
        state.last_draw = Some(Instant::now());
    }

    /// Drop a half-drawn progress line so the next output starts clean.
    fn finish_line(&self) {
        let mut state = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        state.clear();
        let _ = state.out.flush();
    }

    fn status_line(&self, icon: &str, color: Color, version: &ToolchainVersion, detail: &str) -> String {
        format!(
            "  {} {} {}",
            icon.with(color),
            format!("go{version}").with(self.theme.colors.version),
            detail.with(self.theme.colors.secondary)
        )
    }
}

impl Reporter for TerminalReporter {
    fn stage(&self, version: &ToolchainVersion, status: InstallationStatus) {
        if self.quiet || status.is_terminal() {
            return;
        }
        let line = self.status_line(self.theme.icons.active, self.theme.colors.active, version, stage_label(status));
        if self.interactive {
            self.redraw(&line, true);
        } else {
            self.println(&line);
        }
    }

    fn downloading(&self, version: &ToolchainVersion, current: u64, total: Option<u64>, bytes_per_sec: f64) {
        let detail = format!("downloading  {}", format_download_progress(current, total, bytes_per_sec));
        let line = self.status_line(self.theme.icons.active, self.theme.colors.active, version, &detail);
        self.redraw(&line, false);
    }

    fn extracting(&self, version: &ToolchainVersion, current: u64, total: Option<u64>) {
        let detail = match total {
            Some(total) => format!("placing  {current}/{total} files"),
            None => format!("extracting  {}", format_size(current)),
        };
        let line = self.status_line(self.theme.icons.active, self.theme.colors.active, version, &detail);
        self.redraw(&line, false);
    }

    fn retrying(&self, version: &ToolchainVersion, attempt: u32, delay: Duration, reason: &str) {
        if self.quiet {
            return;
        }
        let detail = format!("retry {attempt} in {:.1}s: {reason}", delay.as_secs_f64());
        self.println(&self.status_line(self.theme.icons.warning, self.theme.colors.warning, version, &detail));
    }

    fn done(&self, version: &ToolchainVersion, path: &Path, elapsed_secs: f64) {
        let detail = format!("installed in {elapsed_secs:.1}s  {}", path.display());
        self.println(&self.status_line(self.theme.icons.success, self.theme.colors.success, version, &detail));
    }

    // The command prints the classified error with its hint once the pipeline returns.
    fn failed(&self, version: &ToolchainVersion, reason: &str) {
        tracing::debug!(%version, reason, "Installation reported failed");
        self.finish_line();
    }

    fn info(&self, msg: &str) {
        if !self.quiet {
            self.println(&format!("  {} {msg}", self.theme.icons.info.with(self.theme.colors.secondary)));
        }
    }

    fn warning(&self, msg: &str) {
        self.println(&format!("  {} {msg}", self.theme.icons.warning.with(self.theme.colors.warning)));
    }
}

/// Print a classified error with its hint; the full report under `--verbose`.
pub fn print_error(err: &ClassifiedError, verbose: bool) {
    let theme = Theme::default();
    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "{} {}", "error:".with(theme.colors.error).bold(), err.message);
    let _ = writeln!(stderr, "  {} {}", "hint:".with(theme.colors.header), err.suggestion());
    if verbose {
        let _ = writeln!(stderr, "  {} {}", "kind:".with(theme.colors.header), err.kind);
        for (key, value) in &err.context {
            let _ = writeln!(stderr, "  {}: {value}", key.as_str().with(theme.colors.header));
        }
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            let _ = writeln!(stderr, "  {} {cause}", "caused by:".with(theme.colors.header));
            source = cause.source();
        }
    }
}

/// One-line success message on stdout.
pub fn success(msg: &str) {
    let theme = Theme::default();
    println!("  {} {msg}", theme.icons.success.with(theme.colors.success));
}
