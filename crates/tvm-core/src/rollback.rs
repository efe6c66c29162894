//! Rollback ledger: compensating actions undone in reverse on failure.
//!
//! Each mutating step of an installation registers the action that undoes it
//! *before* (or immediately after) it touches the filesystem. On failure the
//! ledger is walked from the most recent entry to the oldest, so later side
//! effects are undone while the earlier ones they depend on still exist.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{ClassifiedError, ErrorKind};

/// A compensating action.
pub enum RollbackAction {
    /// Delete a file (missing files are fine).
    RemoveFile(PathBuf),
    /// Delete a directory tree (missing directories are fine).
    RemoveDir(PathBuf),
    /// Delete everything inside a directory that existed before the attempt, keeping the directory.
    EmptyDir(PathBuf),
    /// Move `from` back to `to`, replacing whatever is at `to`.
    RestorePath { from: PathBuf, to: PathBuf },
    /// Point `link` back at `previous`, or remove it when there was none.
    RestoreLink { link: PathBuf, previous: Option<PathBuf> },
    /// Anything else, e.g. deleting a persisted record.
    Custom(Box<dyn FnMut() -> anyhow::Result<()> + Send>),
}

impl fmt::Debug for RollbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoveFile(p) => f.debug_tuple("RemoveFile").field(p).finish(),
            Self::RemoveDir(p) => f.debug_tuple("RemoveDir").field(p).finish(),
            Self::EmptyDir(p) => f.debug_tuple("EmptyDir").field(p).finish(),
            Self::RestorePath { from, to } => f
                .debug_struct("RestorePath")
                .field("from", from)
                .field("to", to)
                .finish(),
            Self::RestoreLink { link, previous } => f
                .debug_struct("RestoreLink")
                .field("link", link)
                .field("previous", previous)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl RollbackAction {
    pub fn custom(f: impl FnMut() -> anyhow::Result<()> + Send + 'static) -> Self {
        Self::Custom(Box::new(f))
    }

    fn run(&mut self) -> anyhow::Result<()> {
        match self {
            Self::RemoveFile(path) => match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
            Self::RemoveDir(path) => match std::fs::remove_dir_all(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
            Self::EmptyDir(path) => empty_dir(path),
            Self::RestorePath { from, to } => restore_path(from, to),
            Self::RestoreLink { link, previous } => match previous {
                Some(target) => crate::switch::point_link(link, target).map_err(Into::into),
                None => crate::switch::remove_link(link).map_err(Into::into),
            },
            Self::Custom(f) => f(),
        }
    }
}

fn empty_dir(path: &Path) -> anyhow::Result<()> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn restore_path(from: &Path, to: &Path) -> anyhow::Result<()> {
    if std::fs::symlink_metadata(to).is_ok() {
        if to.is_dir() {
            std::fs::remove_dir_all(to)?;
        } else {
            std::fs::remove_file(to)?;
        }
    }
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }

    // Cross-device: copy then delete.
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        let opts = fs_extra::dir::CopyOptions::new().content_only(true);
        fs_extra::dir::move_dir(from, to, &opts)
            .map_err(|e| anyhow::anyhow!("Failed to move {} back: {e}", from.display()))?;
    } else {
        std::fs::copy(from, to)?;
        std::fs::remove_file(from)?;
    }
    Ok(())
}

#[derive(Debug)]
struct LedgerEntry {
    description: String,
    action: RollbackAction,
    executed: bool,
}

/// One action that failed during rollback.
#[derive(Debug, Clone)]
pub struct RollbackFailure {
    pub index: usize,
    pub description: String,
    pub error: String,
}

#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("Rollback incomplete: {} of {attempted} actions failed", failures.len())]
    Partial {
        attempted: usize,
        failures: Vec<RollbackFailure>,
    },
}

impl RollbackError {
    pub fn failure_count(&self) -> usize {
        match self {
            Self::Partial { failures, .. } => failures.len(),
        }
    }

    pub fn failures(&self) -> &[RollbackFailure] {
        match self {
            Self::Partial { failures, .. } => failures,
        }
    }
}

impl From<RollbackError> for ClassifiedError {
    fn from(err: RollbackError) -> Self {
        let mut classified = ClassifiedError::new(ErrorKind::FileSystem, err.to_string())
            .with_context("rollback_failures", err.failure_count());
        for failure in err.failures() {
            classified = classified.with_context(
                format!("rollback[{}]", failure.index),
                format!("{}: {}", failure.description, failure.error),
            );
        }
        classified.with_cause(err)
    }
}

/// Ordered, append-only list of compensating actions for one installation attempt.
#[derive(Debug)]
pub struct RollbackLedger {
    entries: Vec<LedgerEntry>,
    enabled: bool,
}

impl Default for RollbackLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RollbackLedger {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            enabled: true,
        }
    }

    /// A ledger that records actions but never runs them.
    pub fn disabled() -> Self {
        Self {
            entries: Vec::new(),
            enabled: false,
        }
    }

    /// Append a compensating action. Returns its index.
    pub fn register(&mut self, description: impl Into<String>, action: RollbackAction) -> usize {
        let description = description.into();
        debug!(index = self.entries.len(), %description, "Registered rollback action");
        self.entries.push(LedgerEntry {
            description,
            action,
            executed: false,
        });
        self.entries.len() - 1
    }

    /// Current length; pass to [`execute_partial`](Self::execute_partial) later to
    /// undo only what is registered after this point.
    pub fn mark(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_executed(&self, index: usize) -> bool {
        self.entries.get(index).is_some_and(|e| e.executed)
    }

    /// Discard every entry without running it (the attempt succeeded).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Undo everything, newest first, then clear the ledger.
    ///
    /// Failures do not stop the walk; they are collected into one error.
    pub fn execute_all(&mut self) -> Result<usize, RollbackError> {
        let result = self.execute_from(0);
        self.entries.clear();
        result
    }

    /// Undo only entries at `from_index` and later, newest first.
    pub fn execute_partial(&mut self, from_index: usize) -> Result<usize, RollbackError> {
        self.execute_from(from_index)
    }

    fn execute_from(&mut self, from_index: usize) -> Result<usize, RollbackError> {
        if !self.enabled {
            debug!(entries = self.entries.len(), "Rollback disabled, skipping");
            return Ok(0);
        }

        let mut attempted = 0;
        let mut failures = Vec::new();

        for index in (from_index..self.entries.len()).rev() {
            let entry = &mut self.entries[index];
            if entry.executed {
                continue;
            }
            // Flag first: a failing action is never run a second time.
            entry.executed = true;
            attempted += 1;

            match entry.action.run() {
                Ok(()) => debug!(index, description = %entry.description, "Rolled back"),
                Err(e) => {
                    warn!(index, description = %entry.description, error = %e, "Rollback action failed");
                    failures.push(RollbackFailure {
                        index,
                        description: entry.description.clone(),
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(attempted)
        } else {
            Err(RollbackError::Partial {
                attempted,
                failures,
            })
        }
    }
}
