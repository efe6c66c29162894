//! Error taxonomy and classification.
//!
//! Every failure that leaves a pipeline component is turned into a
//! [`ClassifiedError`]. Components convert their own structured error enums
//! (see the `From` impls next to each enum); [`classify`] is the single entry
//! point for everything else and falls back to matching the error text.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;

use serde::Serialize;

use crate::recovery;

/// Closed set of failure categories. Control flow depends on this, never on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    FileSystem,
    Permission,
    Validation,
    Corrupted,
    Extraction,
    InsufficientSpace,
    UnsupportedPlatform,
    VersionExists,
    VersionNotFound,
    Configuration,
    NoAvailableSource,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::FileSystem => "filesystem",
            Self::Permission => "permission",
            Self::Validation => "validation",
            Self::Corrupted => "corrupted",
            Self::Extraction => "extraction",
            Self::InsufficientSpace => "insufficient_space",
            Self::UnsupportedPlatform => "unsupported_platform",
            Self::VersionExists => "version_exists",
            Self::VersionNotFound => "version_not_found",
            Self::Configuration => "configuration",
            Self::NoAvailableSource => "no_available_source",
            Self::Cancelled => "cancelled",
        }
    }

    /// One-line actionable hint shown under the error message.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Network => "Check network connectivity or pick another mirror with --mirror",
            Self::Timeout => "Retry with a larger --timeout or use --auto-mirror to find a faster source",
            Self::FileSystem => "Check that the tvm home directory exists and is writable",
            Self::Permission => "Check file permissions or choose a different --path",
            Self::Validation => "Check the version string and installation options",
            Self::Corrupted => "Retry the download; if it persists, verify the checksum or try another mirror",
            Self::Extraction => "Remove leftover files under the tvm tmp directory and retry",
            Self::InsufficientSpace => "Free disk space and retry",
            Self::UnsupportedPlatform => "No archive is published for this platform; install from source instead",
            Self::VersionExists => "Retry with --force to reinstall",
            Self::VersionNotFound => "Check the version number against the release list",
            Self::Configuration => "Check settings.toml and mirrors.json in the tvm home directory",
            Self::NoAvailableSource => "Check network connectivity or add a reachable mirror with `tvm sources add`",
            Self::Cancelled => "The operation was cancelled; rerun it to continue",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A raw failure wrapped into the taxonomy, with retry eligibility and diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    pub context: BTreeMap<String, String>,
    pub retryable: bool,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = recovery::is_retryable(kind, &message);
        Self {
            kind,
            message,
            cause: None,
            context: BTreeMap::new(),
            retryable,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn suggestion(&self) -> &'static str {
        self.kind.suggestion()
    }

    /// Multi-line report used by verbose output: kind, context and the cause chain.
    pub fn verbose_report(&self) -> String {
        let mut out = format!("{} [{}]\n  hint: {}", self.message, self.kind, self.suggestion());
        for (key, value) in &self.context {
            let _ = write!(out, "\n  {key}: {value}");
        }
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            let _ = write!(out, "\n  caused by: {err}");
            source = err.source();
        }
        out
    }
}

impl From<io::Error> for ClassifiedError {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind as Io;

        let (kind, transient) = match err.kind() {
            Io::PermissionDenied | Io::ReadOnlyFilesystem => (ErrorKind::Permission, false),
            Io::StorageFull => (ErrorKind::InsufficientSpace, false),
            Io::TimedOut => (ErrorKind::Timeout, false),
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::HostUnreachable
            | Io::NetworkUnreachable
            | Io::AddrNotAvailable => (ErrorKind::Network, false),
            Io::InvalidData | Io::UnexpectedEof => (ErrorKind::Corrupted, false),
            Io::ResourceBusy | Io::WouldBlock | Io::Interrupted => (ErrorKind::FileSystem, true),
            _ => (ErrorKind::FileSystem, false),
        };

        let message = if transient {
            format!("Temporary filesystem condition: {err}")
        } else {
            err.to_string()
        };
        let retryable = recovery::is_retryable(kind, &message);
        Self::new(kind, message)
            .with_retryable(retryable)
            .with_cause(err)
    }
}

impl From<tvm_schema::VersionError> for ClassifiedError {
    fn from(err: tvm_schema::VersionError) -> Self {
        Self::new(ErrorKind::Validation, err.to_string())
            .with_retryable(false)
            .with_cause(err)
    }
}

/// Classify any error: already-classified errors pass through unchanged,
/// known component errors map by variant, everything else by its text.
pub fn classify(err: anyhow::Error) -> ClassifiedError {
    let err = match err.downcast::<ClassifiedError>() {
        Ok(classified) => return classified,
        Err(e) => e,
    };
    let err = match err.downcast::<crate::io::fetch::FetchError>() {
        Ok(e) => return e.into(),
        Err(e) => e,
    };
    let err = match err.downcast::<crate::io::verify::VerifyError>() {
        Ok(e) => return e.into(),
        Err(e) => e,
    };
    let err = match err.downcast::<crate::io::extract::ExtractError>() {
        Ok(e) => return e.into(),
        Err(e) => e,
    };
    let err = match err.downcast::<crate::mirror::MirrorError>() {
        Ok(e) => return e.into(),
        Err(e) => e,
    };
    let err = match err.downcast::<crate::resolve::ResolveError>() {
        Ok(e) => return e.into(),
        Err(e) => e,
    };
    let err = match err.downcast::<crate::store::StoreError>() {
        Ok(e) => return e.into(),
        Err(e) => e,
    };
    let err = match err.downcast::<crate::rollback::RollbackError>() {
        Ok(e) => return e.into(),
        Err(e) => e,
    };
    let err = match err.downcast::<crate::config::ConfigError>() {
        Ok(e) => return e.into(),
        Err(e) => e,
    };
    let err = match err.downcast::<tvm_schema::VersionError>() {
        Ok(e) => return e.into(),
        Err(e) => e,
    };
    let err = match err.downcast::<io::Error>() {
        Ok(e) => return e.into(),
        Err(e) => e,
    };

    let message = format!("{err:#}");
    ClassifiedError::new(classify_message(&message), message).with_cause(err)
}

/// Message signatures, checked in order. The first hit wins.
const SIGNATURES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::InsufficientSpace,
        &["no space", "disk full", "not enough space", "quota exceeded"],
    ),
    (
        ErrorKind::Permission,
        &["permission denied", "access denied", "access is denied", "operation not permitted"],
    ),
    (ErrorKind::Cancelled, &["cancelled", "canceled"]),
    (ErrorKind::Timeout, &["timed out", "timeout", "deadline"]),
    (
        ErrorKind::Network,
        &[
            "connection refused",
            "connection reset",
            "connection closed",
            "dns",
            "failed to lookup",
            "could not resolve",
            "unreachable",
            "network",
            "tls",
            "certificate",
        ],
    ),
    (
        ErrorKind::Corrupted,
        &["checksum", "hash mismatch", "corrupt", "invalid header", "bad magic"],
    ),
    (
        ErrorKind::Extraction,
        &["extract", "unpack", "invalid archive", "zip archive", "tar archive", "gzip"],
    ),
    (ErrorKind::VersionExists, &["already exists", "already installed"]),
    (ErrorKind::VersionNotFound, &["not found", "404"]),
    (
        ErrorKind::UnsupportedPlatform,
        &["unsupported platform", "unsupported architecture"],
    ),
    (
        ErrorKind::FileSystem,
        &["no such file", "directory", "file", "read-only", "busy", "temporar", "i/o"],
    ),
];

/// Best-matching kind for an error message, `Configuration` when nothing matches.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    SIGNATURES
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map_or(ErrorKind::Configuration, |(kind, _)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_signatures() {
        assert_eq!(classify_message("dial tcp: connection refused"), ErrorKind::Network);
        assert_eq!(classify_message("checksum mismatch for archive"), ErrorKind::Corrupted);
        assert_eq!(classify_message("write failed: disk full"), ErrorKind::InsufficientSpace);
        assert_eq!(classify_message("No space left on device"), ErrorKind::InsufficientSpace);
        assert_eq!(classify_message("operation timed out"), ErrorKind::Timeout);
        assert_eq!(classify_message("version directory already exists"), ErrorKind::VersionExists);
        assert_eq!(classify_message("something odd happened"), ErrorKind::Configuration);
    }

    #[test]
    fn classified_passes_through_unchanged() {
        let original = ClassifiedError::new(ErrorKind::Extraction, "bad entry")
            .with_context("entry", "go/bin/go")
            .with_retryable(true);
        let classified = classify(anyhow::Error::new(original));
        assert_eq!(classified.kind, ErrorKind::Extraction);
        assert_eq!(classified.message, "bad entry");
        assert_eq!(classified.context.get("entry").map(String::as_str), Some("go/bin/go"));
        assert!(classified.retryable);
    }

    #[test]
    fn unmatched_text_falls_back_to_configuration() {
        let classified = classify(anyhow::anyhow!("mysterious"));
        assert_eq!(classified.kind, ErrorKind::Configuration);
        assert!(!classified.retryable);
        assert!(classified.cause.is_some());
    }

    #[test]
    fn io_errors_map_structurally() {
        let denied = ClassifiedError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.kind, ErrorKind::Permission);

        let busy = ClassifiedError::from(io::Error::from(io::ErrorKind::ResourceBusy));
        assert_eq!(busy.kind, ErrorKind::FileSystem);
        assert!(busy.retryable);

        let missing = ClassifiedError::from(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(missing.kind, ErrorKind::FileSystem);
        assert!(!missing.retryable);
    }

    #[test]
    fn verbose_report_includes_context_and_cause() {
        let err = ClassifiedError::new(ErrorKind::Corrupted, "checksum mismatch")
            .with_context("expected", "abc")
            .with_context("actual", "def")
            .with_cause(io::Error::other("underlying"));
        let report = err.verbose_report();
        assert!(report.contains("[corrupted]"));
        assert!(report.contains("expected: abc"));
        assert!(report.contains("caused by: underlying"));
    }
}
