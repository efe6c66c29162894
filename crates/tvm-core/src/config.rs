//! User settings.
//!
//! Loaded from `settings.toml` in the tvm home, then overridden by `TVM_*`
//! environment variables. Command-line flags override both (see the CLI).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::{ClassifiedError, ErrorKind};
use tvm_schema::PRIMARY_SOURCE;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Malformed settings file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

impl From<ConfigError> for ClassifiedError {
    fn from(err: ConfigError) -> Self {
        let message = err.to_string();
        ClassifiedError::new(ErrorKind::Configuration, message).with_cause(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Source used when neither `--mirror` nor auto selection is requested.
    pub default_mirror: String,
    /// Probe sources and pick the fastest one for every install.
    pub auto_mirror: bool,
    /// Deadline for one whole installation attempt.
    pub timeout_seconds: u64,
    /// Fetch retries after the first attempt.
    pub max_retries: u32,
    /// How long a probe result stays fresh.
    pub probe_ttl_secs: u64,
    /// Shared deadline for one round of mirror probing.
    pub probe_timeout_secs: u64,
    /// Extraction workers; one per CPU when unset.
    pub workers: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_mirror: PRIMARY_SOURCE.to_string(),
            auto_mirror: false,
            timeout_seconds: 600,
            max_retries: 3,
            probe_ttl_secs: 300,
            probe_timeout_secs: 5,
            workers: None,
        }
    }
}

impl Settings {
    /// Read settings from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load from disk and apply the process environment.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        Self::load(path)?.apply_env(|var| std::env::var(var).ok())
    }

    /// Apply `TVM_MIRROR`, `TVM_AUTO_MIRROR`, `TVM_TIMEOUT` and `TVM_MAX_RETRIES`.
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(mirror) = lookup("TVM_MIRROR").filter(|m| !m.trim().is_empty()) {
            self.default_mirror = mirror.trim().to_string();
        }
        if let Some(value) = lookup("TVM_AUTO_MIRROR") {
            self.auto_mirror = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Some(value) = lookup("TVM_TIMEOUT") {
            self.timeout_seconds = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: "TVM_TIMEOUT",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("TVM_MAX_RETRIES") {
            self.max_retries = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: "TVM_MAX_RETRIES",
                value: value.clone(),
            })?;
        }
        Ok(self)
    }

    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.filter(|&w| w > 0).unwrap_or_else(num_cpus::get)
    }
}
