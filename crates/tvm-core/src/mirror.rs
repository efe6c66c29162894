//! Download source registry and latency-based mirror selection.
//!
//! Sources are the built-in set plus user additions persisted in
//! `mirrors.json`. Probing fans out over every candidate with one shared
//! deadline; results are cached per source name for a TTL.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use reqwest::{Client, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ClassifiedError, ErrorKind};
use tvm_schema::{DownloadSource, MirrorProbeResult, builtin_sources};

/// Default lifetime of a probe result.
pub const DEFAULT_PROBE_TTL: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("A source named '{0}' already exists")]
    DuplicateName(String),

    #[error("'{0}' is a built-in source and cannot be removed")]
    BuiltinImmutable(String),

    #[error("No custom source named '{0}'")]
    NotFound(String),

    #[error("Invalid source '{name}': {reason}")]
    InvalidSource { name: String, reason: String },

    #[error("No available source among {tried} candidates")]
    NoAvailableSource { tried: usize },

    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed mirror configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl From<MirrorError> for ClassifiedError {
    fn from(err: MirrorError) -> Self {
        let kind = match &err {
            MirrorError::DuplicateName(_)
            | MirrorError::BuiltinImmutable(_)
            | MirrorError::NotFound(_)
            | MirrorError::InvalidSource { .. } => ErrorKind::Validation,
            MirrorError::NoAvailableSource { .. } => ErrorKind::NoAvailableSource,
            MirrorError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                _ => ErrorKind::FileSystem,
            },
            MirrorError::Parse { .. } => ErrorKind::Configuration,
        };
        ClassifiedError::new(kind, err.to_string()).with_cause(err)
    }
}

/// Answers "is this URL reachable, and with which status".
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Returns the HTTP status of a lightweight request to `url`.
    async fn probe(&self, url: &str) -> anyhow::Result<u16>;
}

/// HEAD probe, retried as a GET (body discarded) when HEAD is answered with 405.
#[derive(Debug, Clone, Default)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProbeTransport for HttpProbe {
    async fn probe(&self, url: &str) -> anyhow::Result<u16> {
        let response = self
            .client
            .head(url)
            .header(header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await?;
        if response.status() != StatusCode::METHOD_NOT_ALLOWED {
            return Ok(response.status().as_u16());
        }
        let response = self
            .client
            .get(url)
            .header(header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

/// A probe result and the wall-clock time it was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProbe {
    pub result: MirrorProbeResult,
    pub probed_at_ms: i64,
}

impl CachedProbe {
    fn is_fresh(&self, now_ms: i64, ttl: Duration) -> bool {
        let age = now_ms - self.probed_at_ms;
        age >= 0 && (age as u128) < ttl.as_millis()
    }
}

/// On-disk form of `mirrors.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub custom_sources: Vec<DownloadSource>,
    #[serde(default)]
    pub probe_cache: BTreeMap<String, CachedProbe>,
}

pub struct MirrorSelector {
    builtin: Vec<DownloadSource>,
    custom: Vec<DownloadSource>,
    cache: RwLock<HashMap<String, CachedProbe>>,
    ttl: Duration,
    transport: Arc<dyn ProbeTransport>,
}

impl std::fmt::Debug for MirrorSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSelector")
            .field("builtin", &self.builtin.len())
            .field("custom", &self.custom)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl MirrorSelector {
    /// Built-in sources only, empty cache.
    pub fn new(transport: Arc<dyn ProbeTransport>) -> Self {
        Self {
            builtin: builtin_sources(),
            custom: Vec::new(),
            cache: RwLock::new(HashMap::new()),
            ttl: DEFAULT_PROBE_TTL,
            transport,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace the built-in set. Used by tests to point at local servers.
    pub fn with_builtin(mut self, builtin: Vec<DownloadSource>) -> Self {
        self.builtin = builtin;
        self
    }

    /// Load custom sources and cached probes from `path`. A missing file loads as empty.
    pub fn load(path: &Path, transport: Arc<dyn ProbeTransport>) -> Result<Self, MirrorError> {
        let mut selector = Self::new(transport);
        let config = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<SourceConfig>(&content).map_err(|source| MirrorError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SourceConfig::default(),
            Err(source) => {
                return Err(MirrorError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        for source in config.custom_sources {
            if let Err(e) = selector.add_custom(source) {
                warn!(error = %e, "Ignoring custom source from {}", path.display());
            }
        }
        *selector.cache.write().unwrap_or_else(PoisonError::into_inner) = config.probe_cache.into_iter().collect();
        Ok(selector)
    }

    /// Persist custom sources and the probe cache to `path`.
    pub fn save(&self, path: &Path) -> Result<(), MirrorError> {
        let io_err = |source| MirrorError::Io {
            path: path.to_path_buf(),
            source,
        };
        let config = SourceConfig {
            custom_sources: self.custom.clone(),
            probe_cache: self
                .cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&config).map_err(|source| MirrorError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }

    /// Built-in and custom sources, ascending by priority. Ties keep insertion order, built-ins first.
    pub fn list_sources(&self) -> Vec<DownloadSource> {
        let mut all: Vec<DownloadSource> = self.builtin.iter().chain(&self.custom).cloned().collect();
        all.sort_by_key(|s| s.priority);
        all
    }

    pub fn find(&self, name: &str) -> Option<&DownloadSource> {
        self.builtin.iter().chain(&self.custom).find(|s| s.name == name)
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtin.iter().any(|s| s.name == name)
    }

    pub fn custom_sources(&self) -> &[DownloadSource] {
        &self.custom
    }

    pub fn add_custom(&mut self, source: DownloadSource) -> Result<(), MirrorError> {
        let name = source.name.trim();
        if name.is_empty() {
            return Err(MirrorError::InvalidSource {
                name: source.name.clone(),
                reason: "name is empty".into(),
            });
        }
        let valid_url = Url::parse(&source.base_url)
            .is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.has_host());
        if !valid_url {
            return Err(MirrorError::InvalidSource {
                name: source.name.clone(),
                reason: format!("'{}' is not an absolute http(s) URL", source.base_url),
            });
        }
        if self.find(name).is_some() {
            return Err(MirrorError::DuplicateName(name.to_string()));
        }
        debug!(name, url = %source.base_url, "Added custom source");
        self.custom.push(source);
        Ok(())
    }

    pub fn remove_custom(&mut self, name: &str) -> Result<DownloadSource, MirrorError> {
        if self.is_builtin(name) {
            return Err(MirrorError::BuiltinImmutable(name.to_string()));
        }
        let index = self
            .custom
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| MirrorError::NotFound(name.to_string()))?;
        self.cache.write().unwrap_or_else(PoisonError::into_inner).remove(name);
        Ok(self.custom.remove(index))
    }

    pub fn clear_cache(&self) {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Fresh cached result for `name`, if any.
    pub fn cached(&self, name: &str) -> Option<MirrorProbeResult> {
        let now = Utc::now().timestamp_millis();
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .filter(|entry| entry.is_fresh(now, self.ttl))
            .map(|entry| entry.result.clone())
    }

    /// Probe one source, answering from the cache while the entry is fresh.
    pub async fn probe(&self, source: &DownloadSource, deadline: Instant) -> MirrorProbeResult {
        if let Some(hit) = self.cached(&source.name) {
            debug!(source = %source.name, "Probe cache hit");
            return hit;
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout_at(deadline, self.transport.probe(&source.base_url)).await;
        let elapsed = started.elapsed();
        let result = match outcome {
            Ok(Ok(status)) if (200..400).contains(&status) => MirrorProbeResult::available(&source.name, elapsed),
            Ok(Ok(status)) => MirrorProbeResult::unavailable(&source.name, elapsed, format!("HTTP {status}")),
            Ok(Err(e)) => MirrorProbeResult::unavailable(&source.name, elapsed, format!("{e:#}")),
            Err(_) => MirrorProbeResult::unavailable(&source.name, elapsed, "probe deadline exceeded"),
        };
        debug!(
            source = %source.name,
            available = result.available,
            ms = elapsed.as_millis() as u64,
            "Probed source"
        );

        self.cache.write().unwrap_or_else(PoisonError::into_inner).insert(
            source.name.clone(),
            CachedProbe {
                result: result.clone(),
                probed_at_ms: Utc::now().timestamp_millis(),
            },
        );
        result
    }

    /// Probe every source concurrently under one deadline. Results keep input order.
    pub async fn probe_all(&self, sources: &[DownloadSource], deadline: Instant) -> Vec<MirrorProbeResult> {
        join_all(sources.iter().map(|s| self.probe(s, deadline))).await
    }

    /// Available sources, fastest first. Equal times keep probe order.
    pub async fn select_ranked(
        &self,
        sources: &[DownloadSource],
        deadline: Instant,
    ) -> Result<Vec<(DownloadSource, MirrorProbeResult)>, MirrorError> {
        let results = self.probe_all(sources, deadline).await;
        let mut ranked: Vec<_> = sources
            .iter()
            .cloned()
            .zip(results)
            .filter(|(_, r)| r.available)
            .collect();
        if ranked.is_empty() {
            return Err(MirrorError::NoAvailableSource { tried: sources.len() });
        }
        ranked.sort_by_key(|(_, r)| r.response_time);
        Ok(ranked)
    }

    /// The single fastest available source.
    pub async fn select_fastest(
        &self,
        sources: &[DownloadSource],
        deadline: Instant,
    ) -> Result<(DownloadSource, MirrorProbeResult), MirrorError> {
        let mut ranked = self.select_ranked(sources, deadline).await?;
        Ok(ranked.remove(0))
    }
}
