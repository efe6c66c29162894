//! Resumable streaming download.
//!
//! A partial file already on disk is continued with a `Range` request. Servers
//! that ignore the range (200) or reject it (416) cause a restart from zero.
//! Transport failures are retried with backoff; each retry re-reads the on-disk
//! length so it resumes from wherever the previous attempt stopped.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ClassifiedError, ErrorKind};
use crate::recovery::RetryPolicy;
use crate::reporter::ProgressSink;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Download timed out: deadline exceeded")]
    Timeout,

    #[error("Body exceeds advertised size: expected {expected} bytes, received {received}")]
    Oversized { expected: u64, received: u64 },

    #[error("Connection closed early: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("{last} (after {attempts} attempts)")]
    Exhausted { attempts: u32, last: Box<FetchError> },
}

fn status_retryable(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

impl FetchError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.status().is_none_or(|s| status_retryable(s.as_u16())),
            Self::Status { status, .. } => status_retryable(*status),
            Self::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::StorageFull
                    | std::io::ErrorKind::ReadOnlyFilesystem
            ),
            Self::Truncated { .. } => true,
            Self::Cancelled | Self::Timeout | Self::Oversized { .. } | Self::Exhausted { .. } => false,
        }
    }
}

fn classify_status(status: u16, message: String) -> ClassifiedError {
    let kind = match status {
        404 | 410 => ErrorKind::VersionNotFound,
        408 => ErrorKind::Timeout,
        401 | 403 => ErrorKind::Permission,
        _ => ErrorKind::Network,
    };
    ClassifiedError::new(kind, message)
        .with_context("status", status)
        .with_retryable(status_retryable(status))
}

impl From<FetchError> for ClassifiedError {
    fn from(err: FetchError) -> Self {
        let err = match err {
            FetchError::Exhausted { attempts, last } => {
                let message = format!("{last} (after {attempts} attempts)");
                let mut classified = ClassifiedError::from(*last).with_context("attempts", attempts);
                classified.message = message;
                return classified;
            }
            FetchError::Io(e) => return ClassifiedError::from(e),
            other => other,
        };

        let message = err.to_string();
        let mut context: Vec<(&str, String)> = Vec::new();
        let classified = match &err {
            FetchError::Status { status, url } => {
                context.push(("url", url.clone()));
                classify_status(*status, message)
            }
            FetchError::Http(e) => {
                if let Some(url) = e.url() {
                    context.push(("url", url.to_string()));
                }
                if let Some(status) = e.status() {
                    classify_status(status.as_u16(), message)
                } else if e.is_timeout() {
                    ClassifiedError::new(ErrorKind::Timeout, message)
                } else {
                    ClassifiedError::new(ErrorKind::Network, message)
                }
            }
            FetchError::Cancelled => ClassifiedError::new(ErrorKind::Cancelled, message),
            FetchError::Timeout => ClassifiedError::new(ErrorKind::Timeout, message).with_retryable(false),
            FetchError::Oversized { expected, received } => {
                context.push(("expected_bytes", expected.to_string()));
                context.push(("received_bytes", received.to_string()));
                ClassifiedError::new(ErrorKind::Corrupted, message)
            }
            FetchError::Truncated { expected, received } => {
                context.push(("expected_bytes", expected.to_string()));
                context.push(("received_bytes", received.to_string()));
                ClassifiedError::new(ErrorKind::Network, message)
            }
            // Unwrapped above.
            FetchError::Io(_) => ClassifiedError::new(ErrorKind::FileSystem, message),
            FetchError::Exhausted { .. } => ClassifiedError::new(ErrorKind::Network, message),
        };

        context
            .into_iter()
            .fold(classified, |c, (key, value)| c.with_context(key, value))
            .with_cause(err)
    }
}

/// Called before each retry with `(attempt, delay, reason)`.
pub type RetryHook = Box<dyn Fn(u32, Duration, &str) + Send + Sync>;

pub struct FetchOptions {
    pub retry: RetryPolicy,
    /// Minimum spacing between progress callbacks.
    pub progress_interval: Duration,
    /// Hard deadline for the whole fetch including retries.
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
    pub on_retry: Option<RetryHook>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            progress_interval: Duration::from_millis(100),
            deadline: None,
            cancel: CancellationToken::new(),
            on_retry: None,
        }
    }
}

impl std::fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOptions")
            .field("retry", &self.retry)
            .field("progress_interval", &self.progress_interval)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Transfer statistics for one fetch, finalized when it terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadStats {
    pub url: String,
    pub file_path: PathBuf,
    /// Full size of the file, when the server told us.
    pub file_size: Option<u64>,
    /// Bytes on disk, including any resumed prefix.
    pub downloaded: u64,
    /// Bytes that were already on disk when the last successful attempt started.
    pub resumed_from: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Bytes per second over the whole fetch.
    pub average_speed: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    pub retry_count: u32,
    pub supports_resume: bool,
    #[serde(skip)]
    speed_samples: u64,
}

impl DownloadStats {
    fn new(url: &str, file_path: &Path) -> Self {
        Self {
            url: url.to_string(),
            file_path: file_path.to_path_buf(),
            file_size: None,
            downloaded: 0,
            resumed_from: 0,
            start_time: Utc::now(),
            end_time: None,
            average_speed: 0.0,
            min_speed: 0.0,
            max_speed: 0.0,
            retry_count: 0,
            supports_resume: false,
            speed_samples: 0,
        }
    }

    fn record_speed(&mut self, speed: f64) {
        if !speed.is_finite() {
            return;
        }
        if self.speed_samples == 0 {
            self.min_speed = speed;
            self.max_speed = speed;
        } else {
            self.min_speed = self.min_speed.min(speed);
            self.max_speed = self.max_speed.max(speed);
        }
        self.speed_samples += 1;
    }

    fn finish(&mut self) {
        let end = Utc::now();
        let elapsed = (end - self.start_time).num_milliseconds().max(1) as f64 / 1000.0;
        self.average_speed = self.downloaded.saturating_sub(self.resumed_from) as f64 / elapsed;
        self.end_time = Some(end);
    }

    /// Wall-clock duration, once finished.
    pub fn duration(&self) -> Option<Duration> {
        self.end_time
            .and_then(|end| (end - self.start_time).to_std().ok())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Run `fut` unless the token fires or the deadline passes first.
async fn guarded<F: Future>(opts: &FetchOptions, fut: F) -> Result<F::Output, FetchError> {
    tokio::select! {
        biased;
        () = opts.cancel.cancelled() => Err(FetchError::Cancelled),
        () = sleep_until_opt(opts.deadline) => Err(FetchError::Timeout),
        out = fut => Ok(out),
    }
}

async fn on_disk_len(path: &Path) -> Result<u64, FetchError> {
    match tokio::fs::metadata(path).await {
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Total size from `Content-Range: bytes a-b/total`.
fn content_range_total(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}

/// Drops updates below the furthest byte count already reported, so a retry
/// or a restart from zero never moves the caller's progress backwards.
struct HighWater<'a> {
    inner: &'a dyn ProgressSink,
    reported: AtomicU64,
}

impl ProgressSink for HighWater<'_> {
    fn progress(&self, current: u64, total: Option<u64>, rate: f64) {
        if self.reported.fetch_max(current, Ordering::Relaxed) <= current {
            self.inner.progress(current, total, rate);
        }
    }
}

/// Download `url` to `dest`, continuing any partial file already there.
///
/// Progress is non-decreasing across retries. On failure the partial file is
/// left in place; removing it is the caller's job.
pub async fn fetch(
    client: &Client,
    url: &str,
    dest: &Path,
    progress: &dyn ProgressSink,
    opts: &FetchOptions,
) -> Result<DownloadStats, FetchError> {
    let mut stats = DownloadStats::new(url, dest);
    let mut attempt = 0u32;
    let progress = HighWater {
        inner: progress,
        reported: AtomicU64::new(0),
    };

    loop {
        match fetch_once(client, url, dest, &progress, opts, &mut stats).await {
            Ok(()) => {
                stats.finish();
                debug!(
                    url,
                    bytes = stats.downloaded,
                    retries = stats.retry_count,
                    "Download complete"
                );
                return Ok(stats);
            }
            Err(e) if !e.is_retryable() || attempt >= opts.retry.max_retries => {
                stats.finish();
                return Err(if attempt == 0 {
                    e
                } else {
                    FetchError::Exhausted {
                        attempts: attempt + 1,
                        last: Box::new(e),
                    }
                });
            }
            Err(e) => {
                let delay = opts.retry.delay(attempt);
                let reason = e.to_string();
                warn!(url, attempt = attempt + 1, ?delay, error = %reason, "Download failed, retrying");
                if let Some(hook) = &opts.on_retry {
                    hook(attempt + 1, delay, &reason);
                }
                guarded(opts, tokio::time::sleep(delay)).await?;
                attempt += 1;
                stats.retry_count = attempt;
            }
        }
    }
}

async fn fetch_once(
    client: &Client,
    url: &str,
    dest: &Path,
    progress: &dyn ProgressSink,
    opts: &FetchOptions,
    stats: &mut DownloadStats,
) -> Result<(), FetchError> {
    let mut offset = on_disk_len(dest).await?;

    let response = loop {
        let mut request = client.get(url).header(header::USER_AGENT, crate::USER_AGENT);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }
        let response = guarded(opts, request.send()).await??;

        match response.status() {
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                debug!(url, offset, "Range rejected, discarding partial file");
                tokio::fs::remove_file(dest).await?;
                offset = 0;
                stats.supports_resume = false;
            }
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                debug!(url, offset, "Resuming download");
                stats.supports_resume = true;
                break response;
            }
            status if status.is_success() => {
                if offset > 0 {
                    debug!(url, offset, "Server ignored range, restarting from zero");
                    offset = 0;
                    stats.supports_resume = false;
                }
                break response;
            }
            status => {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
        }
    };

    let total = if offset > 0 {
        content_range_total(response.headers()).or_else(|| response.content_length().map(|len| len + offset))
    } else {
        response.content_length()
    };
    stats.file_size = total;
    stats.resumed_from = offset;
    stats.downloaded = offset;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(offset > 0)
        .truncate(offset == 0)
        .open(dest)
        .await?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();

    let started = Instant::now();
    let mut window_start = started;
    let mut window_bytes = 0u64;
    let mut downloaded = offset;
    progress.progress(downloaded, total, 0.0);

    loop {
        let next = tokio::select! {
            biased;
            () = opts.cancel.cancelled() => {
                writer.flush().await.ok();
                return Err(FetchError::Cancelled);
            }
            () = sleep_until_opt(opts.deadline) => {
                writer.flush().await.ok();
                return Err(FetchError::Timeout);
            }
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                writer.flush().await.ok();
                stats.downloaded = downloaded;
                return Err(e.into());
            }
        };

        let len = chunk.len() as u64;
        if total.is_some_and(|t| downloaded + len > t) {
            writer.flush().await.ok();
            return Err(FetchError::Oversized {
                expected: total.unwrap_or_default(),
                received: downloaded + len,
            });
        }
        writer.write_all(&chunk).await?;
        downloaded += len;
        window_bytes += len;
        stats.downloaded = downloaded;

        let elapsed = window_start.elapsed();
        if elapsed >= opts.progress_interval {
            let speed = window_bytes as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
            stats.record_speed(speed);
            progress.progress(downloaded, total, speed);
            window_start = Instant::now();
            window_bytes = 0;
        }
    }
    writer.flush().await?;

    if let Some(expected) = total.filter(|&t| downloaded < t) {
        return Err(FetchError::Truncated {
            expected,
            received: downloaded,
        });
    }

    let speed = (downloaded - offset) as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON);
    stats.record_speed(speed);
    progress.progress(downloaded, total, speed);
    Ok(())
}

/// Fetch a small text document (checksum sidecars). Not resumed, not retried.
pub async fn fetch_text(client: &Client, url: &str, opts: &FetchOptions) -> Result<String, FetchError> {
    let response = guarded(
        opts,
        client.get(url).header(header::USER_AGENT, crate::USER_AGENT).send(),
    )
    .await??;
    if !response.status().is_success() {
        return Err(FetchError::Status {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }
    Ok(guarded(opts, response.text()).await??)
}
