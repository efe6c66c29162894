//! The installation orchestrator.
//!
//! One call to [`Installer::install`] walks a single attempt through
//!
//! ```text
//! Pending -> Downloading -> Extracting -> Configuring -> Completed
//!    \___________\______________\______________\-----> Failed | Cancelled
//! ```
//!
//! Every mutating step registers its compensating action on a
//! [`RollbackLedger`] before (or right after) it touches disk. Any failure is
//! classified, the ledger is walked backwards, and the partial
//! [`InstallationResult`] is returned with the error attached.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{ClassifiedError, ErrorKind};
use crate::io::extract::{self, ExtractInfo, ExtractOptions};
use crate::io::fetch::{self, DownloadStats, FetchOptions, RetryHook};
use crate::io::verify::{self, DigestLimits, ValidationResult};
use crate::mirror::MirrorSelector;
use crate::ops::context::{InstallOptions, InstallationContext, InstallationStatus};
use crate::paths::Layout;
use crate::recovery::RetryPolicy;
use crate::reporter::Reporter;
use crate::resolve::resolve_target;
use crate::rollback::{RollbackAction, RollbackLedger};
use crate::store::VersionStore;
use crate::switch;
use tvm_schema::{HashAlgorithm, Platform, ToolchainVersion, VersionRecord};

/// What an attempt produced. On failure the fields reached so far are filled in.
#[derive(Debug)]
pub struct InstallationResult {
    pub success: bool,
    pub version: ToolchainVersion,
    pub path: Option<PathBuf>,
    /// Source the archive was finally fetched from.
    pub source: Option<String>,
    pub duration: Duration,
    pub download_stats: Option<DownloadStats>,
    pub extract_info: Option<ExtractInfo>,
    pub validation: Option<ValidationResult>,
    pub error: Option<ClassifiedError>,
}

impl InstallationResult {
    fn new(version: &ToolchainVersion) -> Self {
        Self {
            success: false,
            version: version.clone(),
            path: None,
            source: None,
            duration: Duration::ZERO,
            download_stats: None,
            extract_info: None,
            validation: None,
            error: None,
        }
    }

    /// Split into `Ok(result)` or the classified error.
    pub fn into_result(mut self) -> Result<Self, ClassifiedError> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Outcome of the archive checks made before extraction.
#[derive(Debug, Default)]
struct ArchiveCheck {
    checksum_ok: bool,
    archive_ok: bool,
    detail: String,
    sha256: Option<String>,
}

/// Drives installations. Cheap to share; every attempt owns its own context and ledger.
pub struct Installer {
    layout: Layout,
    settings: Settings,
    selector: Arc<MirrorSelector>,
    store: Arc<dyn VersionStore>,
    client: Client,
    /// `None` when the host is not a published platform and none was set.
    platform: Option<Platform>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("layout", &self.layout)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

async fn run_blocking<T, E>(task: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, ClassifiedError>
where
    T: Send + 'static,
    E: Into<ClassifiedError> + Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result.map_err(Into::into),
        Err(e) => Err(ClassifiedError::new(
            ErrorKind::FileSystem,
            format!("Background task failed: {e}"),
        )),
    }
}

fn dir_has_entries(path: &std::path::Path) -> bool {
    std::fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_some())
}

impl Installer {
    pub fn new(layout: Layout, selector: Arc<MirrorSelector>, store: Arc<dyn VersionStore>, client: Client) -> Self {
        Self {
            layout,
            settings: Settings::default(),
            selector,
            store,
            client,
            platform: Platform::current().ok(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Install for another platform than the host.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Cancelling `token` stops every attempt run by this installer.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Install `version`. Never panics on failure; the error is in the result.
    pub async fn install(
        &self,
        version: &ToolchainVersion,
        options: &InstallOptions,
        reporter: Arc<dyn Reporter>,
    ) -> InstallationResult {
        let started = std::time::Instant::now();
        let mut result = InstallationResult::new(version);
        info!(%version, mirror = %options.mirror, auto_mirror = options.auto_mirror, "Starting installation");

        let mut ctx = match self.prepare(version, options) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(%version, kind = %err.kind, "Installation rejected: {}", err.message);
                reporter.failed(version, &err.message);
                result.duration = started.elapsed();
                result.error = Some(err);
                return result;
            }
        };

        let mut ledger = RollbackLedger::new();
        let outcome = self.run(&mut ctx, &mut ledger, &mut result, &reporter).await;
        result.duration = started.elapsed();

        match outcome {
            Ok(()) => {
                ledger.clear();
                if let Err(e) = std::fs::remove_dir_all(&ctx.temp_dir) {
                    debug!(error = %e, "Could not remove attempt directory");
                }
                result.success = true;
                result.path = Some(ctx.version_dir.clone());
                info!(%version, path = %ctx.version_dir.display(), "Installation completed");
                reporter.done(version, &ctx.version_dir, result.duration.as_secs_f64());
            }
            Err(mut err) => {
                let terminal = if err.kind == ErrorKind::Cancelled {
                    InstallationStatus::Cancelled
                } else {
                    InstallationStatus::Failed
                };
                if ctx.transition(terminal).is_ok() {
                    reporter.stage(version, terminal);
                }
                warn!(%version, kind = %err.kind, entries = ledger.len(), "Installation failed, rolling back");
                match ledger.execute_all() {
                    Ok(undone) => debug!(undone, "Rollback finished"),
                    Err(rollback) => {
                        warn!(error = %rollback, "Rollback incomplete");
                        err = err
                            .with_context("rollback", &rollback)
                            .with_context("rollback_failures", rollback.failure_count());
                    }
                }
                reporter.failed(version, &err.message);
                result.error = Some(err);
            }
        }
        result
    }

    fn platform(&self) -> Result<Platform, ClassifiedError> {
        self.platform.ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::UnsupportedPlatform,
                format!(
                    "Unsupported platform {}-{}",
                    std::env::consts::OS,
                    std::env::consts::ARCH
                ),
            )
        })
    }

    /// Everything that can fail before the first mutation: options, target, claim, existing install.
    fn prepare(&self, version: &ToolchainVersion, options: &InstallOptions) -> Result<InstallationContext, ClassifiedError> {
        options.validate()?;
        let target = resolve_target(version, self.platform()?, &options.mirror, &self.selector.list_sources())?;
        let ctx = InstallationContext::new(&self.layout, target, options.clone())?;

        let recorded = self.store.contains(version)?;
        let populated = dir_has_entries(&ctx.version_dir);
        if (recorded || populated) && !options.force {
            return Err(ClassifiedError::new(
                ErrorKind::VersionExists,
                format!("Version {version} is already installed"),
            )
            .with_context("path", ctx.version_dir.display()));
        }
        Ok(ctx)
    }

    fn check_cancelled(&self) -> Result<(), ClassifiedError> {
        if self.cancel.is_cancelled() {
            return Err(ClassifiedError::new(ErrorKind::Cancelled, "Installation cancelled"));
        }
        Ok(())
    }

    fn enter(
        &self,
        ctx: &mut InstallationContext,
        next: InstallationStatus,
        reporter: &Arc<dyn Reporter>,
    ) -> Result<(), ClassifiedError> {
        self.check_cancelled()?;
        ctx.transition(next)?;
        reporter.stage(&ctx.version, next);
        Ok(())
    }

    async fn run(
        &self,
        ctx: &mut InstallationContext,
        ledger: &mut RollbackLedger,
        result: &mut InstallationResult,
        reporter: &Arc<dyn Reporter>,
    ) -> Result<(), ClassifiedError> {
        let deadline = (ctx.options.timeout_seconds > 0)
            .then(|| Instant::now() + Duration::from_secs(ctx.options.timeout_seconds));

        self.enter(ctx, InstallationStatus::Downloading, reporter)?;
        let stats = self.download(ctx, ledger, deadline, reporter).await?;
        result.source = Some(ctx.target.source_name.clone());
        result.download_stats = Some(stats);
        let check = self.check_archive(ctx, deadline, reporter).await?;

        self.enter(ctx, InstallationStatus::Extracting, reporter)?;
        let previous_record = self.back_up_existing(ctx, ledger)?;
        result.extract_info = Some(self.extract(ctx, ledger, deadline, reporter).await?);

        self.enter(ctx, InstallationStatus::Configuring, reporter)?;
        let validation = self.validate(ctx, &check).await?;
        let valid = validation.valid;
        let errors = validation.errors.join("; ");
        result.validation = Some(validation);
        if !valid && !ctx.options.skip_verification {
            return Err(ClassifiedError::new(
                ErrorKind::Corrupted,
                format!("Installed toolchain failed validation: {errors}"),
            )
            .with_context("path", ctx.version_dir.display()));
        }
        self.commit(ctx, ledger, &check, previous_record)?;

        self.enter(ctx, InstallationStatus::Completed, reporter)
    }

    /// Sources to try, in order. Only ranked when auto mirror is on.
    async fn candidates(&self, ctx: &InstallationContext, deadline: Option<Instant>) -> Result<Vec<String>, ClassifiedError> {
        if !ctx.options.auto_mirror {
            return Ok(vec![ctx.options.mirror.clone()]);
        }
        let probe_deadline = {
            let capped = Instant::now() + self.settings.probe_timeout();
            deadline.map_or(capped, |d| d.min(capped))
        };
        let sources = self.selector.list_sources();
        let ranked = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                return Err(ClassifiedError::new(ErrorKind::Cancelled, "Installation cancelled"));
            }
            ranked = self.selector.select_ranked(&sources, probe_deadline) => ranked?,
        };
        for (source, probe) in &ranked {
            debug!(source = %source.name, ms = probe.response_time.as_millis() as u64, "Ranked source");
        }
        Ok(ranked.into_iter().map(|(source, _)| source.name).collect())
    }

    fn fetch_options(&self, ctx: &InstallationContext, deadline: Option<Instant>, reporter: &Arc<dyn Reporter>) -> FetchOptions {
        let retry_reporter = Arc::clone(reporter);
        let version = ctx.version.clone();
        let on_retry: RetryHook = Box::new(move |attempt, delay, reason| {
            retry_reporter.retrying(&version, attempt, delay, reason);
        });
        FetchOptions {
            retry: RetryPolicy::default().with_max_retries(ctx.options.max_retries),
            deadline,
            cancel: self.cancel.clone(),
            on_retry: Some(on_retry),
            ..FetchOptions::default()
        }
    }

    async fn download(
        &self,
        ctx: &mut InstallationContext,
        ledger: &mut RollbackLedger,
        deadline: Option<Instant>,
        reporter: &Arc<dyn Reporter>,
    ) -> Result<DownloadStats, ClassifiedError> {
        ledger.register(
            format!("remove attempt directory {}", ctx.temp_dir.display()),
            RollbackAction::RemoveDir(ctx.temp_dir.clone()),
        );
        std::fs::create_dir_all(&ctx.temp_dir)?;

        let candidates = self.candidates(ctx, deadline).await?;
        let sources = self.selector.list_sources();
        let opts = self.fetch_options(ctx, deadline, reporter);
        let version = ctx.version.clone();
        let progress = |current: u64, total: Option<u64>, rate: f64| {
            reporter.downloading(&version, current, total, rate);
        };

        for (index, name) in candidates.iter().enumerate() {
            let target = resolve_target(&ctx.version, self.platform()?, name, &sources)?;
            ctx.retarget(target);

            let mark = ledger.mark();
            ledger.register(
                format!("remove archive {}", ctx.archive_path.display()),
                RollbackAction::RemoveFile(ctx.archive_path.clone()),
            );
            info!(source = %ctx.target.source_name, url = %ctx.target.download_url, "Downloading");

            match fetch::fetch(&self.client, &ctx.target.download_url, &ctx.archive_path, &progress, &opts).await {
                Ok(stats) => return Ok(stats),
                Err(e) => {
                    let err = ClassifiedError::from(e)
                        .with_context("source", &ctx.target.source_name)
                        .with_context("url", &ctx.target.download_url);
                    let remaining = candidates.len() - index - 1;
                    if !err.retryable || remaining == 0 || self.cancel.is_cancelled() {
                        return Err(err);
                    }
                    warn!(source = %ctx.target.source_name, kind = %err.kind, remaining, "Download failed, trying next source");
                    reporter.warning(&format!(
                        "{} failed ({}), trying {}",
                        ctx.target.source_name,
                        err.message,
                        candidates[index + 1]
                    ));
                    if let Err(rollback) = ledger.execute_partial(mark) {
                        warn!(error = %rollback, "Could not discard partial download");
                    }
                }
            }
        }

        Err(ClassifiedError::new(ErrorKind::NoAvailableSource, "No download source left to try")
            .with_context("tried", candidates.len()))
    }

    /// Checksum and header checks on the downloaded archive.
    async fn check_archive(
        &self,
        ctx: &InstallationContext,
        deadline: Option<Instant>,
        reporter: &Arc<dyn Reporter>,
    ) -> Result<ArchiveCheck, ClassifiedError> {
        if ctx.options.skip_verification {
            debug!("Archive verification skipped");
            return Ok(ArchiveCheck {
                detail: "skipped".into(),
                ..ArchiveCheck::default()
            });
        }

        let (expected, algorithm) = match &ctx.options.checksum {
            Some(expected) => (Some(expected.trim().to_lowercase()), ctx.options.checksum_algorithm),
            None => (self.sidecar_checksum(ctx, deadline).await, HashAlgorithm::Sha256),
        };

        let archive = ctx.archive_path.clone();
        run_blocking(move || verify::check_archive_structure(&archive)).await?;

        let archive = ctx.archive_path.clone();
        let limits = DigestLimits::new(self.cancel.clone(), deadline.map(Instant::into_std));
        let check = match expected {
            Some(expected) => {
                let actual =
                    run_blocking(move || verify::compare_checksum_within(&archive, &expected, algorithm, &limits))
                        .await?;
                debug!(%algorithm, digest = %actual, "Checksum verified");
                ArchiveCheck {
                    checksum_ok: true,
                    archive_ok: true,
                    detail: format!("{algorithm} verified"),
                    sha256: (algorithm == HashAlgorithm::Sha256).then_some(actual),
                }
            }
            None => {
                reporter.warning(&format!(
                    "No checksum published for {}; relying on archive structure only",
                    ctx.target.archive_filename
                ));
                let sha256 =
                    run_blocking(move || verify::compute_checksum_within(&archive, HashAlgorithm::Sha256, &limits))
                        .await?;
                ArchiveCheck {
                    checksum_ok: false,
                    archive_ok: true,
                    detail: "unavailable".into(),
                    sha256: Some(sha256),
                }
            }
        };
        Ok(check)
    }

    async fn sidecar_checksum(&self, ctx: &InstallationContext, deadline: Option<Instant>) -> Option<String> {
        let url = format!("{}.sha256", ctx.target.download_url);
        let opts = FetchOptions {
            retry: RetryPolicy::immediate(1),
            deadline,
            cancel: self.cancel.clone(),
            ..FetchOptions::default()
        };
        match fetch::fetch_text(&self.client, &url, &opts).await {
            Ok(text) => {
                let digest = verify::parse_sidecar(&text);
                if digest.is_none() {
                    warn!(%url, "Checksum file has no digest");
                }
                digest
            }
            Err(e) => {
                warn!(%url, error = %e, "Checksum file unavailable");
                None
            }
        }
    }

    /// Move a forced reinstall's previous tree and record aside, undoably.
    fn back_up_existing(
        &self,
        ctx: &InstallationContext,
        ledger: &mut RollbackLedger,
    ) -> Result<Option<VersionRecord>, ClassifiedError> {
        if !ctx.options.force {
            return Ok(None);
        }

        if ctx.version_dir.exists() {
            let backup = ctx.backup_dir();
            std::fs::rename(&ctx.version_dir, &backup)?;
            ledger.register(
                format!("restore {} from backup", ctx.version_dir.display()),
                RollbackAction::RestorePath {
                    from: backup,
                    to: ctx.version_dir.clone(),
                },
            );
            info!(path = %ctx.version_dir.display(), "Moved existing installation aside");
        }

        let previous = self.store.remove(&ctx.version)?;
        if let Some(record) = previous.clone() {
            let store = Arc::clone(&self.store);
            ledger.register(
                format!("re-insert record for {}", ctx.version),
                RollbackAction::custom(move || Ok(store.insert(record.clone())?)),
            );
        }
        Ok(previous)
    }

    async fn extract(
        &self,
        ctx: &InstallationContext,
        ledger: &mut RollbackLedger,
        deadline: Option<Instant>,
        reporter: &Arc<dyn Reporter>,
    ) -> Result<ExtractInfo, ClassifiedError> {
        // A directory that was already there (an empty --path target) belongs to the user.
        if ctx.version_dir.is_dir() {
            ledger.register(
                format!("empty {}", ctx.version_dir.display()),
                RollbackAction::EmptyDir(ctx.version_dir.clone()),
            );
        } else {
            ledger.register(
                format!("remove {}", ctx.version_dir.display()),
                RollbackAction::RemoveDir(ctx.version_dir.clone()),
            );
            std::fs::create_dir_all(&ctx.version_dir)?;
        }

        let archive = ctx.archive_path.clone();
        let dest = ctx.version_dir.clone();
        let opts = ExtractOptions {
            staging_dir: Some(ctx.staging_dir()),
            workers: self.settings.worker_count(),
            cancel: self.cancel.clone(),
            deadline: deadline.map(Instant::into_std),
            ..ExtractOptions::default()
        };
        let reporter = Arc::clone(reporter);
        let version = ctx.version.clone();

        let info = run_blocking(move || {
            let unpacked = |current: u64, total: Option<u64>, _: f64| reporter.extracting(&version, current, total);
            let placed = |current: u64, total: Option<u64>, _: f64| reporter.extracting(&version, current, total);
            extract::extract(&archive, &dest, &opts, &unpacked, &placed)
        })
        .await?;
        info!(
            files = info.file_count,
            bytes = info.total_bytes,
            strategy = ?info.strategy,
            "Extracted"
        );
        Ok(info)
    }

    async fn validate(&self, ctx: &InstallationContext, check: &ArchiveCheck) -> Result<ValidationResult, ClassifiedError> {
        let dir = ctx.version_dir.clone();
        let version = ctx.version.clone();
        let os = ctx.target.os;
        let validation =
            run_blocking(move || Ok::<_, ClassifiedError>(verify::validate_installation(&dir, &version, os))).await?;
        Ok(validation.with_archive_checks(check.checksum_ok, check.archive_ok, &check.detail))
    }

    /// Persist the record and, when asked, repoint `current`.
    fn commit(
        &self,
        ctx: &InstallationContext,
        ledger: &mut RollbackLedger,
        check: &ArchiveCheck,
        previous: Option<VersionRecord>,
    ) -> Result<(), ClassifiedError> {
        let size_bytes = std::fs::metadata(&ctx.archive_path).map(|m| m.len()).unwrap_or_default();
        let was_active = previous.as_ref().is_some_and(|r| r.active);
        let record = VersionRecord {
            version: ctx.version.clone(),
            path: ctx.version_dir.clone(),
            source: ctx.target.source_name.clone(),
            url: ctx.target.download_url.clone(),
            sha256: check.sha256.clone(),
            size_bytes,
            installed_at: chrono::Utc::now(),
            active: was_active,
        };
        self.store.insert(record)?;
        let store = Arc::clone(&self.store);
        let version = ctx.version.clone();
        ledger.register(
            format!("remove record for {}", ctx.version),
            RollbackAction::custom(move || {
                store.remove(&version)?;
                Ok(())
            }),
        );

        if ctx.options.activate {
            let link = self.layout.current_link();
            ledger.register(
                format!("restore {}", link.display()),
                RollbackAction::RestoreLink {
                    link: link.clone(),
                    previous: switch::read_link_target(&link),
                },
            );
            if let Some(active) = self.store.active()? {
                let store = Arc::clone(&self.store);
                ledger.register(
                    format!("reactivate {}", active.version),
                    RollbackAction::custom(move || Ok(store.set_active(&active.version)?)),
                );
            }
            switch::switch_version(&self.layout, self.store.as_ref(), &ctx.version)?;
            info!(version = %ctx.version, "Activated");
        }
        Ok(())
    }
}
