//! Archive extraction and placement.
//!
//! Archives are unpacked into a staging directory first. The unpacked tree is
//! then placed at the destination either by one rename or, when that is not
//! possible, by a pool of workers moving files one by one.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::{ClassifiedError, ErrorKind};
use crate::io::verify::{self, VerifyError};
use crate::reporter::ProgressSink;
use tvm_schema::ArchiveKind;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Archive not found: {}", .0.display())]
    MissingArchive(PathBuf),

    #[error(transparent)]
    Structure(#[from] VerifyError),

    #[error("IO error at {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Unsupported archive format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Archive entry escapes the extraction root: {0}")]
    UnsafePath(String),

    #[error("Archive contains no entries")]
    Empty,

    #[error("Worker failed to move {}: {message}", path.display())]
    Worker { path: PathBuf, message: String },

    #[error("Extraction cancelled after {moved} of {total} files")]
    Cancelled { moved: usize, total: usize },

    #[error("Extraction ran past the deadline after {moved} of {total} files")]
    DeadlineExceeded { moved: usize, total: usize },
}

impl From<ExtractError> for ClassifiedError {
    fn from(err: ExtractError) -> Self {
        let err = match err {
            ExtractError::Structure(inner) => return inner.into(),
            other => other,
        };
        let mut context: Vec<(&str, String)> = Vec::new();
        let kind = match &err {
            ExtractError::MissingArchive(path) => {
                context.push(("path", path.display().to_string()));
                ErrorKind::FileSystem
            }
            ExtractError::Structure(_) => ErrorKind::Corrupted,
            ExtractError::Io { path, source } => {
                context.push(("path", path.display().to_string()));
                match source.kind() {
                    io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                    io::ErrorKind::StorageFull => ErrorKind::InsufficientSpace,
                    io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => ErrorKind::Corrupted,
                    _ => ErrorKind::Extraction,
                }
            }
            ExtractError::UnsafePath(entry) => {
                context.push(("entry", entry.clone()));
                ErrorKind::Corrupted
            }
            ExtractError::Empty => ErrorKind::Corrupted,
            ExtractError::Archive(_) | ExtractError::UnsupportedFormat(_) => ErrorKind::Extraction,
            ExtractError::Worker { path, .. } => {
                context.push(("path", path.display().to_string()));
                ErrorKind::Extraction
            }
            ExtractError::Cancelled { moved, total } => {
                context.push(("moved", moved.to_string()));
                context.push(("total", total.to_string()));
                ErrorKind::Cancelled
            }
            ExtractError::DeadlineExceeded { moved, total } => {
                context.push(("moved", moved.to_string()));
                context.push(("total", total.to_string()));
                ErrorKind::Timeout
            }
        };

        context
            .into_iter()
            .fold(ClassifiedError::new(kind, err.to_string()), |c, (key, value)| {
                c.with_context(key, value)
            })
            .with_cause(err)
    }
}

/// How the unpacked tree reaches its destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// One directory rename; the destination is absent or empty.
    Rename,
    /// File-by-file move by a worker pool.
    ParallelMove { reason: String },
}

/// Pick the placement strategy for `dest` before touching anything.
pub fn choose_placement(dest: &Path) -> PlacementStrategy {
    match fs::read_dir(dest) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => PlacementStrategy::Rename,
        Ok(mut entries) => {
            if entries.next().is_none() {
                PlacementStrategy::Rename
            } else {
                PlacementStrategy::ParallelMove {
                    reason: "destination is not empty".to_string(),
                }
            }
        }
        Err(e) => PlacementStrategy::ParallelMove {
            reason: format!("destination is not a readable directory: {e}"),
        },
    }
}

/// What an extraction did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractInfo {
    pub file_count: usize,
    pub dir_count: usize,
    pub total_bytes: u64,
    pub strategy: PlacementStrategy,
    /// Worker threads used for placement; zero when the tree was renamed.
    pub workers: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Where to unpack before placement. Defaults to `<archive>.staging` beside the archive.
    pub staging_dir: Option<PathBuf>,
    /// Placement workers.
    pub workers: usize,
    /// Report placement progress every N files.
    pub progress_every: usize,
    /// Place the contents of a single top-level directory rather than the directory itself.
    pub strip_top_level: bool,
    pub cancel: CancellationToken,
    /// Give up once this instant passes.
    pub deadline: Option<Instant>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            staging_dir: None,
            workers: num_cpus::get(),
            progress_every: 32,
            strip_top_level: true,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }
}

impl ExtractOptions {
    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails when the caller cancelled or the deadline passed.
    fn check_interrupted(&self, moved: usize, total: usize) -> Result<(), ExtractError> {
        if self.cancel.is_cancelled() {
            return Err(ExtractError::Cancelled { moved, total });
        }
        if self.past_deadline() {
            return Err(ExtractError::DeadlineExceeded { moved, total });
        }
        Ok(())
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> ExtractError + '_ {
    move |source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reject absolute paths and `..` components.
fn safe_relative(path: &Path) -> Result<PathBuf, ExtractError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::UnsafePath(path.display().to_string()));
            }
        }
    }
    Ok(out)
}

/// Whether `link`, resolved from `base` (a path inside the root), stays inside the root.
fn link_stays_inside(base: &Path, link: &Path) -> bool {
    let mut depth = base.components().count();
    for component in link.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

#[derive(Debug, Default)]
struct Unpacked {
    files: usize,
    dirs: usize,
    bytes: u64,
}

fn unpack_tar<R: Read>(
    reader: R,
    archive_path: &Path,
    staging: &Path,
    progress: &dyn ProgressSink,
    opts: &ExtractOptions,
) -> Result<Unpacked, ExtractError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut stats = Unpacked::default();
    let started = Instant::now();

    for entry in archive.entries().map_err(io_at(archive_path))? {
        opts.check_interrupted(0, stats.files)?;
        let mut entry = entry.map_err(io_at(archive_path))?;
        let raw = entry.path().map_err(io_at(archive_path))?.into_owned();
        let relative = safe_relative(&raw)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            let link = entry
                .link_name()
                .map_err(io_at(archive_path))?
                .ok_or_else(|| ExtractError::UnsafePath(raw.display().to_string()))?;
            // Hard link targets are archive paths; symlink targets are relative to the link.
            let base = if entry_type.is_symlink() {
                relative.parent().unwrap_or(Path::new(""))
            } else {
                Path::new("")
            };
            if !link_stays_inside(base, &link) {
                return Err(ExtractError::UnsafePath(format!(
                    "{} -> {}",
                    raw.display(),
                    link.display()
                )));
            }
        }

        // unpack_in refuses to write through a symlinked parent.
        let placed = entry.unpack_in(staging).map_err(io_at(&staging.join(&relative)))?;
        if !placed {
            return Err(ExtractError::UnsafePath(raw.display().to_string()));
        }
        if entry_type.is_dir() {
            stats.dirs += 1;
            continue;
        }
        stats.files += 1;
        stats.bytes += entry.size();
        let rate = stats.bytes as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON);
        progress.progress(stats.bytes, None, rate);
    }
    Ok(stats)
}

fn unpack_zip(
    archive_path: &Path,
    staging: &Path,
    progress: &dyn ProgressSink,
    opts: &ExtractOptions,
) -> Result<Unpacked, ExtractError> {
    let file = File::open(archive_path).map_err(io_at(archive_path))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| ExtractError::Archive(e.to_string()))?;

    let mut stats = Unpacked::default();
    let started = Instant::now();

    for i in 0..archive.len() {
        opts.check_interrupted(0, stats.files)?;
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ExtractError::Archive(e.to_string()))?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ExtractError::UnsafePath(entry.name().to_string()))?;
        let relative = safe_relative(&relative)?;
        let target = staging.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(io_at(&target))?;
            stats.dirs += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        let mut out = File::create(&target).map_err(io_at(&target))?;
        let written = io::copy(&mut entry, &mut out).map_err(io_at(&target))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode)).map_err(io_at(&target))?;
        }

        stats.files += 1;
        stats.bytes += written;
        let rate = stats.bytes as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON);
        progress.progress(stats.bytes, None, rate);
    }
    Ok(stats)
}

/// The directory whose contents get placed: the single top-level directory
/// when there is exactly one and nothing else, otherwise the staging root.
fn placement_root(staging: &Path, strip_top_level: bool) -> Result<PathBuf, ExtractError> {
    let mut entries = fs::read_dir(staging)
        .map_err(io_at(staging))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_at(staging))?;
    if entries.is_empty() {
        return Err(ExtractError::Empty);
    }
    if strip_top_level && entries.len() == 1 {
        let only = entries.remove(0);
        if only.file_type().map_err(io_at(&only.path()))?.is_dir() {
            return Ok(only.path());
        }
    }
    Ok(staging.to_path_buf())
}

/// Move one file, falling back to copy + delete across devices.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    let meta = fs::symlink_metadata(from)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(from)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, to)?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_file(&target, to)?;
    } else {
        fs::copy(from, to)?;
    }
    fs::remove_file(from)
}

/// Move every file under `root` to the same relative path under `dest`.
fn parallel_move(
    root: &Path,
    dest: &Path,
    opts: &ExtractOptions,
    progress: &dyn ProgressSink,
) -> Result<usize, ExtractError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| ExtractError::Io {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| ExtractError::Archive(e.to_string()))?
            .to_path_buf();
        if entry.file_type().is_dir() {
            let target = dest.join(&relative);
            fs::create_dir_all(&target).map_err(io_at(&target))?;
        } else {
            files.push(relative);
        }
    }

    let total = files.len();
    let workers = opts.workers.clamp(1, total.max(1));
    let every = opts.progress_every.max(1);
    let cursor = AtomicUsize::new(0);
    let moved = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let failure: Mutex<Option<ExtractError>> = Mutex::new(None);
    let last_reported = Mutex::new(0usize);
    let started = Instant::now();

    debug!(files = total, workers, "Moving files into place");

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if stop.load(Ordering::Relaxed) || opts.check_interrupted(0, total).is_err() {
                        break;
                    }
                    let index = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(relative) = files.get(index) else { break };

                    if let Err(e) = move_file(&root.join(relative), &dest.join(relative)) {
                        stop.store(true, Ordering::Relaxed);
                        if let Ok(mut slot) = failure.lock() {
                            slot.get_or_insert(ExtractError::Worker {
                                path: relative.clone(),
                                message: e.to_string(),
                            });
                        }
                        break;
                    }

                    let done = moved.fetch_add(1, Ordering::Relaxed) + 1;
                    if done % every == 0 || done == total {
                        // Serialize reports so callers see non-decreasing counts.
                        if let Ok(mut last) = last_reported.lock() {
                            if done > *last {
                                *last = done;
                                let rate = done as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON);
                                progress.progress(done as u64, Some(total as u64), rate);
                            }
                        }
                    }
                }
            });
        }
    });

    if let Some(err) = failure.into_inner().ok().flatten() {
        return Err(err);
    }
    let moved = moved.into_inner();
    if moved < total {
        if opts.past_deadline() {
            return Err(ExtractError::DeadlineExceeded { moved, total });
        }
        return Err(ExtractError::Cancelled { moved, total });
    }
    Ok(workers)
}

/// Unpack `archive` and place its contents at `dest`.
///
/// `progress` receives unpacked bytes; `placement` receives moved files and is
/// only called when the tree cannot be renamed into place. Blocking.
pub fn extract(
    archive: &Path,
    dest: &Path,
    opts: &ExtractOptions,
    progress: &dyn ProgressSink,
    placement: &dyn ProgressSink,
) -> Result<ExtractInfo, ExtractError> {
    let started = Instant::now();
    if !archive.exists() {
        return Err(ExtractError::MissingArchive(archive.to_path_buf()));
    }
    let kind = verify::check_archive_structure(archive)?;

    let staging = opts.staging_dir.clone().unwrap_or_else(|| {
        let mut name = archive.as_os_str().to_owned();
        name.push(".staging");
        PathBuf::from(name)
    });
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(io_at(&staging))?;
    }
    fs::create_dir_all(&staging).map_err(io_at(&staging))?;

    let unpacked = match kind {
        ArchiveKind::TarGz => {
            let file = File::open(archive).map_err(io_at(archive))?;
            let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
            unpack_tar(decoder, archive, &staging, progress, opts)?
        }
        ArchiveKind::Tar => {
            let file = File::open(archive).map_err(io_at(archive))?;
            unpack_tar(BufReader::new(file), archive, &staging, progress, opts)?
        }
        ArchiveKind::Zip => unpack_zip(archive, &staging, progress, opts)?,
        ArchiveKind::Unknown => return Err(ExtractError::UnsupportedFormat(archive.to_path_buf())),
    };
    debug!(
        files = unpacked.files,
        dirs = unpacked.dirs,
        bytes = unpacked.bytes,
        "Unpacked into staging"
    );
    opts.check_interrupted(0, unpacked.files)?;

    let root = placement_root(&staging, opts.strip_top_level)?;
    let mut strategy = choose_placement(dest);
    let mut workers = 0;

    if strategy == PlacementStrategy::Rename {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        if dest.exists() {
            fs::remove_dir(dest).map_err(io_at(dest))?;
        }
        match fs::rename(&root, dest) {
            Ok(()) => debug!(dest = %dest.display(), "Renamed into place"),
            Err(e) => {
                warn!(error = %e, "Rename failed, falling back to parallel move");
                fs::create_dir_all(dest).map_err(io_at(dest))?;
                strategy = PlacementStrategy::ParallelMove {
                    reason: format!("rename failed: {e}"),
                };
            }
        }
    }

    if let PlacementStrategy::ParallelMove { reason } = &strategy {
        info!(%reason, "Placing files with worker pool");
        fs::create_dir_all(dest).map_err(io_at(dest))?;
        workers = parallel_move(&root, dest, opts, placement)?;
    }

    if let Err(e) = fs::remove_dir_all(&staging) {
        debug!(error = %e, "Could not remove staging directory");
    }

    Ok(ExtractInfo {
        file_count: unpacked.files,
        dir_count: unpacked.dirs,
        total_bytes: unpacked.bytes,
        strategy,
        workers,
        duration: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::no_progress;
    use crate::rollback::{RollbackAction, RollbackLedger};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    fn tar_gz(path: &Path, files: &[(&str, &[u8], u32)]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        builder.append_data(&mut dir, "go/", io::empty()).unwrap();
        for (name, data, mode) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn sample(dir: &Path) -> PathBuf {
        let archive = dir.join("go1.21.5.linux-amd64.tar.gz");
        tar_gz(
            &archive,
            &[
                ("go/bin/go", b"#!/bin/sh\necho go\n", 0o755),
                ("go/VERSION", b"go1.21.5\n", 0o644),
                ("go/src/fmt/print.go", b"package fmt\n", 0o644),
                ("go/src/os/file.go", b"package os\n", 0o644),
            ],
        );
        archive
    }

    fn opts(workers: usize) -> ExtractOptions {
        ExtractOptions {
            workers,
            progress_every: 1,
            ..ExtractOptions::default()
        }
    }

    #[test]
    fn renames_into_absent_destination() {
        let dir = tempdir().unwrap();
        let archive = sample(dir.path());
        let dest = dir.path().join("versions/1.21.5");

        let info = extract(&archive, &dest, &opts(4), &no_progress(), &no_progress()).unwrap();

        assert_eq!(info.strategy, PlacementStrategy::Rename);
        assert_eq!(info.file_count, 4);
        assert_eq!(info.dir_count, 1);
        assert_eq!(info.workers, 0);
        assert_eq!(fs::read(dest.join("VERSION")).unwrap(), b"go1.21.5\n");
        assert!(dest.join("src/os/file.go").exists());
        assert!(!dir.path().join("go1.21.5.linux-amd64.tar.gz.staging").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.join("bin/go")).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0);
        }
    }

    #[test]
    fn empty_destination_still_renames() {
        let dir = tempdir().unwrap();
        let archive = sample(dir.path());
        let dest = dir.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        assert_eq!(choose_placement(&dest), PlacementStrategy::Rename);

        let info = extract(&archive, &dest, &opts(2), &no_progress(), &no_progress()).unwrap();
        assert_eq!(info.strategy, PlacementStrategy::Rename);
        assert!(dest.join("bin/go").exists());
    }

    #[test]
    fn populated_destination_uses_worker_pool() {
        let dir = tempdir().unwrap();
        let archive = sample(dir.path());
        let dest = dir.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("marker"), b"keep").unwrap();

        let reports = Mutex::new(Vec::new());
        let placement = |current: u64, total: Option<u64>, _: f64| reports.lock().unwrap().push((current, total));
        let info = extract(&archive, &dest, &opts(3), &no_progress(), &placement).unwrap();

        assert!(matches!(info.strategy, PlacementStrategy::ParallelMove { .. }));
        assert_eq!(info.workers, 3);
        assert!(dest.join("marker").exists());
        assert!(dest.join("src/fmt/print.go").exists());

        let reports = reports.into_inner().unwrap();
        assert!(reports.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(reports.last(), Some(&(4, Some(4))));
    }

    #[test]
    fn zip_archives_extract() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("go1.21.5.windows-amd64.zip");
        {
            let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
            let options = zip::write::SimpleFileOptions::default();
            zip.add_directory("go/", options).unwrap();
            zip.start_file("go/bin/go.exe", options).unwrap();
            zip.write_all(b"MZ").unwrap();
            zip.start_file("go/VERSION", options).unwrap();
            zip.write_all(b"go1.21.5\n").unwrap();
            zip.finish().unwrap();
        }
        let dest = dir.path().join("dest");
        let info = extract(&archive, &dest, &opts(2), &no_progress(), &no_progress()).unwrap();
        assert_eq!(info.file_count, 2);
        assert_eq!(fs::read(dest.join("bin/go.exe")).unwrap(), b"MZ");
    }

    #[test]
    fn escaping_entries_are_rejected() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.tar.gz");
        {
            let file = File::create(&archive).unwrap();
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
            let mut header = tar::Header::new_old();
            let name = b"../evil.txt";
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_size(4);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &b"evil"[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let dest = dir.path().join("dest");
        let err = extract(&archive, &dest, &opts(1), &no_progress(), &no_progress()).unwrap_err();
        assert!(matches!(err, ExtractError::UnsafePath(_)));
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::Corrupted);
        assert!(!dir.path().join("evil.txt").exists());
    }

    fn tar_gz_with_link(path: &Path, link: &str, target: &Path, then: &str) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_link_name(target).unwrap();
        builder.append_data(&mut header, link, io::empty()).unwrap();
        let mut file = tar::Header::new_gnu();
        file.set_size(5);
        file.set_mode(0o644);
        builder.append_data(&mut file, then, &b"pwned"[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn absolute_symlink_cannot_redirect_later_entries() {
        let dir = tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        let archive = dir.path().join("evil.tar.gz");
        tar_gz_with_link(&archive, "go/evil", &outside, "go/evil/pwned.txt");

        let dest = dir.path().join("dest");
        let err = extract(&archive, &dest, &opts(1), &no_progress(), &no_progress()).unwrap_err();
        assert!(matches!(err, ExtractError::UnsafePath(_)), "{err:?}");
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::Corrupted);
        assert!(!outside.join("pwned.txt").exists());
        assert!(!dest.exists());
    }

    #[test]
    fn relative_symlink_out_of_the_root_is_rejected() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("outside")).unwrap();
        let archive = dir.path().join("evil.tar.gz");
        tar_gz_with_link(&archive, "go/evil", Path::new("../../outside"), "go/evil/pwned.txt");

        let staging = dir.path().join("staging");
        let options = ExtractOptions {
            staging_dir: Some(staging.clone()),
            ..opts(1)
        };
        let err = extract(&archive, &dir.path().join("dest"), &options, &no_progress(), &no_progress())
            .unwrap_err();
        assert!(matches!(err, ExtractError::UnsafePath(_)), "{err:?}");
        assert!(!dir.path().join("outside/pwned.txt").exists());
        assert!(fs::symlink_metadata(staging.join("go/evil")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_inside_the_tree_are_kept() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("go.tar.gz");
        tar_gz_with_link(&archive, "go/bin/gofmt-link", Path::new("gofmt"), "go/bin/gofmt");

        let dest = dir.path().join("dest");
        extract(&archive, &dest, &opts(1), &no_progress(), &no_progress()).unwrap();
        assert_eq!(fs::read_link(dest.join("bin/gofmt-link")).unwrap(), Path::new("gofmt"));
        assert_eq!(fs::read(dest.join("bin/gofmt-link")).unwrap(), b"pwned");
    }

    #[test]
    fn past_deadline_stops_unpacking() {
        let dir = tempdir().unwrap();
        let archive = sample(dir.path());
        let dest = dir.path().join("dest");
        let options = ExtractOptions {
            deadline: Some(Instant::now()),
            ..opts(2)
        };

        let err = extract(&archive, &dest, &options, &no_progress(), &no_progress()).unwrap_err();
        assert!(matches!(err, ExtractError::DeadlineExceeded { .. }), "{err:?}");
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::Timeout);
        assert!(!dest.exists());
    }

    #[test]
    fn deadline_passing_mid_move_is_a_timeout() {
        let dir = tempdir().unwrap();
        let archive = sample(dir.path());
        let dest = dir.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("marker"), b"keep").unwrap();

        let options = ExtractOptions {
            deadline: Some(Instant::now() + Duration::from_millis(300)),
            ..opts(1)
        };
        let placement = |_: u64, _: Option<u64>, _: f64| std::thread::sleep(Duration::from_millis(400));
        let err = extract(&archive, &dest, &options, &no_progress(), &placement).unwrap_err();
        let ExtractError::DeadlineExceeded { moved, total } = err else {
            panic!("expected a deadline error, got {err:?}");
        };
        assert_eq!(total, 4);
        assert!(moved < total);
    }

    #[test]
    fn missing_and_garbled_archives() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("dest");

        let err = extract(&dir.path().join("nope.tar.gz"), &dest, &opts(1), &no_progress(), &no_progress())
            .unwrap_err();
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::FileSystem);

        let garbled = dir.path().join("bad.tar.gz");
        fs::write(&garbled, b"<html>not an archive</html>").unwrap();
        let err = extract(&garbled, &dest, &opts(1), &no_progress(), &no_progress()).unwrap_err();
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::Corrupted);
        assert!(!dest.exists());
    }

    #[test]
    fn interrupted_move_is_fully_rolled_back() {
        let dir = tempdir().unwrap();
        let archive = sample(dir.path());
        let dest = dir.path().join("versions/1.21.5");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("partial"), b"x").unwrap();

        let mut ledger = RollbackLedger::new();
        ledger.register("remove version dir", RollbackAction::RemoveDir(dest.clone()));

        let options = opts(1);
        let cancel = options.cancel.clone();
        let placement = move |current: u64, _: Option<u64>, _: f64| {
            if current >= 2 {
                cancel.cancel();
            }
        };
        let err = extract(&archive, &dest, &options, &no_progress(), &placement).unwrap_err();
        let ExtractError::Cancelled { moved, total } = err else {
            panic!("expected cancellation, got {err:?}");
        };
        assert_eq!(total, 4);
        assert!(moved >= 2 && moved < total);
        assert_eq!(ClassifiedError::from(ExtractError::Cancelled { moved, total }).kind, ErrorKind::Cancelled);

        ledger.execute_all().unwrap();
        assert!(!dest.exists());
    }
}
