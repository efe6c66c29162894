//! Integrity checks: archive digests, header sanity and post-install validation.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{ClassifiedError, ErrorKind};
use tvm_schema::{
    ArchiveKind, GZIP_MAGIC, HashAlgorithm, Os, TAR_MAGIC, ToolchainVersion, UnsupportedAlgorithm,
    ZIP_MAGIC,
};

const BUF_SIZE: usize = 64 * 1024;

/// Offset of the `ustar` marker inside the first tar header block.
const TAR_MAGIC_OFFSET: usize = 257;

/// End-of-central-directory signature; an empty zip starts with it.
const ZIP_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("File not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    UnsupportedAlgorithm(#[from] UnsupportedAlgorithm),

    #[error("Expected checksum is empty")]
    EmptyExpected,

    #[error("Checksum mismatch ({algorithm}): expected {expected}, got {actual}")]
    Mismatch {
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },

    #[error("Archive is empty: {}", .0.display())]
    EmptyArchive(PathBuf),

    #[error("Corrupt archive header: {} is not a valid {kind:?} file", path.display())]
    BadHeader { path: PathBuf, kind: ArchiveKind },

    #[error("Checksum of {} cancelled", .0.display())]
    Cancelled(PathBuf),

    #[error("Checksum of {} ran past the deadline", .0.display())]
    DeadlineExceeded(PathBuf),
}

impl From<VerifyError> for ClassifiedError {
    fn from(err: VerifyError) -> Self {
        let mut context = Vec::new();
        let kind = match &err {
            VerifyError::Missing(path) => {
                context.push(("path", path.display().to_string()));
                ErrorKind::FileSystem
            }
            VerifyError::Io { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::Permission
            }
            VerifyError::Io { .. } => ErrorKind::FileSystem,
            VerifyError::UnsupportedAlgorithm(_) | VerifyError::EmptyExpected => ErrorKind::Configuration,
            VerifyError::Mismatch {
                algorithm,
                expected,
                actual,
            } => {
                context.push(("algorithm", algorithm.to_string()));
                context.push(("expected", expected.clone()));
                context.push(("actual", actual.clone()));
                ErrorKind::Corrupted
            }
            VerifyError::EmptyArchive(_) | VerifyError::BadHeader { .. } => ErrorKind::Corrupted,
            VerifyError::Cancelled(_) => ErrorKind::Cancelled,
            VerifyError::DeadlineExceeded(_) => ErrorKind::Timeout,
        };

        let mut classified = ClassifiedError::new(kind, err.to_string());
        for (key, value) in context {
            classified = classified.with_context(key, value);
        }
        classified.with_cause(err)
    }
}

fn open(path: &Path) -> Result<File, VerifyError> {
    File::open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            VerifyError::Missing(path.to_path_buf())
        } else {
            VerifyError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// When a running digest should give up. Checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct DigestLimits {
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<Instant>,
}

impl DigestLimits {
    pub fn new(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            cancel: Some(cancel),
            deadline,
        }
    }

    fn check(&self, path: &Path) -> Result<(), VerifyError> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(VerifyError::Cancelled(path.to_path_buf()));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(VerifyError::DeadlineExceeded(path.to_path_buf()));
        }
        Ok(())
    }
}

/// Feed `reader` to `update` one buffer at a time, checking `limits` before each read.
fn stream_chunks(
    mut reader: impl Read,
    path: &Path,
    limits: &DigestLimits,
    mut update: impl FnMut(&[u8]),
) -> Result<(), VerifyError> {
    let mut buffer = vec![0u8; BUF_SIZE];
    loop {
        limits.check(path)?;
        let count = reader.read(&mut buffer).map_err(|source| VerifyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if count == 0 {
            return Ok(());
        }
        update(&buffer[..count]);
    }
}

fn digest_reader<D: Digest>(reader: impl Read, path: &Path, limits: &DigestLimits) -> Result<String, VerifyError> {
    let mut hasher = D::new();
    stream_chunks(reader, path, limits, |chunk| hasher.update(chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

fn blake3_reader(reader: impl Read, path: &Path, limits: &DigestLimits) -> Result<String, VerifyError> {
    let mut hasher = blake3::Hasher::new();
    stream_chunks(reader, path, limits, |chunk| {
        hasher.update(chunk);
    })?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Parse a user-supplied algorithm name.
pub fn parse_algorithm(name: &str) -> Result<HashAlgorithm, VerifyError> {
    Ok(name.parse::<HashAlgorithm>()?)
}

/// Stream `path` through `algorithm` and return the lowercase hex digest.
///
/// Blocking; call from `spawn_blocking` inside async code.
pub fn compute_checksum(path: &Path, algorithm: HashAlgorithm) -> Result<String, VerifyError> {
    compute_checksum_within(path, algorithm, &DigestLimits::default())
}

/// [`compute_checksum`] that stops with `Cancelled` or `DeadlineExceeded` between chunks.
pub fn compute_checksum_within(
    path: &Path,
    algorithm: HashAlgorithm,
    limits: &DigestLimits,
) -> Result<String, VerifyError> {
    let reader = BufReader::with_capacity(BUF_SIZE, open(path)?);
    match algorithm {
        HashAlgorithm::Md5 => digest_reader::<md5::Md5>(reader, path, limits),
        HashAlgorithm::Sha1 => digest_reader::<sha1::Sha1>(reader, path, limits),
        HashAlgorithm::Sha256 => digest_reader::<sha2::Sha256>(reader, path, limits),
        HashAlgorithm::Sha512 => digest_reader::<sha2::Sha512>(reader, path, limits),
        HashAlgorithm::Blake3 => blake3_reader(reader, path, limits),
    }
}

/// Compare the digest of `path` with `expected`, ignoring case and surrounding whitespace.
pub fn compare_checksum(path: &Path, expected: &str, algorithm: HashAlgorithm) -> Result<String, VerifyError> {
    compare_checksum_within(path, expected, algorithm, &DigestLimits::default())
}

/// [`compare_checksum`] bounded by `limits`.
pub fn compare_checksum_within(
    path: &Path,
    expected: &str,
    algorithm: HashAlgorithm,
    limits: &DigestLimits,
) -> Result<String, VerifyError> {
    let expected = expected.trim();
    if expected.is_empty() {
        return Err(VerifyError::EmptyExpected);
    }
    let actual = compute_checksum_within(path, algorithm, limits)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(actual)
    } else {
        if algorithm.is_legacy() {
            tracing::debug!(%algorithm, "Mismatch against a legacy digest");
        }
        Err(VerifyError::Mismatch {
            algorithm,
            expected: expected.to_lowercase(),
            actual,
        })
    }
}

/// Digest from a checksum sidecar (`<hex>` or `<hex>  <filename>`).
pub fn parse_sidecar(text: &str) -> Option<String> {
    text.split_whitespace()
        .next()
        .filter(|token| !token.is_empty() && token.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_lowercase)
}

/// Check the magic bytes of the archive kind implied by the file extension.
///
/// Nothing is decoded. Unknown extensions only need to be non-empty and readable.
pub fn check_archive_structure(path: &Path) -> Result<ArchiveKind, VerifyError> {
    let kind = ArchiveKind::detect(path);
    let mut file = open(path)?;
    let mut header = Vec::with_capacity(TAR_MAGIC_OFFSET + TAR_MAGIC.len());
    (&mut file)
        .take((TAR_MAGIC_OFFSET + TAR_MAGIC.len()) as u64)
        .read_to_end(&mut header)
        .map_err(|source| VerifyError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if header.is_empty() {
        return Err(VerifyError::EmptyArchive(path.to_path_buf()));
    }

    let ok = match kind {
        ArchiveKind::TarGz => header.starts_with(&GZIP_MAGIC),
        ArchiveKind::Zip => header.starts_with(&ZIP_MAGIC) || header.starts_with(&ZIP_EMPTY_MAGIC),
        ArchiveKind::Tar => header.get(TAR_MAGIC_OFFSET..).is_some_and(|m| m.starts_with(TAR_MAGIC)),
        ArchiveKind::Unknown => true,
    };
    if ok {
        Ok(kind)
    } else {
        Err(VerifyError::BadHeader {
            path: path.to_path_buf(),
            kind,
        })
    }
}

/// Outcome of validating an installation. Built once, never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub checksum_ok: bool,
    pub archive_ok: bool,
    pub version_ok: bool,
    pub executable_ok: bool,
    pub errors: Vec<String>,
    pub details: BTreeMap<String, String>,
}

impl ValidationResult {
    /// Fold in the checks made on the downloaded archive.
    pub fn with_archive_checks(mut self, checksum_ok: bool, archive_ok: bool, checksum_detail: &str) -> Self {
        self.checksum_ok = checksum_ok;
        self.archive_ok = archive_ok;
        self.details.insert("checksum".into(), checksum_detail.into());
        self.valid = self.errors.is_empty();
        self
    }
}

/// Path of the toolchain's main executable inside an installation.
pub fn executable_path(dir: &Path, os: Os) -> PathBuf {
    let name = if os.is_windows() { "go.exe" } else { "go" };
    dir.join("bin").join(name)
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_: &std::fs::Metadata) -> bool {
    true
}

/// Check an extracted installation: the executable is present and runnable, and
/// the `VERSION` file names the expected release.
pub fn validate_installation(dir: &Path, version: &ToolchainVersion, os: Os) -> ValidationResult {
    let mut result = ValidationResult::default();

    let exe = executable_path(dir, os);
    match std::fs::metadata(&exe) {
        Ok(meta) if meta.is_file() && is_executable(&meta) => result.executable_ok = true,
        Ok(_) => result
            .errors
            .push(format!("{} is not an executable file", exe.display())),
        Err(_) => result.errors.push(format!("Missing executable {}", exe.display())),
    }

    let expected = format!("go{version}");
    match std::fs::read_to_string(dir.join("VERSION")) {
        Ok(content) => {
            let found = content.lines().next().unwrap_or_default().trim().to_string();
            if found == expected {
                result.version_ok = true;
            } else {
                result
                    .errors
                    .push(format!("VERSION file says {found:?}, expected {expected:?}"));
            }
            result.details.insert("version_file".into(), found);
        }
        Err(_) => {
            result.details.insert("version_file".into(), "missing".into());
        }
    }

    result.valid = result.errors.is_empty();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn known_digests() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "abc", b"abc");
        assert_eq!(
            compute_checksum(&path, HashAlgorithm::Md5).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            compute_checksum(&path, HashAlgorithm::Sha1).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            compute_checksum(&path, HashAlgorithm::Sha256).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            compute_checksum(&path, HashAlgorithm::Blake3).unwrap(),
            blake3::hash(b"abc").to_hex().to_string()
        );
        assert_eq!(compute_checksum(&path, HashAlgorithm::Sha512).unwrap().len(), 128);
    }

    #[test]
    fn checksum_is_deterministic() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let path = write(dir.path(), "blob", &data);
        for algo in [
            HashAlgorithm::Md5,
            HashAlgorithm::Sha1,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha512,
            HashAlgorithm::Blake3,
        ] {
            let a = compute_checksum(&path, algo).unwrap();
            let b = compute_checksum(&path, algo).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.len(), algo.hex_len());
        }
    }

    #[test]
    fn comparison_ignores_case() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "abc", b"abc");
        let upper = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD";
        assert!(compare_checksum(&path, upper, HashAlgorithm::Sha256).is_ok());
    }

    #[test]
    fn mismatch_is_corrupted_with_context() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "abc", b"abc");
        let err = compare_checksum(&path, "deadbeef", HashAlgorithm::Sha256).unwrap_err();
        let classified = ClassifiedError::from(err);
        assert_eq!(classified.kind, ErrorKind::Corrupted);
        assert_eq!(classified.context.get("expected").map(String::as_str), Some("deadbeef"));
        assert_eq!(classified.context.get("algorithm").map(String::as_str), Some("sha256"));
        assert!(classified.context.contains_key("actual"));
    }

    #[test]
    fn usage_errors_are_configuration() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "abc", b"abc");
        let empty = compare_checksum(&path, "  ", HashAlgorithm::Sha256).unwrap_err();
        assert_eq!(ClassifiedError::from(empty).kind, ErrorKind::Configuration);
        let unknown = parse_algorithm("crc32").unwrap_err();
        assert_eq!(ClassifiedError::from(unknown).kind, ErrorKind::Configuration);
    }

    #[test]
    fn cancelled_digest_stops() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "big", &vec![7u8; 3 * BUF_SIZE]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = compute_checksum_within(&path, HashAlgorithm::Sha256, &DigestLimits::new(cancel, None))
            .unwrap_err();
        assert!(matches!(err, VerifyError::Cancelled(_)), "{err:?}");
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::Cancelled);
    }

    #[test]
    fn digest_past_deadline_is_a_timeout() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "big", &vec![7u8; 3 * BUF_SIZE]);
        let limits = DigestLimits::new(CancellationToken::new(), Some(Instant::now()));

        for algorithm in [HashAlgorithm::Sha512, HashAlgorithm::Blake3] {
            let err = compare_checksum_within(&path, "00", algorithm, &limits).unwrap_err();
            assert!(matches!(err, VerifyError::DeadlineExceeded(_)), "{err:?}");
            assert_eq!(ClassifiedError::from(err).kind, ErrorKind::Timeout);
        }

        let open_ended = DigestLimits::new(CancellationToken::new(), None);
        assert_eq!(
            compute_checksum_within(&path, HashAlgorithm::Sha256, &open_ended).unwrap(),
            compute_checksum(&path, HashAlgorithm::Sha256).unwrap()
        );
    }

    #[test]
    fn missing_file_is_filesystem() {
        let dir = tempdir().unwrap();
        let err = compute_checksum(&dir.path().join("nope"), HashAlgorithm::Sha256).unwrap_err();
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::FileSystem);
    }

    #[test]
    fn archive_headers() {
        let dir = tempdir().unwrap();
        let gz = write(dir.path(), "a.tar.gz", &[0x1F, 0x8B, 0x08, 0x00]);
        assert_eq!(check_archive_structure(&gz).unwrap(), ArchiveKind::TarGz);

        let zip = write(dir.path(), "a.zip", b"PK\x03\x04rest");
        assert_eq!(check_archive_structure(&zip).unwrap(), ArchiveKind::Zip);

        let mut tar = vec![0u8; 512];
        tar[257..262].copy_from_slice(b"ustar");
        let tar = write(dir.path(), "a.tar", &tar);
        assert_eq!(check_archive_structure(&tar).unwrap(), ArchiveKind::Tar);

        let garbled = write(dir.path(), "b.tar.gz", b"<html>oops</html>");
        let err = check_archive_structure(&garbled).unwrap_err();
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::Corrupted);

        let empty = write(dir.path(), "c.zip", b"");
        assert!(matches!(check_archive_structure(&empty), Err(VerifyError::EmptyArchive(_))));

        let other = write(dir.path(), "blob.bin", b"x");
        assert_eq!(check_archive_structure(&other).unwrap(), ArchiveKind::Unknown);
    }

    #[test]
    fn sidecar_parsing() {
        assert_eq!(parse_sidecar("ABCdef01  go.tar.gz\n"), Some("abcdef01".into()));
        assert_eq!(parse_sidecar("abc123"), Some("abc123".into()));
        assert_eq!(parse_sidecar("<html>"), None);
        assert_eq!(parse_sidecar(""), None);
    }

    #[test]
    fn installation_validation() {
        let dir = tempdir().unwrap();
        let v = ToolchainVersion::parse("1.21.5").unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        let exe = write(&dir.path().join("bin"), "go", b"#!/bin/sh\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        #[cfg(not(unix))]
        let _ = exe;
        write(dir.path(), "VERSION", b"go1.21.5\ntime 2023-12-01\n");

        let result = validate_installation(dir.path(), &v, Os::Linux);
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.executable_ok && result.version_ok);

        let wrong = ToolchainVersion::parse("1.22.0").unwrap();
        let result = validate_installation(dir.path(), &wrong, Os::Linux);
        assert!(!result.valid);
        assert!(!result.version_ok);
    }

    #[test]
    fn missing_version_file_is_a_detail_not_an_error() {
        let dir = tempdir().unwrap();
        let v = ToolchainVersion::parse("1.21.5").unwrap();
        let result = validate_installation(dir.path(), &v, Os::Windows);
        assert!(!result.executable_ok);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.details.get("version_file").map(String::as_str), Some("missing"));
    }
}
