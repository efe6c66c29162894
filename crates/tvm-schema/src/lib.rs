//! Shared types for tvm.
//!
//! These are the plain data types passed between the installation pipeline
//! (`tvm-core`) and its callers: platforms, version strings, download sources,
//! resolved install targets and persisted version records. Nothing here touches
//! the network or the filesystem.

/// Digest algorithm names.
pub mod hash;
/// Operating system and architecture identification.
pub mod platform;
/// Persisted version records.
pub mod record;
/// Download sources and probe results.
pub mod source;
/// Resolved install targets and archive kinds.
pub mod target;
/// Version string grammar.
pub mod version;

// Re-exports
pub use hash::*;
pub use platform::*;
pub use record::*;
pub use source::*;
pub use target::*;
pub use version::*;

/// Magic bytes opening a zip local file header.
pub const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Magic bytes opening a gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// `ustar` marker found at offset 257 of a POSIX tar header.
pub const TAR_MAGIC: &[u8; 5] = b"ustar";
