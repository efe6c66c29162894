//! tvm - Toolchain Version Manager
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
//!
//! Installs Go toolchains side by side and switches between them.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.tvm/
//! ├── versions/      # One directory per installed version
//! ├── tmp/           # Attempt-scoped download and staging areas, install locks
//! ├── current        # Symlink to the active version
//! ├── versions.json  # Installed version records
//! ├── mirrors.json   # Custom sources and cached probe results
//! └── settings.toml  # User settings
//! ```

pub mod cmd;
pub mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tvm")]
#[command(author, version, about = "tvm - install and switch between Go toolchain versions")]
pub struct Cli {
    /// Show error details and debug logs
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Install a toolchain version
    Install(InstallArgs),
    /// List installed versions
    List,
    /// Switch the active version
    Use {
        /// Version to activate, e.g. 1.22.3
        version: String,
    },
    /// Manage download sources
    Sources {
        #[command(subcommand)]
        command: SourcesCommands,
    },
}

#[derive(Debug, clap::Args)]
pub struct InstallArgs {
    /// Version to install, e.g. 1.22.3 or go1.21rc2
    pub version: String,

    /// Reinstall even if the version is already present
    #[arg(short, long)]
    pub force: bool,

    /// Install into this directory instead of the tvm home
    #[arg(long = "path", value_name = "DIR")]
    pub path: Option<PathBuf>,

    /// Skip checksum and installation checks
    #[arg(long)]
    pub skip_verification: bool,

    /// Deadline for the whole installation in seconds (0 disables it)
    #[arg(long, value_name = "SECONDS", env = "TVM_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Download retries per source
    #[arg(long, value_name = "N", env = "TVM_MAX_RETRIES")]
    pub retries: Option<u32>,

    /// Source name or base URL to download from
    #[arg(short, long, value_name = "NAME|URL")]
    pub mirror: Option<String>,

    /// Probe all sources and download from the fastest, failing over on errors
    #[arg(long, conflicts_with = "mirror")]
    pub auto_mirror: bool,

    /// Expected archive digest
    #[arg(long, value_name = "HEX")]
    pub checksum: Option<String>,

    /// Digest algorithm for --checksum (md5, sha1, sha256, sha512, blake3)
    #[arg(long, value_name = "ALGORITHM", default_value = "sha256", requires = "checksum")]
    pub algorithm: String,

    /// Make the new version the active one
    #[arg(long = "use")]
    pub activate: bool,
}

#[derive(Debug, Subcommand)]
pub enum SourcesCommands {
    /// List built-in and custom sources
    List,
    /// Probe sources and show their latency
    Test {
        /// Sources to probe (all when empty)
        names: Vec<String>,
    },
    /// Show the fastest available source
    Fastest,
    /// Add a custom source
    Add {
        /// Unique source name
        name: String,
        /// Base URL the archives live under
        url: String,
        /// Lower sorts first
        #[arg(long, default_value_t = 100)]
        priority: u32,
        #[arg(long, default_value = "")]
        region: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Remove a custom source
    Remove {
        /// Source name
        name: String,
    },
}
