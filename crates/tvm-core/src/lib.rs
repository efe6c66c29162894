pub mod config;
pub mod error;
pub mod io;
pub mod mirror;
pub mod ops;
pub mod paths;
pub mod recovery;
pub mod resolve;
pub mod rollback;
pub mod store;
pub mod switch;

pub mod reporter;

pub use config::Settings;
pub use error::{ClassifiedError, ErrorKind, classify};
pub use mirror::{HttpProbe, MirrorSelector, ProbeTransport};
pub use ops::{InstallOptions, InstallationResult, InstallationStatus, Installer};
pub use paths::*;
pub use reporter::{NullReporter, ProgressSink, Reporter};
pub use store::{JsonVersionStore, VersionStore};

/// User Agent string for core operations
pub const USER_AGENT: &str = concat!("tvm-core/", env!("CARGO_PKG_VERSION"));

/// HTTP client with the crate's user agent, as used by the CLI.
pub fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(std::time::Duration::from_secs(15))
        .build()
}
