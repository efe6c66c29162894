//! Installation operations.

mod context;
mod install;

pub use context::{InstallGuard, InstallOptions, InstallationContext, InstallationStatus};
pub use install::{InstallationResult, Installer};
