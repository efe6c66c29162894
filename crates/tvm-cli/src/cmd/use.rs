//! Use command to change the active version
use anyhow::Result;

use tvm_core::{ClassifiedError, switch};
use tvm_schema::ToolchainVersion;

use crate::cmd::Env;
use crate::ui::output::success;

/// Switch the active version (CLI Entry Point)
pub fn use_version(version: &str) -> Result<()> {
    let env = Env::load()?;
    let version = ToolchainVersion::parse(version).map_err(ClassifiedError::from)?;

    let previous = switch::switch_version(&env.layout, env.store.as_ref(), &version)?;
    tracing::debug!(previous = ?previous, "Switched current link");

    success(&format!(
        "go{version} is now active ({})",
        env.layout.current_link().display()
    ));
    Ok(())
}
