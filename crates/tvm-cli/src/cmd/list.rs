//! List command

use anyhow::Result;

use tvm_core::{ClassifiedError, VersionStore};

use crate::cmd::Env;
use crate::ui::table;

/// List installed versions
pub fn list() -> Result<()> {
    let env = Env::load()?;
    let records = env.store.list().map_err(ClassifiedError::from)?;

    if records.is_empty() {
        println!("No versions installed.");
        println!("Run 'tvm install <version>' to get started.");
        return Ok(());
    }

    println!("{}", table::versions(&records));
    Ok(())
}
