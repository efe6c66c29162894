//! Sources command: list, probe, add and remove download sources

use anyhow::Result;
use tokio::time::Instant;

use tvm_core::ClassifiedError;
use tvm_core::error::ErrorKind;
use tvm_schema::DownloadSource;

use crate::cmd::Env;
use crate::ui::output::success;
use crate::ui::table;

/// Print built-in and custom sources in priority order.
pub fn list() -> Result<()> {
    let env = Env::load()?;
    let sources = env.selector.list_sources();
    println!("{}", table::sources(&sources, |name| env.selector.is_builtin(name)));
    Ok(())
}

/// Probe the named sources (all when none are named) and print their latency.
pub async fn test(names: &[String]) -> Result<()> {
    let env = Env::load()?;
    let sources = pick(&env, names)?;

    // An explicit test always measures fresh.
    env.selector.clear_cache();
    let deadline = Instant::now() + env.settings.probe_timeout();
    let results = env.selector.probe_all(&sources, deadline).await;
    println!("{}", table::probes(&results));

    env.save_sources()?;
    Ok(())
}

/// Probe everything and report the fastest available source.
pub async fn fastest() -> Result<()> {
    let env = Env::load()?;
    let sources = env.selector.list_sources();
    let deadline = Instant::now() + env.settings.probe_timeout();
    let (source, probe) = env
        .selector
        .select_fastest(&sources, deadline)
        .await
        .map_err(ClassifiedError::from)?;
    env.save_sources()?;

    success(&format!(
        "{} ({} ms)  {}",
        source.name,
        probe.response_time.as_millis(),
        source.base_url
    ));
    Ok(())
}

/// Register a custom source.
pub fn add(name: &str, url: &str, priority: u32, region: &str, description: &str) -> Result<()> {
    let mut env = Env::load()?;
    let source = DownloadSource::new(name.trim(), url.trim(), priority)
        .with_region(region)
        .with_description(description);
    env.selector.add_custom(source).map_err(ClassifiedError::from)?;
    env.save_sources()?;
    success(&format!("Added source '{}'", name.trim()));
    Ok(())
}

/// Remove a custom source; built-ins are rejected.
pub fn remove(name: &str) -> Result<()> {
    let mut env = Env::load()?;
    let removed = env.selector.remove_custom(name).map_err(ClassifiedError::from)?;
    env.save_sources()?;
    success(&format!("Removed source '{}' ({})", removed.name, removed.base_url));
    Ok(())
}

fn pick(env: &Env, names: &[String]) -> Result<Vec<DownloadSource>, ClassifiedError> {
    if names.is_empty() {
        return Ok(env.selector.list_sources());
    }
    names
        .iter()
        .map(|name| {
            env.selector.find(name).cloned().ok_or_else(|| {
                ClassifiedError::new(ErrorKind::Validation, format!("Unknown source '{name}'"))
                    .with_context("known", source_names(env))
            })
        })
        .collect()
}

fn source_names(env: &Env) -> String {
    env.selector
        .list_sources()
        .into_iter()
        .map(|s| s.name)
        .collect::<Vec<_>>()
        .join(", ")
}
