//! Install command

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tvm_core::io::verify::parse_algorithm;
use tvm_core::{ClassifiedError, InstallOptions, Installer, Reporter, Settings};
use tvm_schema::ToolchainVersion;

use crate::InstallArgs;
use crate::cmd::Env;
use crate::ui::TerminalReporter;
use crate::ui::output::success;

/// Install one version (CLI Entry Point)
pub async fn install(args: &InstallArgs, quiet: bool) -> Result<()> {
    let env = Env::load()?;
    let version = ToolchainVersion::parse(&args.version).map_err(ClassifiedError::from)?;
    let options = options_from_args(args, &env.settings)?;

    let cancel = CancellationToken::new();
    let selector = Arc::new(env.selector);
    let installer = Installer::new(
        env.layout.clone(),
        Arc::clone(&selector),
        env.store.clone(),
        env.client.clone(),
    )
    .with_settings(env.settings.clone())
    .with_cancel(cancel.clone());

    // Ctrl-C cancels the attempt; the pipeline rolls back before returning.
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let reporter: Arc<dyn Reporter> = Arc::new(TerminalReporter::new(quiet));
    let result = installer.install(&version, &options, reporter).await;
    interrupt.abort();

    if let Err(e) = selector.save(&env.layout.mirrors_path()) {
        warn!("Failed to persist probe cache: {e}");
    }

    let result = result.into_result()?;
    debug!(
        %version,
        source = result.source.as_deref().unwrap_or("-"),
        secs = result.duration.as_secs_f64(),
        "Install finished"
    );
    if options.activate && !quiet {
        success(&format!("go{version} is now active"));
    }
    Ok(())
}

/// Settings first, flags on top.
fn options_from_args(args: &InstallArgs, settings: &Settings) -> Result<InstallOptions, ClassifiedError> {
    let mut options = InstallOptions::from_settings(settings);
    options.force = args.force;
    options.custom_path.clone_from(&args.path);
    options.skip_verification = args.skip_verification;
    options.activate = args.activate;
    if let Some(timeout) = args.timeout {
        options.timeout_seconds = timeout;
    }
    if let Some(retries) = args.retries {
        options.max_retries = retries;
    }
    if let Some(mirror) = &args.mirror {
        options.mirror.clone_from(mirror);
        options.auto_mirror = false;
    }
    if args.auto_mirror {
        options.auto_mirror = true;
    }
    if let Some(checksum) = &args.checksum {
        options.checksum = Some(checksum.trim().to_lowercase());
        options.checksum_algorithm = parse_algorithm(&args.algorithm)?;
    }
    options.validate()?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cli, Commands};
    use clap::Parser;
    use tvm_core::ErrorKind;
    use tvm_schema::HashAlgorithm;

    fn parse(argv: &[&str]) -> InstallArgs {
        let cli = Cli::try_parse_from(std::iter::once("tvm").chain(argv.iter().copied())).unwrap();
        match cli.command {
            Commands::Install(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn flags_override_settings() {
        let settings = Settings {
            auto_mirror: true,
            timeout_seconds: 600,
            ..Settings::default()
        };
        let args = parse(&["install", "1.22.3", "--mirror", "aliyun", "--timeout", "30", "--retries", "1", "--use"]);
        let options = options_from_args(&args, &settings).unwrap();
        assert_eq!(options.mirror, "aliyun");
        assert!(!options.auto_mirror);
        assert_eq!(options.timeout_seconds, 30);
        assert_eq!(options.max_retries, 1);
        assert!(options.activate);
    }

    #[test]
    fn settings_apply_without_flags() {
        let settings = Settings {
            timeout_seconds: 42,
            ..Settings::default()
        };
        let options = options_from_args(&parse(&["install", "1.21.0"]), &settings).unwrap();
        assert_eq!(options.timeout_seconds, 42);
        assert_eq!(options.mirror, settings.default_mirror);
        assert!(options.checksum.is_none());
    }

    #[test]
    fn checksum_uses_requested_algorithm() {
        let digest = "A".repeat(40);
        let args = parse(&["install", "1.21.0", "--checksum", &digest, "--algorithm", "sha1"]);
        let options = options_from_args(&args, &Settings::default()).unwrap();
        assert_eq!(options.checksum_algorithm, HashAlgorithm::Sha1);
        assert_eq!(options.checksum.as_deref(), Some("a".repeat(40).as_str()));
    }

    #[test]
    fn checksum_length_is_checked() {
        let args = parse(&["install", "1.21.0", "--checksum", "abcd"]);
        let err = options_from_args(&args, &Settings::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn mirror_and_auto_mirror_conflict() {
        let argv = ["tvm", "install", "1.21.0", "--mirror", "official", "--auto-mirror"];
        assert!(Cli::try_parse_from(argv).is_err());
    }
}
