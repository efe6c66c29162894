//! tvm - Toolchain Version Manager

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tvm_cli::cmd;
use tvm_cli::ui::output::print_error;
use tvm_cli::{Cli, Commands, SourcesCommands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "tvm_core=debug,tvm_cli=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let verbose = cli.verbose;
    let quiet = cli.quiet;

    let outcome = match cli.command {
        Commands::Install(args) => cmd::install::install(&args, quiet).await,
        Commands::List => cmd::list::list(),
        Commands::Use { version } => cmd::r#use::use_version(&version),
        Commands::Sources { command } => match command {
            SourcesCommands::List => cmd::sources::list(),
            SourcesCommands::Test { names } => cmd::sources::test(&names).await,
            SourcesCommands::Fastest => cmd::sources::fastest().await,
            SourcesCommands::Add {
                name,
                url,
                priority,
                region,
                description,
            } => cmd::sources::add(&name, &url, priority, &region, &description),
            SourcesCommands::Remove { name } => cmd::sources::remove(&name),
        },
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            print_error(&tvm_core::classify(err), verbose);
            ExitCode::FAILURE
        }
    }
}
