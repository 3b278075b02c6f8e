//! blobmemo - Memoized computation over a blob store
//!
//! CLI entry point that dispatches to subcommands.

use blobmemo::cli::{Cli, Commands};
use blobmemo::config::{Config, ConfigManager};
use blobmemo::error::MemoResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> MemoResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let mut config = config_manager.load().await?;
    if let Some(ref root) = cli.store_root {
        config.store.root = Some(root.clone());
    }

    init_logging(cli.verbose, &config);
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Lock(args) => blobmemo::cli::commands::lock(args, &config).await,
        Commands::Memo(args) => blobmemo::cli::commands::memo(args, &config).await,
        Commands::Call(args) => {
            blobmemo::cli::commands::call(args, &config, &config_manager).await
        }
        Commands::Worker(args) => {
            blobmemo::cli::commands::worker(args, &config, &config_manager).await
        }
        Commands::Config(args) => {
            blobmemo::cli::commands::config(args, &config, &config_manager).await
        }
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` wins when set
fn init_logging(verbose: u8, config: &Config) {
    let default = match verbose {
        0 => "blobmemo=warn",
        1 => "blobmemo=info",
        _ => "blobmemo=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
