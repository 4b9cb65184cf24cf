mod assets;
mod cli;
mod commands;
mod config;
mod error;

use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::{Args, Commands},
    commands::CommandExecutor,
    config::AppConfig,
};

const DEFAULT_LOG_FILTER: &str = "assetctl=info,session_coordinator=info";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings = AppConfig::load(args.config.as_deref())
        .context("failed to load configuration")?
        .resolve(&args)?;

    let executor = CommandExecutor::new(settings).context("failed to create HTTP client")?;
    executor.connect().await?;

    let result = match args.command {
        Commands::Whoami => executor.whoami().await,
        Commands::Tree { filter, json } => executor.tree(filter.as_deref(), json).await,
        Commands::Add { name, parent } => executor.add(&name, &parent).await,
        Commands::Remove { name } => executor.remove(&name).await,
        Commands::Watch { interval } => {
            executor
                .watch(Duration::from_secs(interval.max(1)))
                .await
        }
    };

    executor.close().await;
    Ok(result?)
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("warn")
    } else if verbose {
        EnvFilter::new("assetctl=debug,session_coordinator=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose),
        )
        .init();
}
