mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use lifesync::config::LifesyncConfig;

#[derive(Parser)]
#[command(name = "lifesync", version, about = "Lifelog sync agent: source API to memory store, at least once, deduplicated by record id")]
struct Cli {
    /// Config file (default: ~/.lifesync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent: scheduled passes, retries, health server
    Run,
    /// Run a single sync pass followed by a retry sweep
    Sync,
    /// Retry failed records only
    Retry,
    /// Show ledger statistics, recent passes and errors
    Status,
    /// Delete error and metrics history older than the retention window
    Cleanup {
        /// Retention in days (default: storage.retention_days)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Check configuration and database integrity
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => LifesyncConfig::load_from(path)?,
        None => LifesyncConfig::load()?,
    };

    // Log to stderr so command output on stdout stays clean.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run => cli::run::run(config).await?,
        Command::Sync => cli::run::sync_once(config).await?,
        Command::Retry => cli::run::retry(config).await?,
        Command::Status => cli::status::status(&config).await?,
        Command::Cleanup { days } => cli::maintenance::cleanup(&config, days).await?,
        Command::Doctor => cli::doctor::doctor(&config)?,
    }

    Ok(())
}
