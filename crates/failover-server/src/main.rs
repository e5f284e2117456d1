//! failoverd - two-node failover daemon

use anyhow::{Context, Result};
use clap::Parser;
use failover_server::{Config, FailoverServer};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "failoverd")]
#[command(about = "Two-node virtual address failover daemon", long_about = None)]
struct Cli {
    /// Config file path; searched in the standard locations when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging is not up yet; config errors go to stderr via anyhow
    let config = Config::resolve(cli.config.as_deref()).context("failed to load configuration")?;

    let level = cli
        .log_level
        .as_deref()
        .or(config.logging.level.as_deref())
        .unwrap_or("info")
        .to_string();
    common::logging::init_with(&level, cli.json || config.json_logs());

    tracing::info!("failoverd starting");
    FailoverServer::new(config).run().await
}
