//! failoverctl - operator control for a running failoverd

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use failover::ControlClient;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "failoverctl")]
#[command(about = "Inspect and steer a failover node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Heartbeat/control endpoint of the node
    #[arg(short, long, global = true, default_value = "127.0.0.1:7001")]
    node: SocketAddr,

    /// How long to wait for a status reply
    #[arg(short, long, global = true, default_value = "2s", value_parser = humantime::parse_duration)]
    timeout: Duration,
}

#[derive(Subcommand)]
enum Commands {
    /// Show local and remote node records
    Status,

    /// Ask the node to claim the virtual addresses
    Activate,

    /// Ask the node to hand the virtual addresses to its peer
    Deactivate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = ControlClient::connect(cli.node)
        .await
        .with_context(|| format!("cannot reach {}", cli.node))?
        .with_timeout(cli.timeout);

    match cli.command {
        Commands::Status => {
            let state = client.status().await.context("no status reply")?;
            println!("{}", state);
        }
        Commands::Activate => {
            client.activate().await?;
            println!("Activate sent to {}", cli.node);
        }
        Commands::Deactivate => {
            client.deactivate().await?;
            println!("Deactivate sent to {}", cli.node);
        }
    }

    Ok(())
}
