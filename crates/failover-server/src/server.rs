//! failoverd main loop.

use crate::config::{Config, NetworkMode};
use crate::hooks::CommandNetwork;
use failover::{FailoverCluster, NetworkProvider, SimulatedNetwork};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Failover daemon
pub struct FailoverServer {
    config: Config,
}

impl FailoverServer {
    /// Create a new daemon from validated configuration
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Network collaborator selected by the configuration
    pub fn provider(&self) -> Arc<dyn NetworkProvider> {
        match self.config.network.mode {
            NetworkMode::Simulated => {
                let mask = SimulatedNetwork::mask_for(self.config.network.simulated_adapters);
                Arc::new(SimulatedNetwork::new(self.config.node.id.clone(), mask))
            }
            NetworkMode::Command => Arc::new(CommandNetwork::new(self.config.network.commands.clone())),
        }
    }

    /// Start the engine without waiting for shutdown
    pub async fn start(&self) -> anyhow::Result<FailoverCluster> {
        let settings = self.config.to_engine_settings()?;
        let provider = self.provider();
        info!(
            node = %settings.node_id,
            listen = %settings.local_addr,
            peer = %settings.peer_addr,
            adapters = settings.bindings.len(),
            network = provider.name(),
            "Starting failover daemon"
        );
        Ok(FailoverCluster::start(settings, provider).await?)
    }

    /// Run until `shutdown` completes, then release everything
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let cluster = self.start().await?;
        shutdown.await;

        info!(node = %cluster.node_id(), "Shutting down");
        match cluster.stats().await {
            Ok(stats) => info!(
                transitions = stats.transitions,
                heartbeats_sent = stats.heartbeats_sent,
                heartbeats_received = stats.heartbeats_received,
                split_brains = stats.split_brains,
                "Final statistics"
            ),
            Err(e) => warn!(error = %e, "Could not read statistics"),
        }
        cluster.stop().await?;
        info!("Failover daemon stopped");
        Ok(())
    }

    /// Run until SIGINT/Ctrl+C
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Signal handler failed; shutting down");
            }
        })
        .await
    }
}
