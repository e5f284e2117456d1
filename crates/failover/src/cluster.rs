//! Operator-facing handle to a running engine.

use crate::actor::{self, ActorHandle};
use crate::engine::Engine;
use crate::network::NetworkProvider;
use crate::node::ClusterState;
use crate::types::{EngineSettings, EngineStats};
use common::Result;
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// One node of a two-node failover pair
pub struct FailoverCluster {
    node_id: String,
    engine: ActorHandle<Engine>,
}

impl FailoverCluster {
    /// Validate `settings`, spawn the engine and start it.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        settings: EngineSettings,
        provider: Arc<dyn NetworkProvider>,
    ) -> Result<Self> {
        let cluster = Self::new(settings, provider)?;
        cluster
            .engine
            .call("start", |engine| engine.start().boxed())
            .await?;
        Ok(cluster)
    }

    /// Validate `settings` and spawn an idle engine.
    ///
    /// Nothing is bound and no timer runs until the engine is started.
    pub fn new(settings: EngineSettings, provider: Arc<dyn NetworkProvider>) -> Result<Self> {
        settings.validate()?;
        let node_id = settings.node_id.clone();
        let engine = actor::spawn(format!("failover-{}", node_id), |handle| {
            Engine::new(settings, provider, handle)
        });

        info!(node = %node_id, "Failover engine created");
        Ok(Self { node_id, engine })
    }

    /// Identity of this node
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Actor running the engine
    pub fn engine(&self) -> &ActorHandle<Engine> {
        &self.engine
    }

    /// Ask this node to claim the virtual addresses
    pub async fn activate(&self) -> Result<()> {
        self.engine
            .call("activate", |engine| engine.activate().boxed())
            .await
    }

    /// Ask this node to hand the virtual addresses to its peer
    pub async fn deactivate(&self) -> Result<()> {
        self.engine
            .call("deactivate", |engine| engine.deactivate().boxed())
            .await
    }

    /// Last committed local and remote records
    pub async fn state(&self) -> Result<ClusterState> {
        self.engine
            .call("state", |engine| async move { Ok(engine.snapshot()) }.boxed())
            .await
    }

    /// Engine counters
    pub async fn stats(&self) -> Result<EngineStats> {
        self.engine
            .call("stats", |engine| async move { Ok(engine.stats()) }.boxed())
            .await
    }

    /// Address the private link is bound to, if bound
    pub async fn local_addr(&self) -> Result<Option<SocketAddr>> {
        self.engine
            .call("local_addr", |engine| async move { Ok(engine.local_addr()) }.boxed())
            .await
    }

    /// Publish the replication status in the next heartbeats
    pub fn report_replication_status(&self, status: impl Into<String>) -> Result<()> {
        let status = status.into();
        self.engine.submit("replication_status", move |engine| {
            async move {
                engine.set_replication_status(status);
                Ok(())
            }
            .boxed()
        })
    }

    /// Drain queued work, release the virtual addresses and stop the engine
    pub async fn stop(&self) -> Result<()> {
        info!(node = %self.node_id, "Stopping failover engine");
        self.engine
            .shutdown("teardown", |engine| engine.teardown().boxed())
            .await
    }
}

impl Drop for FailoverCluster {
    fn drop(&mut self) {
        let closed = self
            .engine
            .close("teardown", |engine| engine.teardown().boxed());
        if closed {
            info!(node = %self.node_id, "Failover cluster dropped without stop; tearing down");
        }
    }
}
