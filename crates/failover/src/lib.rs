//! Two-node active/passive address failover
//!
//! Two peers on a private link exchange heartbeats and decide, each on its
//! own but by the same rules, which of them owns a set of virtual addresses.
//! Ownership moves when the active node loses adapters, stops answering, or
//! an operator asks for it.
//!
//! # Features
//!
//! - Per-node lifecycle: NoValid, NoActive, Activating, Active
//! - Preemption by adapter health, ties broken by earliest claim
//! - Liveness timeout on the peer's heartbeats
//! - Conflict probing before takeover, rollback on partial assignment
//! - Split-brain detection with self-demotion
//! - All state mutation serialized on a single actor task
//!
//! # Example
//!
//! ```no_run
//! use failover::{AdapterBinding, EngineSettings, FailoverCluster, SimulatedNetwork};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = EngineSettings {
//!     node_id: "node-a".to_string(),
//!     local_addr: "10.0.0.1:7001".parse()?,
//!     peer_addr: "10.0.0.2:7001".parse()?,
//!     bindings: vec![
//!         AdapterBinding::new(0, "192.168.1.10".parse()?, "192.168.1.100".parse()?, 24),
//!         AdapterBinding::new(1, "192.168.2.10".parse()?, "192.168.2.100".parse()?, 24),
//!     ],
//!     tick: Duration::from_secs(1),
//!     start_delay: Duration::from_secs(5),
//!     remote_timeout: Duration::from_secs(5),
//!     probe_timeout: Duration::from_millis(500),
//! };
//!
//! let network = Arc::new(SimulatedNetwork::new("node-a", 0b11));
//! let cluster = FailoverCluster::start(settings, network).await?;
//!
//! println!("{}", cluster.state().await?);
//! cluster.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod addresses;
pub mod client;
pub mod cluster;
pub mod engine;
pub mod network;
pub mod node;
pub mod simulated;
pub mod transport;
pub mod types;
pub mod wire;

pub use actor::ActorHandle;
pub use addresses::AddressController;
pub use client::ControlClient;
pub use cluster::FailoverCluster;
pub use engine::{Assessment, Decision, Engine, decide};
pub use network::{AdapterSnapshot, AssignmentHandle, NetworkProvider};
pub use node::{ClusterState, NodeRecord};
pub use simulated::{NetworkCall, Segment, SimulatedNetwork};
pub use transport::HeartbeatSocket;
pub use types::{AdapterBinding, EngineSettings, EngineStats, NodeState};
pub use wire::{Heartbeat, Message, Opcode};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_types() {
        let state = NodeState::default();
        assert_eq!(state.to_string(), "NO_VALID");
        assert_eq!(EngineStats::default().transitions, 0);
    }
}
