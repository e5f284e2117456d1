//! Simulated failover pair
//!
//! Runs two nodes on loopback with simulated adapters, prints their state
//! periodically and pulls the adapters of whichever node is active every
//! few seconds to show the handover.
//!
//! Usage:
//!   cargo run --example simulated_pair

use failover::{
    AdapterBinding, EngineSettings, FailoverCluster, NodeState, Segment, SimulatedNetwork,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;

fn settings(node_id: &str, local: SocketAddr, peer: SocketAddr) -> EngineSettings {
    EngineSettings {
        node_id: node_id.to_string(),
        local_addr: local,
        peer_addr: peer,
        bindings: vec![
            AdapterBinding::new(0, "10.12.90.1".parse().unwrap(), "10.12.90.88".parse().unwrap(), 24),
            AdapterBinding::new(1, "10.20.90.1".parse().unwrap(), "10.20.90.88".parse().unwrap(), 24),
        ],
        tick: Duration::from_millis(500),
        start_delay: Duration::from_secs(1),
        remote_timeout: Duration::from_secs(2),
        probe_timeout: Duration::from_millis(200),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("failover=info")
        .init();

    let a_addr: SocketAddr = "127.0.0.1:17001".parse()?;
    let b_addr: SocketAddr = "127.0.0.1:17002".parse()?;

    let segment = Segment::new();
    let net_a = Arc::new(SimulatedNetwork::with_segment("node-a", 0b11, segment.clone()));
    let net_b = Arc::new(SimulatedNetwork::with_segment("node-b", 0b11, segment));

    let a = FailoverCluster::start(settings("node-a", a_addr, b_addr), net_a.clone()).await?;
    let b = FailoverCluster::start(settings("node-b", b_addr, a_addr), net_b.clone()).await?;

    println!("Two simulated nodes running; press Ctrl+C to stop");
    println!();

    let mut tick = interval(Duration::from_secs(5));
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let sa = a.state().await?;
                let sb = b.state().await?;
                println!("{}", sa);
                println!();

                // restore everyone, then fail the current owner
                net_a.set_adapter_mask(0b11).await;
                net_b.set_adapter_mask(0b11).await;
                if sa.local.state() == NodeState::Active {
                    println!(">>> pulling adapters of node-a");
                    net_a.set_adapter_mask(0).await;
                } else if sb.local.state() == NodeState::Active {
                    println!(">>> pulling adapters of node-b");
                    net_b.set_adapter_mask(0).await;
                }
            }
            _ = signal::ctrl_c() => break,
        }
    }

    a.stop().await?;
    b.stop().await?;

    println!("Final statistics:");
    println!("  node-a: {:?}", net_a.held_addresses().await);
    println!("  node-b: {:?}", net_b.held_addresses().await);
    Ok(())
}
