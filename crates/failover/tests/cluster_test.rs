//! Two nodes on loopback
//!
//! Both nodes run the full engine with timers and real UDP sockets, sharing
//! one simulated segment so each sees the other's virtual addresses.

use failover::{
    AdapterBinding, ClusterState, ControlClient, EngineSettings, FailoverCluster, NodeState,
    Segment, SimulatedNetwork,
};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const CONVERGE: Duration = Duration::from_secs(10);

fn free_addr() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

fn settings(node_id: &str, local: SocketAddr, peer: SocketAddr) -> EngineSettings {
    EngineSettings {
        node_id: node_id.to_string(),
        local_addr: local,
        peer_addr: peer,
        bindings: vec![
            AdapterBinding::new(
                0,
                "10.12.90.1".parse().unwrap(),
                "10.12.90.88".parse().unwrap(),
                24,
            ),
            AdapterBinding::new(
                1,
                "10.20.90.1".parse().unwrap(),
                "10.20.90.88".parse().unwrap(),
                24,
            ),
        ],
        tick: Duration::from_millis(50),
        start_delay: Duration::from_millis(50),
        remote_timeout: Duration::from_millis(500),
        probe_timeout: Duration::from_millis(20),
    }
}

struct Pair {
    a: FailoverCluster,
    b: FailoverCluster,
    a_addr: SocketAddr,
    net_a: Arc<SimulatedNetwork>,
    net_b: Arc<SimulatedNetwork>,
}

async fn start_pair() -> Pair {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("failover=debug")
        .with_test_writer()
        .try_init();

    let (a_addr, b_addr) = (free_addr(), free_addr());
    let segment = Segment::new();
    let net_a = Arc::new(SimulatedNetwork::with_segment("node-a", 0b11, segment.clone()));
    let net_b = Arc::new(SimulatedNetwork::with_segment("node-b", 0b11, segment));

    let a = FailoverCluster::start(settings("node-a", a_addr, b_addr), net_a.clone())
        .await
        .unwrap();
    let b = FailoverCluster::start(settings("node-b", b_addr, a_addr), net_b.clone())
        .await
        .unwrap();

    Pair {
        a,
        b,
        a_addr,
        net_a,
        net_b,
    }
}

/// Poll both nodes until `done` holds for their local states
async fn wait_for<F>(a: &FailoverCluster, b: &FailoverCluster, done: F) -> (ClusterState, ClusterState)
where
    F: Fn(NodeState, NodeState) -> bool,
{
    timeout(CONVERGE, async {
        loop {
            let sa = a.state().await.unwrap();
            let sb = b.state().await.unwrap();
            if done(sa.local.state(), sb.local.state()) {
                return (sa, sb);
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("pair did not converge")
}

fn one_active(a: NodeState, b: NodeState) -> bool {
    matches!(
        (a, b),
        (NodeState::Active, NodeState::NoActive) | (NodeState::NoActive, NodeState::Active)
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pair_elects_single_owner() {
    let pair = start_pair().await;

    let (sa, sb) = wait_for(&pair.a, &pair.b, one_active).await;
    let (owner, standby) = if sa.local.state() == NodeState::Active {
        (&pair.net_a, &pair.net_b)
    } else {
        (&pair.net_b, &pair.net_a)
    };
    assert_eq!(owner.held_addresses().await.len(), 2);
    assert!(standby.held_addresses().await.is_empty());
    assert_eq!(sa.remote.name, "node-b");
    assert_eq!(sb.remote.name, "node-a");

    pair.a.stop().await.unwrap();
    pair.b.stop().await.unwrap();
    assert!(pair.net_a.held_addresses().await.is_empty());
    assert!(pair.net_b.held_addresses().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_standby_takes_over_when_owner_stops() {
    let pair = start_pair().await;
    let (sa, _) = wait_for(&pair.a, &pair.b, one_active).await;

    let (owner, survivor, survivor_net) = if sa.local.state() == NodeState::Active {
        (&pair.a, &pair.b, &pair.net_b)
    } else {
        (&pair.b, &pair.a, &pair.net_a)
    };
    owner.stop().await.unwrap();

    timeout(CONVERGE, async {
        while survivor.state().await.unwrap().local.state() != NodeState::Active {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("survivor never took over");
    assert_eq!(survivor_net.held_addresses().await.len(), 2);

    survivor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_client_status_and_handover() {
    let pair = start_pair().await;
    wait_for(&pair.a, &pair.b, one_active).await;

    let client = ControlClient::connect(pair.a_addr)
        .await
        .unwrap()
        .with_timeout(Duration::from_secs(2));
    let status = client.status().await.unwrap();
    assert_eq!(status.local.name, "node-a");
    assert_eq!(status.remote.name, "node-b");
    assert!(status.to_string().contains("Local node:"));

    // make node-a the owner, then hand over through the control opcode
    if status.local.state() != NodeState::Active {
        pair.b.deactivate().await.unwrap();
        wait_for(&pair.a, &pair.b, |a, b| {
            a == NodeState::Active && b == NodeState::NoActive
        })
        .await;
    }

    client.deactivate().await.unwrap();
    wait_for(&pair.a, &pair.b, |a, b| {
        a == NodeState::NoActive && b == NodeState::Active
    })
    .await;

    pair.a.stop().await.unwrap();
    pair.b.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_settings_are_refused() {
    let mut bad = settings("node-a", free_addr(), free_addr());
    bad.bindings.truncate(1);
    let net = Arc::new(SimulatedNetwork::new("node-a", 0b11));

    assert!(FailoverCluster::start(bad, net).await.is_err());
}

#[tokio::test]
async fn test_operations_after_stop_fail() {
    let net = Arc::new(SimulatedNetwork::new("node-a", 0b11));
    let cluster = FailoverCluster::start(settings("node-a", free_addr(), free_addr()), net)
        .await
        .unwrap();

    cluster.report_replication_status("1").unwrap();
    cluster.stop().await.unwrap();

    assert!(cluster.activate().await.is_err());
    assert!(cluster.state().await.is_err());
    assert!(cluster.report_replication_status("2").is_err());
    cluster.stop().await.unwrap();
}

#[tokio::test]
async fn test_dropping_cluster_releases_addresses() {
    let net = Arc::new(SimulatedNetwork::new("node-a", 0b11));
    let cluster = FailoverCluster::start(settings("node-a", free_addr(), free_addr()), net.clone())
        .await
        .unwrap();

    timeout(CONVERGE, async {
        while cluster.state().await.unwrap().local.state() != NodeState::Active {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("lone node never became active");
    assert_eq!(net.held_addresses().await.len(), 2);

    let engine = cluster.engine().clone();
    drop(cluster);

    timeout(Duration::from_secs(5), engine.stopped())
        .await
        .expect("engine kept running after drop");
    assert!(!engine.is_running());
    assert!(net.held_addresses().await.is_empty());
}
