//! Failover decision engine.
//!
//! The [`Engine`] is the state owned by the actor. Timers, inbound datagrams
//! and operator calls all reach it as units on the actor queue, so every
//! method here runs with exclusive access.
//!
//! Each tick:
//!
//! 1. Declare the peer NoValid when its heartbeats stopped for longer than
//!    the remote timeout.
//! 2. Refresh the local adapter mask.
//! 3. Reconcile local and remote records through [`decide`] and apply the
//!    resulting [`Decision`].
//! 4. Broadcast the local record when any adapter is up.
//! 5. Re-arm the next tick, sooner when the node just left NoValid.

use crate::actor::ActorHandle;
use crate::addresses::AddressController;
use crate::network::{AdapterSnapshot, NetworkProvider};
use crate::node::{ClusterState, adapter_changes};
use crate::transport::HeartbeatSocket;
use crate::types::{EngineSettings, EngineStats, NodeState};
use crate::wire::{Heartbeat, Message, Opcode};
use common::{Error, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

/// Concurrent neighbor cache flushes
const FLUSH_WORKERS: usize = 2;

/// Pause after a failed receive before trying again
const RECV_RETRY: Duration = Duration::from_millis(100);

/// Inputs of one evaluation
#[derive(Debug, Clone)]
pub struct Assessment<'a> {
    pub local_state: NodeState,
    pub remote_state: NodeState,
    pub local_mask: u8,
    pub local_count: u32,
    /// Zero while the peer is NoValid
    pub remote_count: u32,
    pub local_begin: SystemTime,
    pub remote_begin: SystemTime,
    pub local_name: &'a str,
    pub remote_name: &'a str,
    /// Local has been Activating for longer than the activation timeout
    pub activating_expired: bool,
}

impl Assessment<'_> {
    /// Whether the local node entered its current state first.
    ///
    /// Exactly equal timestamps fall back to the node names so both sides
    /// reach the same answer.
    pub fn local_first(&self) -> bool {
        match self.local_begin.cmp(&self.remote_begin) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => self.local_name < self.remote_name,
        }
    }
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do
    Hold(&'static str),
    /// Adapters gone: release and go NoValid
    Withdraw,
    /// Adapters back: release leftovers and go NoActive
    Recover,
    /// Peer is down: start a claim unless the addresses already answer
    ClaimIfVacant,
    /// Start a claim
    BeginClaim(&'static str),
    /// Assign the virtual addresses now
    Takeover,
    /// Give up a pending claim in favor of the peer
    BackOff(&'static str),
    /// The pending claim took too long
    Abandon,
    /// Release owned addresses to the peer
    Cede(&'static str),
    /// Both nodes are Active
    SplitBrain,
}

/// Reconcile local and remote records into one transition.
pub fn decide(a: &Assessment<'_>) -> Decision {
    use NodeState::*;

    if a.local_mask == 0 {
        return match a.local_state {
            NoValid => Decision::Hold("no operational adapters"),
            _ => Decision::Withdraw,
        };
    }

    let (local, remote) = (a.local_count, a.remote_count);
    match a.local_state {
        NoValid => Decision::Recover,

        NoActive => match a.remote_state {
            NoValid => Decision::ClaimIfVacant,
            NoActive if local > remote || (local == remote && a.local_first()) => {
                Decision::BeginClaim("local has priority over inactive peer")
            }
            NoActive => Decision::Hold("peer has priority"),
            Activating | Active if local > remote => {
                Decision::BeginClaim("preempting peer with fewer adapters")
            }
            Activating | Active => Decision::Hold("peer owns or is claiming"),
        },

        Activating => {
            if a.activating_expired {
                return Decision::Abandon;
            }
            match a.remote_state {
                NoValid => Decision::Takeover,
                NoActive if local >= remote => Decision::Takeover,
                NoActive => Decision::Hold("peer is healthier"),
                Activating if remote > local || (remote == local && !a.local_first()) => {
                    Decision::BackOff("peer claim has priority")
                }
                Activating => Decision::Hold("waiting for peer to back off"),
                Active if remote > local => Decision::BackOff("peer active with more adapters"),
                Active => Decision::Hold("waiting for peer to release"),
            }
        }

        Active => match a.remote_state {
            Activating if remote >= local => {
                Decision::Cede("peer claiming with at least as many adapters")
            }
            Active => Decision::SplitBrain,
            _ => Decision::Hold("owner"),
        },
    }
}

/// Bound private link
struct Link {
    socket: Arc<HeartbeatSocket>,
    receiver: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Engine state owned by the actor
pub struct Engine {
    settings: EngineSettings,
    cluster: ClusterState,
    addresses: AddressController,
    provider: Arc<dyn NetworkProvider>,
    link: Option<Link>,
    last_heartbeat: Option<Instant>,
    local_since: Instant,
    stats: EngineStats,
    tick_timer: Option<JoinHandle<()>>,
    start_timer: Option<JoinHandle<()>>,
    handle: ActorHandle<Engine>,
    workers: Arc<Semaphore>,
    stopping: bool,
}

impl Engine {
    /// Create an idle engine; nothing runs until [`start`](Self::start).
    pub fn new(
        settings: EngineSettings,
        provider: Arc<dyn NetworkProvider>,
        handle: ActorHandle<Engine>,
    ) -> Self {
        let addresses =
            AddressController::new(&settings.bindings, provider.clone(), settings.probe_timeout);

        Self {
            cluster: ClusterState::new(&settings),
            addresses,
            provider,
            link: None,
            last_heartbeat: None,
            local_since: Instant::now(),
            stats: EngineStats::default(),
            tick_timer: None,
            start_timer: None,
            handle,
            workers: Arc::new(Semaphore::new(FLUSH_WORKERS)),
            stopping: false,
            settings,
        }
    }

    fn node(&self) -> &str {
        &self.cluster.local.name
    }

    /// Current records
    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    /// Copy of the current records
    pub fn snapshot(&self) -> ClusterState {
        self.cluster.clone()
    }

    /// Copy of the counters
    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    /// Number of virtual addresses currently assigned
    pub fn held_addresses(&self) -> usize {
        self.addresses.held()
    }

    /// Address of the bound private link socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link
            .as_ref()
            .and_then(|link| link.socket.local_addr().ok())
    }

    /// Record the replication status reported by an external monitor
    pub fn set_replication_status(&mut self, status: impl Into<String>) {
        let status = status.into();
        if status != self.cluster.local.replication_status {
            debug!(node = %self.node(), status = %status, "Replication status updated");
            self.cluster.local.replication_status = status;
        }
    }

    fn set_local_state(&mut self, state: NodeState, cause: impl Into<String>) -> bool {
        let changed = self.cluster.local.set_state(state, cause);
        if changed {
            self.stats.transitions += 1;
            self.local_since = Instant::now();
        }
        changed
    }

    /// Bind the private link and arm the startup timer.
    ///
    /// A bind failure is not fatal; the startup timer retries it.
    pub async fn start(&mut self) -> Result<()> {
        if self.stopping {
            return Err(Error::stopped("engine is shutting down"));
        }

        info!(
            node = %self.node(),
            local = %self.settings.local_addr,
            peer = %self.settings.peer_addr,
            provider = self.provider.name(),
            "Engine starting"
        );

        if self.link.is_none() {
            if let Err(e) = self.bind_link() {
                warn!(node = %self.node(), error = %e, "Private link bind failed; will retry");
            }
        }
        self.arm_start(self.settings.start_delay);
        Ok(())
    }

    async fn on_start_timer(&mut self) -> Result<()> {
        if self.stopping {
            return Ok(());
        }

        if let Err(e) = self.start_up().await {
            warn!(node = %self.node(), error = %e, "Startup failed; retrying");
            self.arm_start(self.settings.start_delay);
        }
        Ok(())
    }

    /// Bind the link if needed and, from NoValid, take the initial adapter
    /// snapshot, enter NoActive and start ticking.
    pub async fn start_up(&mut self) -> Result<()> {
        if self.link.is_none() {
            self.bind_link()?;
        }

        if self.cluster.local.state() != NodeState::NoValid {
            return Ok(());
        }

        self.addresses.release().await;
        let snapshot = self
            .provider
            .adapter_health(&self.settings.bindings)
            .await?;
        self.apply_adapters(snapshot);

        let cause = if self.cluster.local.valid_adapters_mask == 0 {
            "no operational adapters"
        } else if self.addresses.any_reachable().await {
            "cluster addresses found"
        } else {
            "initial status"
        };
        self.set_local_state(NodeState::NoActive, cause);
        self.arm_tick(self.settings.tick);
        Ok(())
    }

    /// Final unit: release everything and leave NoValid.
    pub async fn teardown(&mut self) -> Result<()> {
        self.stopping = true;
        for timer in [self.tick_timer.take(), self.start_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }

        self.set_local_state(NodeState::NoActive, "engine stopping");
        self.addresses.release().await;
        self.set_local_state(NodeState::NoValid, "engine stopped");

        // let the peer take over without waiting for the liveness timeout
        if let Some(link) = &self.link {
            if let Err(e) = link.socket.send(&Message::heartbeat(&self.cluster.local)).await {
                debug!(node = %self.node(), error = %e, "Farewell heartbeat failed");
            }
        }
        self.link = None;

        info!(node = %self.node(), "Engine stopped");
        Ok(())
    }

    fn schedule<F>(&self, name: &'static str, delay: Duration, job: F) -> JoinHandle<()>
    where
        F: for<'a> FnOnce(&'a mut Engine) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(e) = handle.submit(name, job) {
                debug!(unit = name, error = %e, "Timer dropped");
            }
        })
    }

    fn arm_tick(&mut self, delay: Duration) {
        let timer = self.schedule("tick", delay, |engine| engine.on_tick().boxed());
        if let Some(old) = self.tick_timer.replace(timer) {
            old.abort();
        }
    }

    fn arm_start(&mut self, delay: Duration) {
        let timer = self.schedule("start", delay, |engine| engine.on_start_timer().boxed());
        if let Some(old) = self.start_timer.replace(timer) {
            old.abort();
        }
    }

    async fn on_tick(&mut self) -> Result<()> {
        if self.stopping {
            return Ok(());
        }

        // armed first so a failing evaluation never breaks the chain
        self.arm_tick(self.settings.tick);
        if self.evaluate().await {
            self.arm_tick(self.settings.resync_interval());
        }
        Ok(())
    }

    fn bind_link(&mut self) -> Result<()> {
        let socket = HeartbeatSocket::bind(self.settings.local_addr, self.settings.peer_addr)?;
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);
        let receiver = tokio::spawn(receive_loop(socket.clone(), self.handle.clone()));

        info!(node = %self.node(), local = %local, peer = %socket.peer(), "Private link up");
        self.link = Some(Link { socket, receiver });
        Ok(())
    }

    fn reset_link(&mut self) {
        if self.link.take().is_some() {
            self.stats.link_resets += 1;
            self.arm_start(self.settings.start_delay);
        }
    }

    async fn broadcast(&mut self) {
        let Some(link) = &self.link else {
            return;
        };

        let msg = Message::heartbeat(&self.cluster.local);
        let sent = link.socket.send(&msg).await;
        match sent {
            Ok(()) => self.stats.heartbeats_sent += 1,
            Err(e) => {
                warn!(
                    node = %self.node(),
                    peer = %self.settings.peer_addr,
                    error = %e,
                    "Heartbeat send failed; resetting private link"
                );
                self.reset_link();
            }
        }
    }

    /// Handle one raw datagram from the private link
    pub async fn on_datagram(&mut self, data: &[u8], src: SocketAddr) -> Result<()> {
        let msg = match Message::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.invalid_datagrams += 1;
                return Err(e);
            }
        };

        match msg {
            Message::Heartbeat(hb) => {
                self.on_heartbeat(hb);
                Ok(())
            }
            Message::Control(op) => self.on_control(op, src).await,
            Message::StateReply(_) => {
                debug!(node = %self.node(), from = %src, "Ignoring unsolicited state reply");
                Ok(())
            }
        }
    }

    fn on_heartbeat(&mut self, hb: Heartbeat) {
        self.stats.heartbeats_received += 1;
        self.last_heartbeat = Some(Instant::now());

        let remote = hb.into_record();
        if remote.state() != self.cluster.remote.state() {
            info!(
                node = %self.node(),
                peer = %remote.name,
                from = %self.cluster.remote.state(),
                to = %remote.state(),
                cause = %remote.change_cause(),
                "Peer state changed"
            );
        }
        self.cluster.remote = remote;
    }

    async fn on_control(&mut self, op: Opcode, src: SocketAddr) -> Result<()> {
        info!(node = %self.node(), op = %op, from = %src, "Control request");
        match op {
            Opcode::Activate => self.activate().await,
            Opcode::Deactivate => self.deactivate().await,
            Opcode::GetState => {
                let Some(link) = &self.link else {
                    return Err(Error::other("private link is down"));
                };
                link.socket
                    .send_to(&Message::StateReply(self.cluster.clone()), src)
                    .await
            }
        }
    }

    fn check_liveness(&mut self) {
        if !self.cluster.remote.state().is_valid() {
            return;
        }

        let expired = self
            .last_heartbeat
            .is_none_or(|at| at.elapsed() > self.settings.remote_timeout);
        if expired {
            self.stats.liveness_losses += 1;
            warn!(
                node = %self.node(),
                peer = %self.cluster.remote.name,
                timeout_ms = self.settings.remote_timeout.as_millis() as u64,
                "Peer heartbeats timed out"
            );
            self.cluster
                .remote
                .set_state(NodeState::NoValid, "peer not operational");
        }
    }

    async fn refresh_adapters(&mut self) {
        match self.provider.adapter_health(&self.settings.bindings).await {
            Ok(snapshot) => self.apply_adapters(snapshot),
            Err(e) => {
                warn!(node = %self.node(), error = %e, "Adapter health unavailable; keeping last snapshot");
            }
        }
    }

    fn apply_adapters(&mut self, snapshot: AdapterSnapshot) {
        self.addresses.update_indices(&snapshot.indices);

        let old = self.cluster.local.valid_adapters_mask;
        for change in adapter_changes(old, snapshot.mask) {
            let bit = 1u8 << change.position;
            let adapter = self
                .settings
                .bindings
                .iter()
                .find(|b| b.adapter_mask == bit)
                .map(|b| b.adapter_ip.to_string())
                .unwrap_or_else(|| format!("bit {}", change.position));

            if change.up {
                info!(node = %self.node(), adapter = %adapter, "Adapter operational");
            } else {
                warn!(node = %self.node(), adapter = %adapter, "Adapter not operational");
            }
        }
        self.cluster.local.valid_adapters_mask = snapshot.mask;
    }

    fn assess(&self) -> Assessment<'_> {
        let local = &self.cluster.local;
        let remote = &self.cluster.remote;

        Assessment {
            local_state: local.state(),
            remote_state: remote.state(),
            local_mask: local.valid_adapters_mask,
            local_count: local.valid_adapters(),
            remote_count: if remote.state().is_valid() {
                remote.valid_adapters()
            } else {
                0
            },
            local_begin: local.state_begin(),
            remote_begin: remote.state_begin(),
            local_name: &local.name,
            remote_name: &remote.name,
            activating_expired: local.state() == NodeState::Activating
                && self.local_since.elapsed() > self.settings.activating_timeout(),
        }
    }

    /// Run one evaluation without re-arming any timer.
    ///
    /// Returns whether the local node left NoValid.
    pub async fn evaluate(&mut self) -> bool {
        self.check_liveness();
        self.refresh_adapters().await;

        let was_no_valid = self.cluster.local.state() == NodeState::NoValid;
        let decision = decide(&self.assess());
        self.apply(decision).await;

        if self.cluster.local.valid_adapters_mask != 0 {
            self.broadcast().await;
        }

        was_no_valid && self.cluster.local.state() != NodeState::NoValid
    }

    async fn apply(&mut self, decision: Decision) {
        match decision {
            Decision::Hold(reason) => {
                debug!(
                    node = %self.node(),
                    local = %self.cluster.local.state(),
                    remote = %self.cluster.remote.state(),
                    reason,
                    "Holding"
                );
            }
            Decision::Withdraw => {
                self.addresses.release().await;
                self.set_local_state(NodeState::NoValid, "no operational adapters");
            }
            Decision::Recover => {
                self.addresses.release().await;
                self.set_local_state(NodeState::NoActive, "adapters operational");
            }
            Decision::ClaimIfVacant => {
                if self.addresses.any_reachable().await {
                    info!(
                        node = %self.node(),
                        "Peer not operational but virtual addresses answer; waiting"
                    );
                } else {
                    self.set_local_state(NodeState::Activating, "peer not operational");
                }
            }
            Decision::BeginClaim(cause) => {
                self.set_local_state(NodeState::Activating, cause);
            }
            Decision::Takeover => self.take_over().await,
            Decision::BackOff(cause) => {
                self.set_local_state(NodeState::NoActive, cause);
            }
            Decision::Abandon => {
                warn!(
                    node = %self.node(),
                    timeout_ms = self.settings.activating_timeout().as_millis() as u64,
                    "Activation timed out"
                );
                self.set_local_state(NodeState::NoActive, "activation timed out");
            }
            Decision::Cede(cause) => {
                self.addresses.release().await;
                self.set_local_state(NodeState::NoActive, cause);
            }
            Decision::SplitBrain => {
                self.stats.split_brains += 1;
                error!(
                    node = %self.node(),
                    peer = %self.cluster.remote.name,
                    "Both nodes active; releasing virtual addresses"
                );
                self.addresses.release().await;
                self.set_local_state(NodeState::NoActive, "split brain: peer also active");
            }
        }
    }

    async fn take_over(&mut self) {
        match self.addresses.claim().await {
            Ok(()) => {
                self.set_local_state(NodeState::Active, "virtual addresses assigned");
                self.flush_neighbors();
            }
            Err(e) => {
                self.stats.failed_claims += 1;
                warn!(node = %self.node(), error = %e, "Takeover failed; releasing");
                self.addresses.release().await;
                self.set_local_state(NodeState::NoActive, format!("takeover failed: {}", e));
            }
        }
    }

    fn flush_neighbors(&self) {
        let provider = self.provider.clone();
        let workers = self.workers.clone();
        let node = self.node().to_string();

        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            match provider.flush_neighbor_cache().await {
                Ok(()) => debug!(node = %node, "Neighbor cache flushed"),
                Err(e) => warn!(node = %node, error = %e, "Neighbor cache flush failed"),
            }
        });
    }

    fn counts(&self) -> (u32, u32) {
        let remote = if self.cluster.remote.state().is_valid() {
            self.cluster.remote.valid_adapters()
        } else {
            0
        };
        (self.cluster.local.valid_adapters(), remote)
    }

    /// Ask this node to claim the virtual addresses.
    ///
    /// The takeover itself happens on the next tick.
    pub async fn activate(&mut self) -> Result<()> {
        let (local, remote) = self.counts();
        match self.cluster.local.state() {
            NodeState::Active => {
                info!(node = %self.node(), "Already active");
                Ok(())
            }
            NodeState::Activating => {
                info!(node = %self.node(), "Activation already in progress");
                Ok(())
            }
            NodeState::NoValid => {
                warn!(node = %self.node(), "Activation rejected: node not operational");
                Err(Error::rejected("local node has no operational adapters"))
            }
            NodeState::NoActive => {
                if self.cluster.remote.state().is_valid() && local < remote {
                    warn!(node = %self.node(), local, remote, "Activation rejected: peer is healthier");
                    return Err(Error::rejected(format!(
                        "remote node has more operational adapters ({} > {})",
                        remote, local
                    )));
                }
                self.set_local_state(NodeState::Activating, "activation requested");
                Ok(())
            }
        }
    }

    /// Ask this node to hand the virtual addresses to its peer
    pub async fn deactivate(&mut self) -> Result<()> {
        let (local, remote) = self.counts();
        match self.cluster.local.state() {
            NodeState::NoActive => {
                info!(node = %self.node(), "Already inactive");
                Ok(())
            }
            state => {
                if !self.cluster.remote.state().is_valid() {
                    warn!(node = %self.node(), "Deactivation rejected: no operational peer");
                    return Err(Error::rejected("no operational peer to hand over to"));
                }
                if remote < local {
                    warn!(node = %self.node(), local, remote, "Deactivation rejected: peer is less healthy");
                    return Err(Error::rejected(format!(
                        "remote node has fewer operational adapters ({} < {})",
                        remote, local
                    )));
                }
                if state == NodeState::Active {
                    self.addresses.release().await;
                }
                self.set_local_state(NodeState::NoActive, "deactivation requested");
                Ok(())
            }
        }
    }
}

async fn receive_loop(socket: Arc<HeartbeatSocket>, handle: ActorHandle<Engine>) {
    loop {
        match socket.recv().await {
            Ok((data, src)) => {
                let queued = handle.submit("datagram", move |engine| {
                    async move { engine.on_datagram(&data, src).await }.boxed()
                });
                if queued.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Receive failed");
                sleep(RECV_RETRY).await;
            }
        }
    }
}
