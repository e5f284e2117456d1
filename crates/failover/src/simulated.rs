//! In-memory network collaborator.
//!
//! Used to run nodes without touching the host network stack: adapter health
//! is a settable mask, and a shared [`Segment`] models which virtual
//! addresses answer on the wire so two simulated nodes see each other's
//! assignments. Every call is recorded.

use crate::network::{AdapterSnapshot, AssignmentHandle, NetworkProvider};
use crate::types::AdapterBinding;
use async_trait::async_trait;
use common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Shared view of which virtual addresses are currently held, and by whom
#[derive(Debug, Default)]
pub struct Segment {
    holders: Mutex<HashMap<IpAddr, HashSet<String>>>,
}

impl Segment {
    /// Create an empty segment
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether any node holds `ip`
    pub async fn is_reachable(&self, ip: IpAddr) -> bool {
        self.holders
            .lock()
            .await
            .get(&ip)
            .is_some_and(|owners| !owners.is_empty())
    }

    /// Owners of `ip`
    pub async fn holders_of(&self, ip: IpAddr) -> Vec<String> {
        let mut owners: Vec<_> = self
            .holders
            .lock()
            .await
            .get(&ip)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default();
        owners.sort();
        owners
    }

    /// Mark `ip` as held by `owner`, outside of any provider
    pub async fn occupy(&self, ip: IpAddr, owner: &str) {
        self.holders
            .lock()
            .await
            .entry(ip)
            .or_default()
            .insert(owner.to_string());
    }

    /// Drop `owner`'s hold on `ip`
    pub async fn vacate(&self, ip: IpAddr, owner: &str) {
        let mut holders = self.holders.lock().await;
        if let Some(owners) = holders.get_mut(&ip) {
            owners.remove(owner);
            if owners.is_empty() {
                holders.remove(&ip);
            }
        }
    }
}

/// A recorded collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCall {
    Assign { ip: IpAddr, adapter_index: u32 },
    ClearHandle(AssignmentHandle),
    ClearAddress(IpAddr),
    Health,
    Probe(IpAddr),
    Flush,
}

#[derive(Debug, Default)]
struct Inner {
    adapter_mask: u8,
    next_handle: AssignmentHandle,
    assignments: HashMap<AssignmentHandle, IpAddr>,
    failing: HashSet<IpAddr>,
    health_error: bool,
    calls: Vec<NetworkCall>,
}

/// Simulated network provider
#[derive(Debug)]
pub struct SimulatedNetwork {
    owner: String,
    segment: Arc<Segment>,
    inner: Mutex<Inner>,
}

impl SimulatedNetwork {
    /// Create a provider on its own segment
    pub fn new(owner: impl Into<String>, adapter_mask: u8) -> Self {
        Self::with_segment(owner, adapter_mask, Segment::new())
    }

    /// Create a provider attached to a shared segment
    pub fn with_segment(owner: impl Into<String>, adapter_mask: u8, segment: Arc<Segment>) -> Self {
        Self {
            owner: owner.into(),
            segment,
            inner: Mutex::new(Inner {
                adapter_mask,
                next_handle: 1,
                ..Inner::default()
            }),
        }
    }

    /// Mask with the lowest `count` adapters operational
    pub fn mask_for(count: u8) -> u8 {
        match count {
            0 => 0,
            c if c >= 8 => 0xFF,
            c => (1u8 << c) - 1,
        }
    }

    /// The segment this provider publishes to
    pub fn segment(&self) -> Arc<Segment> {
        self.segment.clone()
    }

    /// Change which adapters are operational
    pub async fn set_adapter_mask(&self, mask: u8) {
        self.inner.lock().await.adapter_mask = mask;
    }

    /// Make assignments of `ip` fail (or succeed again)
    pub async fn fail_assign(&self, ip: IpAddr, failing: bool) {
        let mut inner = self.inner.lock().await;
        if failing {
            inner.failing.insert(ip);
        } else {
            inner.failing.remove(&ip);
        }
    }

    /// Make adapter health snapshots fail (or succeed again)
    pub async fn fail_health(&self, failing: bool) {
        self.inner.lock().await.health_error = failing;
    }

    /// Addresses currently assigned through this provider
    pub async fn held_addresses(&self) -> Vec<IpAddr> {
        let mut held: Vec<_> = self.inner.lock().await.assignments.values().copied().collect();
        held.sort();
        held
    }

    /// Recorded calls, oldest first
    pub async fn calls(&self) -> Vec<NetworkCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Forget recorded calls
    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Number of neighbor cache flushes
    pub async fn flush_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, NetworkCall::Flush))
            .count()
    }
}

#[async_trait]
impl NetworkProvider for SimulatedNetwork {
    async fn assign(
        &self,
        ip: IpAddr,
        prefix_len: u8,
        adapter_index: u32,
    ) -> Result<AssignmentHandle> {
        let handle = {
            let mut inner = self.inner.lock().await;
            inner.calls.push(NetworkCall::Assign { ip, adapter_index });

            if inner.failing.contains(&ip) {
                return Err(Error::address(format!("simulated failure assigning {}", ip)));
            }

            let handle = inner.next_handle;
            inner.next_handle += 1;
            inner.assignments.insert(handle, ip);
            handle
        };

        self.segment.occupy(ip, &self.owner).await;
        info!(owner = %self.owner, ip = %ip, prefix_len, adapter_index, handle, "Simulated address assigned");
        Ok(handle)
    }

    async fn clear_handle(&self, handle: AssignmentHandle) -> Result<()> {
        let ip = {
            let mut inner = self.inner.lock().await;
            inner.calls.push(NetworkCall::ClearHandle(handle));
            inner
                .assignments
                .remove(&handle)
                .ok_or_else(|| Error::address(format!("unknown assignment handle {}", handle)))?
        };

        let still_held = self.inner.lock().await.assignments.values().any(|a| *a == ip);
        if !still_held {
            self.segment.vacate(ip, &self.owner).await;
        }
        info!(owner = %self.owner, ip = %ip, handle, "Simulated address cleared");
        Ok(())
    }

    async fn clear_address(&self, ip: IpAddr) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.calls.push(NetworkCall::ClearAddress(ip));
            inner.assignments.retain(|_, assigned| *assigned != ip);
        }

        self.segment.vacate(ip, &self.owner).await;
        debug!(owner = %self.owner, ip = %ip, "Simulated address cleared by value");
        Ok(())
    }

    async fn adapter_health(&self, bindings: &[AdapterBinding]) -> Result<AdapterSnapshot> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(NetworkCall::Health);

        if inner.health_error {
            return Err(Error::other("simulated adapter enumeration failure"));
        }

        let mut snapshot = AdapterSnapshot::default();
        for (position, binding) in bindings.iter().enumerate() {
            if inner.adapter_mask & binding.adapter_mask != 0 {
                snapshot.mask |= binding.adapter_mask;
                snapshot.indices.push(Some(position as u32 + 1));
            } else {
                snapshot.indices.push(None);
            }
        }
        Ok(snapshot)
    }

    async fn probe_reachable(&self, ip: IpAddr, _timeout: Duration) -> bool {
        self.inner.lock().await.calls.push(NetworkCall::Probe(ip));
        self.segment.is_reachable(ip).await
    }

    async fn flush_neighbor_cache(&self) -> Result<()> {
        self.inner.lock().await.calls.push(NetworkCall::Flush);
        debug!(owner = %self.owner, "Simulated neighbor cache flush");
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
