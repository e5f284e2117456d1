//! Host network collaborator.
//!
//! The engine never touches the host network stack directly; everything goes
//! through a [`NetworkProvider`].

use crate::types::AdapterBinding;
use async_trait::async_trait;
use common::Result;
use std::net::IpAddr;
use std::time::Duration;

/// Opaque token identifying one address assignment
pub type AssignmentHandle = u64;

/// Adapter health as seen by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterSnapshot {
    /// Operational adapters, keyed to the binding membership bits
    pub mask: u8,

    /// Resolved adapter index per binding, `None` when not found
    pub indices: Vec<Option<u32>>,
}

/// Address assignment, adapter health and reachability capability
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Bind `ip/prefix_len` to the adapter with index `adapter_index`
    async fn assign(&self, ip: IpAddr, prefix_len: u8, adapter_index: u32)
        -> Result<AssignmentHandle>;

    /// Remove an assignment by the handle returned from [`assign`](Self::assign)
    async fn clear_handle(&self, handle: AssignmentHandle) -> Result<()>;

    /// Remove an address without a handle
    async fn clear_address(&self, ip: IpAddr) -> Result<()>;

    /// Snapshot the operational status of the configured adapters
    async fn adapter_health(&self, bindings: &[AdapterBinding]) -> Result<AdapterSnapshot>;

    /// Whether `ip` answers on the network within `timeout`
    async fn probe_reachable(&self, ip: IpAddr, timeout: Duration) -> bool;

    /// Flush the neighbor (ARP) cache after a takeover
    async fn flush_neighbor_cache(&self) -> Result<()>;

    /// Get the name of this provider
    fn name(&self) -> &str;
}
