//! Virtual address lifecycle: conflict probing, claim and release.

use crate::network::{AssignmentHandle, NetworkProvider};
use crate::types::AdapterBinding;
use common::{Error, Result};
use futures::future::join_all;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Runtime view of one binding
#[derive(Debug, Clone)]
struct BindingSlot {
    binding: AdapterBinding,
    adapter_index: Option<u32>,
    handle: Option<AssignmentHandle>,
}

/// Orchestrates the collaborator calls that add and remove virtual addresses
pub struct AddressController {
    slots: Vec<BindingSlot>,
    provider: Arc<dyn NetworkProvider>,
    probe_timeout: Duration,
}

impl AddressController {
    /// Create a controller over `bindings`
    pub fn new(
        bindings: &[AdapterBinding],
        provider: Arc<dyn NetworkProvider>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            slots: bindings
                .iter()
                .map(|binding| BindingSlot {
                    binding: binding.clone(),
                    adapter_index: None,
                    handle: None,
                })
                .collect(),
            provider,
            probe_timeout,
        }
    }

    /// Record adapter indices resolved by the latest health snapshot.
    ///
    /// Unresolved entries keep the previously known index.
    pub fn update_indices(&mut self, indices: &[Option<u32>]) {
        for (slot, index) in self.slots.iter_mut().zip(indices) {
            if index.is_some() {
                slot.adapter_index = *index;
            }
        }
    }

    /// Number of addresses currently assigned by this controller
    pub fn held(&self) -> usize {
        self.slots.iter().filter(|s| s.handle.is_some()).count()
    }

    /// Virtual addresses managed by this controller
    pub fn virtual_ips(&self) -> Vec<IpAddr> {
        self.slots.iter().map(|s| s.binding.virtual_ip).collect()
    }

    /// Whether any virtual address already answers on the network.
    ///
    /// Probes run concurrently, each bounded by the probe timeout.
    pub async fn any_reachable(&self) -> bool {
        let probes = self.slots.iter().map(|slot| {
            let ip = slot.binding.virtual_ip;
            let provider = self.provider.clone();
            let limit = self.probe_timeout;
            async move {
                match timeout(limit, provider.probe_reachable(ip, limit)).await {
                    Ok(reachable) => {
                        debug!(ip = %ip, reachable, "Virtual address probed");
                        reachable
                    }
                    Err(_) => {
                        debug!(ip = %ip, "Virtual address probe timed out");
                        false
                    }
                }
            }
        });

        join_all(probes).await.into_iter().any(|reachable| reachable)
    }

    /// Assign every virtual address.
    ///
    /// Fails with a conflict when any address already answers. Otherwise
    /// every binding is attempted even after a failure; on error the caller
    /// must [`release`](Self::release) to undo the partial assignment.
    pub async fn claim(&mut self) -> Result<()> {
        if self.any_reachable().await {
            return Err(Error::conflict(
                "virtual addresses already reachable on the network",
            ));
        }

        let provider = &self.provider;
        let attempts = self.slots.iter().map(|slot| {
            let binding = slot.binding.clone();
            let adapter_index = slot.adapter_index;
            let provider = provider.clone();
            async move {
                let index = adapter_index.ok_or_else(|| {
                    Error::address(format!(
                        "adapter {} has no resolved index",
                        binding.adapter_ip
                    ))
                })?;
                provider
                    .assign(binding.virtual_ip, binding.prefix_len, index)
                    .await
            }
        });
        let results = join_all(attempts).await;

        let mut failures = 0usize;
        for (slot, result) in self.slots.iter_mut().zip(results) {
            match result {
                Ok(handle) => {
                    info!(ip = %slot.binding.virtual_ip, handle, "Virtual address assigned");
                    slot.handle = Some(handle);
                }
                Err(e) => {
                    warn!(ip = %slot.binding.virtual_ip, error = %e, "Virtual address assignment failed");
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            return Err(Error::address(format!(
                "{} of {} virtual addresses could not be assigned",
                failures,
                self.slots.len()
            )));
        }

        Ok(())
    }

    /// Remove every virtual address, best effort.
    ///
    /// Bindings with a handle are cleared by handle, the rest by address.
    /// Failures are logged per binding and never returned.
    pub async fn release(&mut self) {
        let provider = &self.provider;
        let clears = self.slots.iter().map(|slot| {
            let ip = slot.binding.virtual_ip;
            let handle = slot.handle;
            let provider = provider.clone();
            async move {
                match handle {
                    Some(handle) => provider.clear_handle(handle).await,
                    None => provider.clear_address(ip).await,
                }
            }
        });
        let results = join_all(clears).await;

        for (slot, result) in self.slots.iter_mut().zip(results) {
            match result {
                Ok(()) => {
                    if slot.handle.take().is_some() {
                        info!(ip = %slot.binding.virtual_ip, "Virtual address released");
                    }
                }
                Err(e) => {
                    warn!(ip = %slot.binding.virtual_ip, error = %e, "Virtual address release failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{NetworkCall, SimulatedNetwork};
    use crate::types::fixtures;

    fn controller(net: Arc<SimulatedNetwork>) -> AddressController {
        let settings = fixtures::settings();
        let mut ctl = AddressController::new(&settings.bindings, net, settings.probe_timeout);
        ctl.update_indices(&[Some(1), Some(2)]);
        ctl
    }

    #[tokio::test]
    async fn test_claim_assigns_every_binding() {
        let net = Arc::new(SimulatedNetwork::new("a", 0b11));
        let mut ctl = controller(net.clone());

        ctl.claim().await.unwrap();
        assert_eq!(ctl.held(), 2);
        assert_eq!(net.held_addresses().await.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_conflict_assigns_nothing() {
        let net = Arc::new(SimulatedNetwork::new("a", 0b11));
        let ip = fixtures::settings().bindings[1].virtual_ip;
        net.segment().occupy(ip, "someone-else").await;
        let mut ctl = controller(net.clone());

        let err = ctl.claim().await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(ctl.held(), 0);
        assert!(
            !net.calls()
                .await
                .iter()
                .any(|c| matches!(c, NetworkCall::Assign { .. }))
        );
    }

    #[tokio::test]
    async fn test_partial_failure_then_release_leaves_nothing() {
        let net = Arc::new(SimulatedNetwork::new("a", 0b11));
        let failing = fixtures::settings().bindings[0].virtual_ip;
        net.fail_assign(failing, true).await;
        let mut ctl = controller(net.clone());

        assert!(ctl.claim().await.is_err());
        // the other binding was still attempted
        assert_eq!(ctl.held(), 1);

        ctl.release().await;
        assert_eq!(ctl.held(), 0);
        assert!(net.held_addresses().await.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_index_fails_that_binding() {
        let settings = fixtures::settings();
        let net = Arc::new(SimulatedNetwork::new("a", 0b11));
        let mut ctl = AddressController::new(&settings.bindings, net.clone(), settings.probe_timeout);
        ctl.update_indices(&[Some(1), None]);

        assert!(ctl.claim().await.is_err());
        assert_eq!(ctl.held(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let net = Arc::new(SimulatedNetwork::new("a", 0b11));
        let mut ctl = controller(net.clone());
        ctl.claim().await.unwrap();

        ctl.release().await;
        ctl.release().await;
        assert_eq!(ctl.held(), 0);
        assert!(net.held_addresses().await.is_empty());

        // second pass falls back to clearing by address
        let calls = net.calls().await;
        let by_address = calls
            .iter()
            .filter(|c| matches!(c, NetworkCall::ClearAddress(_)))
            .count();
        assert_eq!(by_address, 2);
    }
}
