//! Failover data types: lifecycle states, adapter bindings, engine settings
//! and statistics.

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::warn;

/// Maximum number of adapter bindings (one membership bit each).
pub const MAX_ADAPTERS: usize = 8;

/// Bindings that are mandatory and reported through the legacy status fields.
pub const LEGACY_ADAPTERS: usize = 2;

/// Default evaluation interval of the decision engine.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Default startup/retry delay, also used as the resync interval after
/// adapters come back. Kept below [`DEFAULT_TICK`].
pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(500);

/// Default time without heartbeats before the peer is declared NoValid.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-address reachability probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Recommended ratio between remote timeout and tick interval.
pub const REMOTE_TIMEOUT_MARGIN: u32 = 3;

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// No usable physical adapters; virtual addresses must not be held
    #[default]
    NoValid,
    /// Claiming ownership of the virtual addresses
    Activating,
    /// Owns the virtual addresses
    Active,
    /// Healthy, not owning the virtual addresses
    NoActive,
}

impl NodeState {
    /// Whether the node counts as a live participant.
    pub fn is_valid(self) -> bool {
        self != NodeState::NoValid
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::NoValid => write!(f, "NO_VALID"),
            NodeState::Activating => write!(f, "ACTIVATING"),
            NodeState::Active => write!(f, "ACTIVE"),
            NodeState::NoActive => write!(f, "NO_ACTIVE"),
        }
    }
}

/// Association between a physical adapter, its membership bit and the
/// virtual address it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterBinding {
    /// Address of the physical adapter
    pub adapter_ip: IpAddr,

    /// Single-bit membership mask (bit i = adapter i)
    pub adapter_mask: u8,

    /// Floating address carried by this adapter
    pub virtual_ip: IpAddr,

    /// Prefix length of the floating address
    pub prefix_len: u8,
}

impl AdapterBinding {
    /// Create a binding for adapter position `position`.
    pub fn new(position: usize, adapter_ip: IpAddr, virtual_ip: IpAddr, prefix_len: u8) -> Self {
        Self {
            adapter_ip,
            adapter_mask: 1u8 << (position % MAX_ADAPTERS),
            virtual_ip,
            prefix_len,
        }
    }

    /// Virtual address in `ip/prefix` notation.
    pub fn virtual_cidr(&self) -> String {
        format!("{}/{}", self.virtual_ip, self.prefix_len)
    }
}

/// Engine configuration, immutable for the life of one engine instance
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Node identity
    pub node_id: String,

    /// Local bind address on the private link
    pub local_addr: SocketAddr,

    /// Peer address on the private link
    pub peer_addr: SocketAddr,

    /// Adapter bindings; index 0 and 1 are required
    pub bindings: Vec<AdapterBinding>,

    /// Decision engine interval
    pub tick: Duration,

    /// Startup/retry delay
    pub start_delay: Duration,

    /// Remote liveness timeout
    pub remote_timeout: Duration,

    /// Per-address reachability probe timeout
    pub probe_timeout: Duration,
}

impl EngineSettings {
    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::config("node id is required"));
        }

        if self.bindings.len() < LEGACY_ADAPTERS {
            return Err(Error::config(format!(
                "at least {} adapter bindings are required",
                LEGACY_ADAPTERS
            )));
        }

        if self.bindings.len() > MAX_ADAPTERS {
            return Err(Error::config(format!(
                "at most {} adapter bindings are supported",
                MAX_ADAPTERS
            )));
        }

        let mut seen = 0u8;
        for binding in &self.bindings {
            if binding.adapter_mask.count_ones() != 1 {
                return Err(Error::config(format!(
                    "adapter {} must have exactly one membership bit",
                    binding.adapter_ip
                )));
            }
            if seen & binding.adapter_mask != 0 {
                return Err(Error::config(format!(
                    "adapter {} reuses membership bit {:#04x}",
                    binding.adapter_ip, binding.adapter_mask
                )));
            }
            seen |= binding.adapter_mask;
        }

        if self.tick.is_zero() {
            return Err(Error::config("tick interval must be greater than zero"));
        }

        if self.remote_timeout.is_zero() {
            return Err(Error::config("remote timeout must be greater than zero"));
        }

        if self.remote_timeout < self.tick * REMOTE_TIMEOUT_MARGIN {
            warn!(
                tick_ms = self.tick.as_millis() as u64,
                remote_timeout_ms = self.remote_timeout.as_millis() as u64,
                "Remote timeout is below {}x tick interval; peer loss may be reported spuriously",
                REMOTE_TIMEOUT_MARGIN
            );
        }

        Ok(())
    }

    /// Delay of the tick that follows leaving NoValid; never longer than
    /// the regular tick.
    pub fn resync_interval(&self) -> Duration {
        self.start_delay.min(self.tick)
    }

    /// Time a claim may stay in Activating before it is abandoned.
    pub fn activating_timeout(&self) -> Duration {
        self.remote_timeout * 2
    }
}

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Local state transitions
    pub transitions: u64,

    /// Heartbeats sent to the peer
    pub heartbeats_sent: u64,

    /// Heartbeats received from the peer
    pub heartbeats_received: u64,

    /// Datagrams that failed to decode
    pub invalid_datagrams: u64,

    /// Address takeovers that failed
    pub failed_claims: u64,

    /// Times the peer was declared NoValid for silence
    pub liveness_losses: u64,

    /// Times both nodes were seen Active
    pub split_brains: u64,

    /// Times the private link socket was dropped and rebound
    pub link_resets: u64,
}

/// Number of operational adapters in a mask.
pub fn adapter_count(mask: u8) -> u32 {
    mask.count_ones()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn settings() -> EngineSettings {
        EngineSettings {
            node_id: "node-a".to_string(),
            local_addr: "127.0.0.1:0".parse().unwrap(),
            peer_addr: "127.0.0.1:9".parse().unwrap(),
            bindings: vec![
                AdapterBinding::new(0, "10.12.90.1".parse().unwrap(), "10.12.90.88".parse().unwrap(), 24),
                AdapterBinding::new(1, "10.20.90.1".parse().unwrap(), "10.20.90.88".parse().unwrap(), 24),
            ],
            tick: Duration::from_millis(100),
            start_delay: Duration::from_millis(50),
            remote_timeout: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(50),
        }
    }
}
