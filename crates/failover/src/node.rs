//! Node and cluster records.
//!
//! A [`NodeRecord`] describes one side of the pair: identity, adapter health,
//! lifecycle state and when/why it was entered. [`ClusterState`] holds the
//! local and remote records and is the unit returned to status queries.

use crate::types::{EngineSettings, NodeState, adapter_count};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::info;

/// Replication status reported before any monitor has run.
pub const UNKNOWN_REPLICATION_STATUS: &str = "0";

/// One side of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node identity
    pub name: String,

    /// First physical adapter address
    pub adapter_ip1: String,

    /// Second physical adapter address
    pub adapter_ip2: String,

    /// First virtual address in `ip/prefix` notation
    pub virtual_ip1: String,

    /// Second virtual address in `ip/prefix` notation
    pub virtual_ip2: String,

    /// Opaque replication status, informational only
    pub replication_status: String,

    /// Operational adapters (bit set = adapter up)
    pub valid_adapters_mask: u8,

    state: NodeState,
    state_begin: SystemTime,
    change_cause: String,
}

impl Default for NodeRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            adapter_ip1: String::new(),
            adapter_ip2: String::new(),
            virtual_ip1: String::new(),
            virtual_ip2: String::new(),
            replication_status: UNKNOWN_REPLICATION_STATUS.to_string(),
            valid_adapters_mask: 0,
            state: NodeState::NoValid,
            state_begin: SystemTime::UNIX_EPOCH,
            change_cause: String::new(),
        }
    }
}

impl NodeRecord {
    /// Build the local record from engine settings.
    ///
    /// Only the first two bindings are reflected in the named fields; any
    /// further binding contributes to the adapter mask only.
    pub fn local(settings: &EngineSettings) -> Self {
        let first = settings.bindings.first();
        let second = settings.bindings.get(1);

        Self {
            name: settings.node_id.clone(),
            adapter_ip1: first.map(|b| b.adapter_ip.to_string()).unwrap_or_default(),
            adapter_ip2: second.map(|b| b.adapter_ip.to_string()).unwrap_or_default(),
            virtual_ip1: first.map(|b| b.virtual_cidr()).unwrap_or_default(),
            virtual_ip2: second.map(|b| b.virtual_cidr()).unwrap_or_default(),
            state_begin: SystemTime::now(),
            ..Self::default()
        }
    }

    /// Rebuild a record from fields received on the wire.
    pub(crate) fn from_parts(
        mut base: NodeRecord,
        state: NodeState,
        state_begin: SystemTime,
        change_cause: String,
    ) -> Self {
        base.state = state;
        base.state_begin = state_begin;
        base.change_cause = change_cause;
        base
    }

    /// Current lifecycle state
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// When the current state was entered
    pub fn state_begin(&self) -> SystemTime {
        self.state_begin
    }

    /// Why the current state was entered
    pub fn change_cause(&self) -> &str {
        &self.change_cause
    }

    /// Number of operational adapters
    pub fn valid_adapters(&self) -> u32 {
        adapter_count(self.valid_adapters_mask)
    }

    /// Legacy status flag for the first adapter
    pub fn adapter1_up(&self) -> bool {
        self.valid_adapters_mask & 0b01 != 0
    }

    /// Legacy status flag for the second adapter
    pub fn adapter2_up(&self) -> bool {
        self.valid_adapters_mask & 0b10 != 0
    }

    /// Transition to `state`.
    ///
    /// A transition to the current state is a no-op and keeps the existing
    /// timestamp. Otherwise the state, a strictly later timestamp and the
    /// cause are recorded together. Returns whether the state changed.
    pub fn set_state(&mut self, state: NodeState, cause: impl Into<String>) -> bool {
        if state == self.state {
            return false;
        }

        let cause = cause.into();
        info!(
            node = %self.name,
            from = %self.state,
            to = %state,
            cause = %cause,
            "Node state changed"
        );

        let now = SystemTime::now();
        self.state_begin = if now > self.state_begin {
            now
        } else {
            self.state_begin + Duration::from_micros(1)
        };
        self.state = state;
        self.change_cause = cause;
        true
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.state == NodeState::NoValid {
            return write!(f, "   Node not operational");
        }

        let adapter = |up: bool, ip: &str| {
            if up {
                ip.to_string()
            } else {
                "not operational".to_string()
            }
        };

        writeln!(f, "   {:<18}: {}", "Name", self.name)?;
        writeln!(f, "   {:<18}: {}", "State", self.state)?;
        writeln!(
            f,
            "   {:<18}: {}",
            "State Begin",
            humantime::format_rfc3339_seconds(self.state_begin)
        )?;
        writeln!(f, "   {:<18}: {}", "Change Cause", self.change_cause)?;
        writeln!(
            f,
            "   {:<18}: {}",
            "Adapter 1",
            adapter(self.adapter1_up(), &self.adapter_ip1)
        )?;
        writeln!(
            f,
            "   {:<18}: {}",
            "Adapter 2",
            adapter(self.adapter2_up(), &self.adapter_ip2)
        )?;
        writeln!(f, "   {:<18}: {}", "Virtual IP 1", self.virtual_ip1)?;
        writeln!(f, "   {:<18}: {}", "Virtual IP 2", self.virtual_ip2)?;
        write!(f, "   {:<18}: {}", "Replication", self.replication_status)
    }
}

/// An adapter whose health bit flipped between two snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterChange {
    /// Adapter position (membership bit index)
    pub position: usize,

    /// New health of the adapter
    pub up: bool,
}

/// Diff two adapter masks, lowest position first.
pub fn adapter_changes(old: u8, new: u8) -> impl Iterator<Item = AdapterChange> {
    let changed = old ^ new;
    (0..8usize)
        .filter(move |bit| changed & (1 << bit) != 0)
        .map(move |bit| AdapterChange {
            position: bit,
            up: new & (1 << bit) != 0,
        })
}

/// Local and remote records of one running engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// This node
    pub local: NodeRecord,

    /// The peer, as last reported by its heartbeats
    pub remote: NodeRecord,
}

impl ClusterState {
    /// Create the state for a new engine; the remote starts NoValid.
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            local: NodeRecord::local(settings),
            remote: NodeRecord::default(),
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Local node:")?;
        writeln!(f, "{}", self.local)?;
        writeln!(f, "Remote node:")?;
        write!(f, "{}", self.remote)
    }
}
