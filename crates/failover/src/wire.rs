//! Datagram format exchanged on the private link.
//!
//! Every datagram starts with a fixed header whose kind byte selects the
//! payload shape:
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     'F'       |     'O'       |    Version    |     Kind      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Payload (per kind) ...                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! - Kind 1 (control): a single opcode byte.
//! - Kind 2 (heartbeat): JSON [`Heartbeat`].
//! - Kind 3 (state reply): JSON [`ClusterState`].

use crate::node::{ClusterState, NodeRecord};
use crate::types::NodeState;
use bytes::{BufMut, Bytes, BytesMut};
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Leading magic bytes
pub const WIRE_MAGIC: [u8; 2] = *b"FO";

/// Wire format version
pub const WIRE_VERSION: u8 = 1;

/// Fixed header length
pub const HEADER_LEN: usize = 4;

/// Largest datagram accepted or produced
pub const MAX_DATAGRAM: usize = 65_507;

/// Payload discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Control = 1,
    Heartbeat = 2,
    StateReply = 3,
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageKind::Control),
            2 => Ok(MessageKind::Heartbeat),
            3 => Ok(MessageKind::StateReply),
            other => Err(Error::protocol(format!("unknown message kind {}", other))),
        }
    }
}

/// Control opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Ask the receiver to attempt activation
    Activate = 1,
    /// Ask the receiver to release the virtual addresses
    Deactivate = 2,
    /// Ask the receiver for its full cluster state
    GetState = 3,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Activate),
            2 => Ok(Opcode::Deactivate),
            3 => Ok(Opcode::GetState),
            other => Err(Error::protocol(format!("unknown opcode {}", other))),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Activate => write!(f, "ACTIVATE"),
            Opcode::Deactivate => write!(f, "DEACTIVATE"),
            Opcode::GetState => write!(f, "GET_STATE"),
        }
    }
}

/// State snapshot broadcast by each node every tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub name: String,
    pub adapter_ip1: String,
    pub adapter_ip2: String,
    pub adapter1_up: bool,
    pub adapter2_up: bool,
    pub adapters_mask: u8,
    pub virtual_ip1: String,
    pub virtual_ip2: String,
    pub state: NodeState,
    pub state_begin: SystemTime,
    pub change_cause: String,
    pub replication_status: String,
}

impl From<&NodeRecord> for Heartbeat {
    fn from(record: &NodeRecord) -> Self {
        Self {
            name: record.name.clone(),
            adapter_ip1: record.adapter_ip1.clone(),
            adapter_ip2: record.adapter_ip2.clone(),
            adapter1_up: record.adapter1_up(),
            adapter2_up: record.adapter2_up(),
            adapters_mask: record.valid_adapters_mask,
            virtual_ip1: record.virtual_ip1.clone(),
            virtual_ip2: record.virtual_ip2.clone(),
            state: record.state(),
            state_begin: record.state_begin(),
            change_cause: record.change_cause().to_string(),
            replication_status: record.replication_status.clone(),
        }
    }
}

impl Heartbeat {
    /// Convert into a remote node record.
    ///
    /// The combined mask is authoritative; a peer that only fills the two
    /// legacy flags still gets its adapters counted.
    pub fn into_record(self) -> NodeRecord {
        let legacy = u8::from(self.adapter1_up) | (u8::from(self.adapter2_up) << 1);
        let mask = if self.adapters_mask == 0 {
            legacy
        } else {
            self.adapters_mask
        };

        let mut base = NodeRecord::default();
        base.name = self.name;
        base.adapter_ip1 = self.adapter_ip1;
        base.adapter_ip2 = self.adapter_ip2;
        base.virtual_ip1 = self.virtual_ip1;
        base.virtual_ip2 = self.virtual_ip2;
        base.replication_status = self.replication_status;
        base.valid_adapters_mask = mask;
        NodeRecord::from_parts(base, self.state, self.state_begin, self.change_cause)
    }
}

/// One datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Control(Opcode),
    Heartbeat(Heartbeat),
    StateReply(ClusterState),
}

impl Message {
    /// Payload discriminator of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Control(_) => MessageKind::Control,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::StateReply(_) => MessageKind::StateReply,
        }
    }

    /// Heartbeat carrying the given record
    pub fn heartbeat(record: &NodeRecord) -> Self {
        Message::Heartbeat(Heartbeat::from(record))
    }

    /// Serialize to a datagram
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(&WIRE_MAGIC);
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.kind() as u8);

        match self {
            Message::Control(op) => buf.put_u8(*op as u8),
            Message::Heartbeat(hb) => serde_json::to_writer((&mut buf).writer(), hb)?,
            Message::StateReply(state) => serde_json::to_writer((&mut buf).writer(), state)?,
        }

        if buf.len() > MAX_DATAGRAM {
            return Err(Error::protocol(format!(
                "message of {} bytes exceeds datagram limit",
                buf.len()
            )));
        }

        Ok(buf.freeze())
    }

    /// Parse a datagram
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::protocol("datagram too short"));
        }

        if data.len() > MAX_DATAGRAM {
            return Err(Error::protocol("datagram too long"));
        }

        if data[..2] != WIRE_MAGIC {
            return Err(Error::protocol("bad magic"));
        }

        if data[2] != WIRE_VERSION {
            return Err(Error::protocol(format!("unsupported version {}", data[2])));
        }

        let payload = &data[HEADER_LEN..];
        match MessageKind::try_from(data[3])? {
            MessageKind::Control => match payload {
                [op] => Ok(Message::Control(Opcode::try_from(*op)?)),
                _ => Err(Error::protocol(format!(
                    "control payload must be 1 byte, got {}",
                    payload.len()
                ))),
            },
            MessageKind::Heartbeat => Ok(Message::Heartbeat(serde_json::from_slice(payload)?)),
            MessageKind::StateReply => Ok(Message::StateReply(serde_json::from_slice(payload)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures;

    #[test]
    fn test_control_frame_layout() {
        let bytes = Message::Control(Opcode::GetState).to_bytes().unwrap();
        assert_eq!(&bytes[..], &[b'F', b'O', WIRE_VERSION, 1, 3]);
        assert_eq!(
            Message::parse(&bytes).unwrap(),
            Message::Control(Opcode::GetState)
        );
    }

    #[test]
    fn test_heartbeat_preserves_record() {
        let mut record = NodeRecord::local(&fixtures::settings());
        record.valid_adapters_mask = 0b111;
        record.replication_status = "1".to_string();
        record.set_state(NodeState::Active, "virtual addresses assigned");

        let bytes = Message::heartbeat(&record).to_bytes().unwrap();
        let Message::Heartbeat(hb) = Message::parse(&bytes).unwrap() else {
            panic!("expected heartbeat");
        };
        assert!(hb.adapter1_up && hb.adapter2_up);
        assert_eq!(hb.adapters_mask, 0b111);
        assert_eq!(hb.into_record(), record);
    }

    #[test]
    fn test_legacy_flags_fill_empty_mask() {
        let mut hb = Heartbeat::from(&NodeRecord::default());
        hb.adapter2_up = true;
        assert_eq!(hb.into_record().valid_adapters_mask, 0b10);
    }

    #[test]
    fn test_state_reply_carries_both_records() {
        let mut state = ClusterState::new(&fixtures::settings());
        state.remote.name = "node-b".to_string();
        let bytes = Message::StateReply(state.clone()).to_bytes().unwrap();
        assert_eq!(Message::parse(&bytes).unwrap(), Message::StateReply(state));
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(Message::parse(b"FO").is_err());
        assert!(Message::parse(b"XX\x01\x01\x01").is_err());
        assert!(Message::parse(b"FO\x09\x01\x01").is_err());
        assert!(Message::parse(b"FO\x01\x07\x01").is_err());
        assert!(Message::parse(b"FO\x01\x01\x09").is_err());
        assert!(Message::parse(b"FO\x01\x01\x01\x01").is_err());
        assert!(Message::parse(b"FO\x01\x02{not json").is_err());
    }
}
