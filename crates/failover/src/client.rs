//! Control client for a running node.

use crate::node::ClusterState;
use crate::wire::{MAX_DATAGRAM, Message, Opcode};
use common::{Error, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

/// Default wait for a status reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends control opcodes to a node's private link address
pub struct ControlClient {
    socket: UdpSocket,
    node: SocketAddr,
    reply_timeout: Duration,
}

impl ControlClient {
    /// Bind an ephemeral socket for talking to `node`
    pub async fn connect(node: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if node.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;

        Ok(Self {
            socket,
            node,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    /// Change the status reply timeout
    pub fn with_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    async fn send(&self, op: Opcode) -> Result<()> {
        let bytes = Message::Control(op).to_bytes()?;
        self.socket.send_to(&bytes, self.node).await?;
        debug!(node = %self.node, op = %op, "Control request sent");
        Ok(())
    }

    /// Ask the node to activate.
    ///
    /// The request is not acknowledged; check the outcome with
    /// [`status`](Self::status).
    pub async fn activate(&self) -> Result<()> {
        self.send(Opcode::Activate).await
    }

    /// Ask the node to deactivate.
    ///
    /// The request is not acknowledged; check the outcome with
    /// [`status`](Self::status).
    pub async fn deactivate(&self) -> Result<()> {
        self.send(Opcode::Deactivate).await
    }

    /// Fetch the node's full cluster state
    pub async fn status(&self) -> Result<ClusterState> {
        self.send(Opcode::GetState).await?;

        timeout(self.reply_timeout, self.await_reply())
            .await
            .map_err(|_| {
                Error::other(format!(
                    "no state reply from {} within {:?}",
                    self.node, self.reply_timeout
                ))
            })?
    }

    async fn await_reply(&self) -> Result<ClusterState> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            match Message::parse(&buf[..len]) {
                Ok(Message::StateReply(state)) => return Ok(state),
                Ok(other) => debug!(from = %src, kind = ?other.kind(), "Ignoring datagram"),
                Err(e) => debug!(from = %src, error = %e, "Ignoring malformed datagram"),
            }
        }
    }
}
