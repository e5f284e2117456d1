//! Heartbeat socket on the private link.
//!
//! One UDP socket per node, bound to the configured local address and used
//! both for heartbeats to the peer and for control/status traffic from
//! operators.

use crate::wire::{MAX_DATAGRAM, Message};
use common::Result;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Datagram socket for heartbeats and control messages
#[derive(Debug)]
pub struct HeartbeatSocket {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl HeartbeatSocket {
    /// Bind `local` and target heartbeats at `peer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;

        // Allow a quick rebind after the link was reset
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        debug!(local = %socket.local_addr()?, peer = %peer, "Heartbeat socket bound");

        Ok(Self { socket, peer })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Configured peer address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send a message to the peer
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.send_to(msg, self.peer).await
    }

    /// Send a message to an arbitrary address
    pub async fn send_to(&self, msg: &Message, target: SocketAddr) -> Result<()> {
        let bytes = msg.to_bytes()?;
        let sent = self.socket.send_to(&bytes, target).await?;
        trace!(target = %target, kind = ?msg.kind(), bytes = sent, "Datagram sent");
        Ok(())
    }

    /// Receive one raw datagram.
    ///
    /// Decoding is left to the caller so malformed input can be counted.
    pub async fn recv(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, src) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Opcode;

    #[tokio::test]
    async fn test_send_and_receive_on_loopback() {
        let a = HeartbeatSocket::bind("127.0.0.1:0".parse().unwrap(), "127.0.0.1:9".parse().unwrap())
            .unwrap();
        let b_addr = {
            let b = HeartbeatSocket::bind("127.0.0.1:0".parse().unwrap(), a.local_addr().unwrap())
                .unwrap();
            let addr = b.local_addr().unwrap();
            b.send(&Message::Control(Opcode::Activate)).await.unwrap();
            addr
        };

        let (data, src) = a.recv().await.unwrap();
        assert_eq!(src, b_addr);
        assert_eq!(Message::parse(&data).unwrap(), Message::Control(Opcode::Activate));
    }
}
