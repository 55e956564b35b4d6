//! Datagram channels
//!
//! A channel carries whole CoAP datagrams between this endpoint and one peer.
//! Plain UDP and DTLS share the same surface so the message layer and the
//! listener do not care which one they are driving.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Result, TransportError};

/// A connected datagram channel to a single peer
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// Send one datagram
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Receive one datagram into `buf`, returning its length
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// The peer this channel talks to
    fn peer_addr(&self) -> SocketAddr;

    /// Whether the channel is DTLS-secured
    fn is_secure(&self) -> bool;

    /// Release the channel
    async fn close(&self) -> Result<()>;
}

/// Plain UDP channel on a connected socket
pub struct UdpChannel {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpChannel {
    /// Bind an ephemeral local port of the peer's family and connect it.
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| TransportError::ContextCreation(e.to_string()))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| TransportError::SessionCreation(e.to_string()))?;
        debug!("UDP channel {} -> {}", socket.local_addr()?, peer);
        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.socket
            .send(data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.socket
            .recv(buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn is_secure(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_channel_exchange() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let channel = UdpChannel::connect(peer.local_addr().unwrap()).await.unwrap();

        channel.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");

        peer.send_to(b"pong", from).await.unwrap();
        let len = channel.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert!(!channel.is_secure());
    }
}
