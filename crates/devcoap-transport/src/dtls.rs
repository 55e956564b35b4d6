//! DTLS-PSK channels
//!
//! Sessions are secured with `TLS_PSK_WITH_AES_128_CCM_8`. The client side
//! presents an identity and the shared key; the listener side offers its own
//! identity hint and answers every client identity with the same key.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};
use webrtc_dtls::cipher_suite::CipherSuiteId;
use webrtc_dtls::config::{Config, ExtendedMasterSecretType};
use webrtc_dtls::conn::DTLSConn;
use webrtc_util::conn::{Conn, Listener};

use crate::channel::DatagramChannel;
use crate::error::{Result, TransportError};

fn psk_config(identity_hint: &[u8], key: &[u8]) -> Result<Config> {
    if key.is_empty() {
        return Err(TransportError::PskInit("empty key".to_string()));
    }
    let key = key.to_vec();
    Ok(Config {
        psk: Some(Arc::new(
            move |hint: &[u8]| -> std::result::Result<Vec<u8>, webrtc_dtls::Error> {
                debug!("DTLS peer identity of len {}", hint.len());
                Ok(key.clone())
            },
        )),
        psk_identity_hint: Some(identity_hint.to_vec()),
        cipher_suites: vec![CipherSuiteId::Tls_Psk_With_Aes_128_Ccm_8],
        extended_master_secret: ExtendedMasterSecretType::Require,
        ..Default::default()
    })
}

/// A DTLS-secured channel to one peer
pub struct DtlsChannel {
    conn: Arc<dyn Conn + Send + Sync>,
    peer: SocketAddr,
}

impl DtlsChannel {
    /// Connect to `peer` and run the PSK handshake.
    ///
    /// A peer that never completes the handshake fails the connect with
    /// `SessionCreation` once `handshake_timeout` elapses.
    pub async fn connect(
        peer: SocketAddr,
        identity: &[u8],
        key: &[u8],
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let config = psk_config(identity, key)?;

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

        let handshake = DTLSConn::new(Arc::new(socket), config, true, None);
        let conn = match tokio::time::timeout(handshake_timeout, handshake).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                error!("DTLS handshake with {} failed: {}", peer, e);
                return Err(TransportError::SessionCreation(e.to_string()));
            }
            Err(_) => {
                error!("DTLS handshake with {} timed out", peer);
                return Err(TransportError::SessionCreation(format!(
                    "handshake timed out after {:?}",
                    handshake_timeout
                )));
            }
        };
        debug!("DTLS session established with {}", peer);

        Ok(Self {
            conn: Arc::new(conn),
            peer,
        })
    }
}

#[async_trait]
impl DatagramChannel for DtlsChannel {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.conn
            .send(data)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.conn
            .recv(buf)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn is_secure(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))
    }
}

/// DTLS-PSK listener accepting one channel per client
pub struct DtlsListener {
    listener: Box<dyn Listener + Send + Sync>,
    local_addr: SocketAddr,
}

impl DtlsListener {
    /// Bind `addr` with the listener's identity hint and shared key.
    pub async fn bind(addr: SocketAddr, identity_hint: &[u8], key: &[u8]) -> Result<Self> {
        let config = psk_config(identity_hint, key)?;
        let listener = webrtc_dtls::listener::listen(addr, config)
            .await
            .map_err(|e| TransportError::ContextCreation(e.to_string()))?;
        let local_addr = listener
            .addr()
            .await
            .map_err(|e| TransportError::ContextCreation(e.to_string()))?;
        info!("DTLS listener bound to {}", local_addr);
        Ok(Self {
            listener: Box::new(listener),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next client to finish its handshake
    pub async fn accept(&self) -> Result<DtlsChannel> {
        let (conn, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        debug!("DTLS client connected from {}", peer);
        Ok(DtlsChannel { conn, peer })
    }

    pub async fn close(&self) -> Result<()> {
        self.listener
            .close()
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))
    }
}
