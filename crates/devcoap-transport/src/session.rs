//! Session manager
//!
//! One session is opened per exchange and closed when the exchange ends.
//! The device's security mode picks the protocol, the default port and,
//! for PSK, the identity hint and key handed to the handshake.

use devcoap_core::{EndDeviceAddress, SecurityMode, CLIENT_IDENTITY_HINT, COAPS_PORT, COAP_PORT};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::channel::{DatagramChannel, UdpChannel};
use crate::engine::{Engine, EngineConfig};
use crate::error::{Result, TransportError};
use crate::resolve::resolve_address;

/// Session protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProtocol {
    Udp,
    Dtls,
}

impl fmt::Display for SessionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionProtocol::Udp => f.write_str("udp"),
            SessionProtocol::Dtls => f.write_str("dtls"),
        }
    }
}

/// How long a PSK handshake may take before the open fails
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Destination port for NoSec devices
    pub coap_port: u16,
    /// Destination port for PSK devices
    pub coaps_port: u16,
    /// Identity presented during the PSK handshake
    pub identity_hint: Vec<u8>,
    /// Upper bound on the DTLS handshake
    pub handshake_timeout: Duration,
    pub engine: EngineConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            coap_port: COAP_PORT,
            coaps_port: COAPS_PORT,
            identity_hint: CLIENT_IDENTITY_HINT.as_bytes().to_vec(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            engine: EngineConfig::default(),
        }
    }
}

/// Everything needed to open one session
#[derive(Clone)]
pub struct SessionParams {
    pub remote: SocketAddr,
    pub protocol: SessionProtocol,
    pub identity_hint: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
}

impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .field("key_len", &self.key.as_ref().map(|k| k.len()))
            .finish()
    }
}

/// Opens per-exchange sessions
#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Pick protocol, port and key material for `address`, resolving its host.
    pub async fn params_for(&self, address: &EndDeviceAddress) -> Result<SessionParams> {
        let (protocol, port) = match address.security_mode() {
            SecurityMode::None => (SessionProtocol::Udp, self.config.coap_port),
            SecurityMode::PreSharedKey => (SessionProtocol::Dtls, self.config.coaps_port),
            SecurityMode::Unknown => {
                return Err(TransportError::SessionCreation(
                    "unknown security mode".to_string(),
                ))
            }
        };

        let remote = resolve_address(address.host(), port).await?;

        let (identity_hint, key) = match protocol {
            SessionProtocol::Udp => (None, None),
            SessionProtocol::Dtls => {
                let key = address
                    .psk_key()
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| TransportError::PskInit("missing key".to_string()))?;
                (Some(self.config.identity_hint.clone()), Some(key.to_vec()))
            }
        };

        Ok(SessionParams {
            remote,
            protocol,
            identity_hint,
            key,
        })
    }

    /// Resolve and connect a session to `address`
    pub async fn open(&self, address: &EndDeviceAddress) -> Result<Session> {
        let params = self.params_for(address).await?;
        self.open_with(params).await
    }

    /// Connect a session with explicit parameters
    pub async fn open_with(&self, params: SessionParams) -> Result<Session> {
        debug!("opening {} session to {}", params.protocol, params.remote);
        let channel: Arc<dyn DatagramChannel> = match params.protocol {
            SessionProtocol::Udp => Arc::new(UdpChannel::connect(params.remote).await?),
            SessionProtocol::Dtls => connect_dtls(&params, self.config.handshake_timeout).await?,
        };
        info!("{} session open to {}", params.protocol, params.remote);
        Ok(Session {
            engine: Engine::new(channel, self.config.engine.clone()),
            protocol: params.protocol,
            closed: false,
        })
    }
}

#[cfg(feature = "dtls")]
async fn connect_dtls(
    params: &SessionParams,
    handshake_timeout: Duration,
) -> Result<Arc<dyn DatagramChannel>> {
    let key = params
        .key
        .as_deref()
        .ok_or_else(|| TransportError::PskInit("missing key".to_string()))?;
    let identity = params.identity_hint.as_deref().unwrap_or_default();
    let channel =
        crate::dtls::DtlsChannel::connect(params.remote, identity, key, handshake_timeout).await?;
    Ok(Arc::new(channel))
}

#[cfg(not(feature = "dtls"))]
async fn connect_dtls(
    params: &SessionParams,
    _handshake_timeout: Duration,
) -> Result<Arc<dyn DatagramChannel>> {
    error!("cannot open PSK session to {}", params.remote);
    Err(TransportError::SessionCreation(
        "dtls support not compiled in".to_string(),
    ))
}

/// One open session; close it when the exchange ends
pub struct Session {
    engine: Engine,
    protocol: SessionProtocol,
    closed: bool,
}

impl Session {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.protocol
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.engine.channel().peer_addr()
    }

    /// Release the session. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.engine.channel().close().await {
            error!("error closing session to {}: {}", self.peer_addr(), e);
        }
        debug!("session to {} closed", self.peer_addr());
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
