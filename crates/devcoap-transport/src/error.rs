//! Transport error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to resolve address {0}")]
    AddressResolution(String),

    #[error("failed to create context: {0}")]
    ContextCreation(String),

    #[error("failed to create session: {0}")]
    SessionCreation(String),

    #[error("failed to initialize PSK: {0}")]
    PskInit(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("dtls error: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<devcoap_core::Error> for TransportError {
    fn from(e: devcoap_core::Error) -> Self {
        TransportError::Protocol(e.to_string())
    }
}
