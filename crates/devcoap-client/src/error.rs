//! Client error types

use devcoap_core::CodecError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Configuration(#[from] devcoap_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] devcoap_transport::TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("exchange aborted")]
    Aborted,

    #[error("read failed for {failed:?}")]
    ReadFailed { failed: Vec<String> },

    #[error("write failed for {failed:?}")]
    WriteFailed { failed: Vec<String> },

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("resource not found: {device}/{resource}")]
    ResourceNotFound { device: String, resource: String },
}
