//! Server error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("cannot initialize listen endpoint: {0}")]
    Bind(String),

    #[error("transport error: {0}")]
    Transport(#[from] devcoap_transport::TransportError),

    #[error("configuration error: {0}")]
    Configuration(String),
}
