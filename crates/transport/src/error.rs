//! Error types for transport operations

use thiserror::Error;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur at the transport layer
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport start failed: {0}")]
    StartFailed(String),

    #[error("transport send failed: {0}")]
    SendFailed(String),

    #[error("transport is not active")]
    NotActive,

    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
