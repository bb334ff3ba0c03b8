//! Error types for packet encoding

use thiserror::Error;

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding a packet.
///
/// Decoding never errors: malformed input yields `None` and is dropped by
/// the caller.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encoded packet is {size} bytes, limit is {limit}")]
    Oversize { size: usize, limit: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
