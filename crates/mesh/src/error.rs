//! Error types for mesh routing operations

use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur in the mesh routing core
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    #[error("router has no outbound handle yet")]
    NotWired,
}
