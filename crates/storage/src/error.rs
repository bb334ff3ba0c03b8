//! Error types for persistence operations

use thiserror::Error;

/// Result type for persistence operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by a persistence backend
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}
