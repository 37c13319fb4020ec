//! Error types for persistence operations.

use std::io;
use thiserror::Error;

/// Result type for persistence operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while loading or saving blobs.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The key cannot be mapped onto the backend.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The backend refuses writes (for example after a simulated failure).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
