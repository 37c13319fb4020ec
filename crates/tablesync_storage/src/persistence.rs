//! Persistence trait definition.

use crate::error::{StorageError, StorageResult};

/// A local key-value persistence backend.
///
/// The engine stores whole blobs under a handful of well-known keys and
/// always rewrites a blob in full. Backends therefore only need `load` and
/// `save`.
///
/// # Invariants
///
/// - `load` returns exactly the bytes of the last successful `save` for a key
/// - `load` of a never-saved key returns `Ok(None)`
/// - A failed `save` leaves the previously saved bytes readable
/// - Backends must be `Send + Sync`; the engine calls them from several tasks
///
/// # Implementors
///
/// - [`super::InMemoryPersistence`] - For testing
/// - [`super::DirPersistence`] - For persistent storage
pub trait Persistence: Send + Sync {
    /// Loads the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replaces the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the write fails.
    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;
}

/// Checks that a key is usable by every backend.
///
/// Keys are restricted to ASCII alphanumerics, `-`, `_` and `.` so that
/// [`super::DirPersistence`] can use them as file names verbatim.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] describing the first violation.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = |reason| {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };

    if key.is_empty() {
        return invalid("key is empty");
    }
    if key.len() > 128 {
        return invalid("key is longer than 128 bytes");
    }
    if key.starts_with('.') {
        return invalid("key starts with a dot");
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return invalid("key contains characters outside [A-Za-z0-9._-]");
    }
    Ok(())
}
