//! Loading of persisted engine state.

use std::path::{Path, PathBuf};
use tablesync_engine::{LocalCache, SyncConfig};
use tablesync_protocol::{decode_versioned, FailedAction, PendingLog, ProtocolError};
use tablesync_storage::{DirPersistence, Persistence, StorageError};
use thiserror::Error;
use tracing::debug;

/// Errors raised while reading a state directory.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The directory holds no state for the namespace.
    #[error("no state for namespace {namespace:?} found at {path:?}")]
    NotFound {
        /// State directory.
        path: PathBuf,
        /// Namespace looked up.
        namespace: String,
    },

    /// Reading a blob failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A blob could not be decoded.
    #[error("corrupt state: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Persisted state of one engine namespace.
#[derive(Debug)]
pub struct Snapshot {
    /// Pending actions.
    pub log: PendingLog,
    /// Cache snapshot.
    pub cache: LocalCache,
    /// Evicted actions.
    pub failed: Vec<FailedAction>,
}

impl Snapshot {
    /// Reads the state of `namespace` from a directory written by
    /// `DirPersistence`.
    pub fn load(path: &Path, namespace: &str) -> Result<Self, SnapshotError> {
        let not_found = || SnapshotError::NotFound {
            path: path.to_path_buf(),
            namespace: namespace.to_string(),
        };
        // Opening would create the directory.
        if !path.is_dir() {
            return Err(not_found());
        }

        let config = SyncConfig::new(namespace);
        let store = DirPersistence::open(path)?;

        let pending = store.load(&config.pending_key())?;
        let cache = store.load(&config.cache_key())?;
        let failed = store.load(&config.failed_key())?;
        if pending.is_none() && cache.is_none() && failed.is_none() {
            return Err(not_found());
        }
        debug!(
            namespace,
            pending = ?pending.as_ref().map(Vec::len),
            cache = ?cache.as_ref().map(Vec::len),
            failed = ?failed.as_ref().map(Vec::len),
            "loaded state blobs"
        );

        Ok(Self {
            log: pending
                .map(|bytes| PendingLog::decode(&bytes))
                .transpose()?
                .unwrap_or_default(),
            cache: cache
                .map(|bytes| LocalCache::decode(&bytes, None))
                .transpose()?
                .unwrap_or_default(),
            failed: failed
                .map(|bytes| decode_versioned(&bytes))
                .transpose()?
                .unwrap_or_default(),
        })
    }
}
