//! In-memory persistence backend for testing.

use crate::error::{StorageError, StorageResult};
use crate::persistence::{validate_key, Persistence};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An in-memory persistence backend.
///
/// This backend keeps every blob in a map and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Engines that don't need to survive a restart
///
/// Sharing one instance (behind an `Arc`) between two engines simulates a
/// process restart over the same storage.
///
/// # Example
///
/// ```rust
/// use tablesync_storage::{InMemoryPersistence, Persistence};
///
/// let store = InMemoryPersistence::new();
/// assert_eq!(store.load("cache").unwrap(), None);
/// store.save("cache", &[1, 2, 3]).unwrap();
/// assert_eq!(store.save_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    saves: AtomicU64,
}

impl InMemoryPersistence {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `save` fail until reset.
    ///
    /// Useful for exercising the engine's degraded, memory-only mode.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `load` fail until reset.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Returns the keys currently stored.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.blobs.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Persistence for InMemoryPersistence {
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!(
                "load of {key:?} rejected"
            )));
        }
        Ok(self.blobs.read().get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!(
                "save of {key:?} rejected"
            )));
        }
        self.blobs.write().insert(key.to_string(), bytes.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
