//! Shared engine state and its persistence.

use crate::cache::LocalCache;
use crate::clock::Clock;
use crate::config::SyncConfig;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tablesync_protocol::{
    decode_versioned, encode_versioned, FailedAction, PendingLog, ProtocolResult,
};
use tablesync_storage::Persistence;
use tracing::{debug, error, warn};

/// Statistics about sync operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Inbound change events applied.
    pub total_events: u64,
    /// Failed remote writes.
    pub total_errors: u64,
    /// Tables with an established subscription.
    pub watched_tables: BTreeSet<String>,
    /// Time of the last successful sync (ms).
    pub last_sync: Option<u64>,
    /// Actions acknowledged by the remote.
    pub actions_synced: u64,
    /// Actions evicted after exhausting their attempts.
    pub actions_failed: u64,
    /// Scheduler passes completed.
    pub passes_completed: u64,
    /// Cache entries evicted by the size policy.
    pub cache_evictions: u64,
    /// Subscription reconnect attempts.
    pub reconnect_attempts: u64,
}

/// Everything guarded by the engine's state lock.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) cache: LocalCache,
    pub(crate) log: PendingLog,
    pub(crate) failed: Vec<FailedAction>,
    pub(crate) stats: SyncStats,
    pub(crate) cache_dirty: bool,
}

impl SharedState {
    pub(crate) fn stats_snapshot(&self) -> SyncStats {
        let mut stats = self.stats.clone();
        stats.cache_evictions = self.cache.evicted();
        stats
    }
}

/// A persisted blob that could not be restored at open.
///
/// The engine starts that part of its state empty. The original bytes are
/// never overwritten: they are copied to `preserved_as` at open, or, when no copy could be made, the key is left untouched and
/// writes to it are skipped for the lifetime of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableState {
    /// Persistence key that failed to load or decode.
    pub key: String,
    /// Load or decode error.
    pub error: String,
    /// Key holding a copy of the original bytes, if one was made.
    pub preserved_as: Option<String>,
}

impl UnreadableState {
    /// Returns true if writes to the original key are suspended.
    pub fn is_sealed(&self) -> bool {
        self.preserved_as.is_none()
    }
}

/// Persistence keys and encoding of the durable parts of [`SharedState`].
#[derive(Debug)]
pub(crate) struct StateStore<P> {
    persistence: Arc<P>,
    pending_key: String,
    cache_key: String,
    failed_key: String,
    unreadable: Vec<UnreadableState>,
}

impl<P: Persistence> StateStore<P> {
    pub(crate) fn new(config: &SyncConfig, persistence: Arc<P>) -> Self {
        Self {
            persistence,
            pending_key: config.pending_key(),
            cache_key: config.cache_key(),
            failed_key: config.failed_key(),
            unreadable: Vec::new(),
        }
    }

    pub(crate) fn unreadable(&self) -> &[UnreadableState] {
        &self.unreadable
    }

    fn is_sealed(&self, key: &str) -> bool {
        self.unreadable
            .iter()
            .any(|u| u.key == key && u.is_sealed())
    }

    /// Loads and decodes one blob. Unreadable blobs are set aside.
    fn load_blob<T>(
        &mut self,
        key: &str,
        decode: impl FnOnce(&[u8]) -> ProtocolResult<T>,
    ) -> Option<T> {
        let bytes = match self.persistence.load(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                self.set_aside(key, None, e.to_string());
                return None;
            }
        };
        match decode(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                self.set_aside(key, Some(&bytes), e.to_string());
                None
            }
        }
    }

    fn set_aside(&mut self, key: &str, bytes: Option<&[u8]>, error: String) {
        let copy_key = format!("{key}.unreadable");
        // An existing copy from an earlier run is never replaced.
        let preserved_as = bytes.and_then(|bytes| match self.persistence.load(&copy_key) {
            Ok(None) => self.save_bytes(&copy_key, bytes).then_some(copy_key),
            _ => None,
        });

        match &preserved_as {
            Some(copy) => {
                error!(key, copy = %copy, error = %error, "unreadable state copied aside, starting empty")
            }
            None => {
                error!(key, error = %error, "unreadable state left in place, writes to it are suspended")
            }
        }
        self.unreadable.push(UnreadableState {
            key: key.to_string(),
            error,
            preserved_as,
        });
    }

    fn save_bytes(&self, key: &str, bytes: &[u8]) -> bool {
        if self.is_sealed(key) {
            debug!(key, "skipping write to sealed key");
            return false;
        }
        match self.persistence.save(key, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "failed to persist state, continuing in memory");
                false
            }
        }
    }

    pub(crate) fn load_log(&mut self) -> PendingLog {
        let key = self.pending_key.clone();
        self.load_blob(&key, PendingLog::decode).unwrap_or_default()
    }

    pub(crate) fn load_cache(&mut self, max_entries: Option<usize>) -> LocalCache {
        let key = self.cache_key.clone();
        self.load_blob(&key, |bytes| LocalCache::decode(bytes, max_entries))
            .unwrap_or_else(|| LocalCache::with_max_entries(max_entries))
    }

    pub(crate) fn load_failed(&mut self) -> Vec<FailedAction> {
        let key = self.failed_key.clone();
        self.load_blob(&key, decode_versioned::<Vec<FailedAction>>)
            .unwrap_or_default()
    }

    pub(crate) fn save_log(&self, log: &PendingLog) -> bool {
        match log.encode() {
            Ok(bytes) => self.save_bytes(&self.pending_key, &bytes),
            Err(e) => {
                warn!(error = %e, "failed to encode pending log");
                false
            }
        }
    }

    pub(crate) fn save_cache(&self, cache: &LocalCache) -> bool {
        match cache.encode() {
            Ok(bytes) => self.save_bytes(&self.cache_key, &bytes),
            Err(e) => {
                warn!(error = %e, "failed to encode cache snapshot");
                false
            }
        }
    }

    pub(crate) fn save_failed(&self, failed: &[FailedAction]) -> bool {
        match encode_versioned(&failed) {
            Ok(bytes) => self.save_bytes(&self.failed_key, &bytes),
            Err(e) => {
                warn!(error = %e, "failed to encode failed actions");
                false
            }
        }
    }
}

/// State, persistence and clock shared by every engine component.
///
/// Persistence writes happen while the state lock is held so snapshots
/// reach storage in the order they were taken. The lock is never held
/// across an `.await`.
#[derive(Debug)]
pub(crate) struct Core<P> {
    pub(crate) config: SyncConfig,
    state: Mutex<SharedState>,
    store: StateStore<P>,
    clock: Arc<dyn Clock>,
}

impl<P: Persistence> Core<P> {
    /// Restores the durable state from `persistence`.
    pub(crate) fn open(config: SyncConfig, persistence: Arc<P>, clock: Arc<dyn Clock>) -> Self {
        let mut store = StateStore::new(&config, persistence);
        let log = store.load_log();
        let cache = store.load_cache(config.max_cache_entries);
        let failed = store.load_failed();
        debug!(
            namespace = %config.namespace,
            pending = log.len(),
            cached = cache.len(),
            failed = failed.len(),
            "restored engine state"
        );

        Self {
            config,
            state: Mutex::new(SharedState {
                cache,
                log,
                failed,
                stats: SyncStats::default(),
                cache_dirty: false,
            }),
            store,
            clock,
        }
    }

    /// Returns the blobs that could not be restored at open.
    pub(crate) fn unreadable(&self) -> &[UnreadableState] {
        self.store.unreadable()
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock()
    }

    pub(crate) fn persist_log(&self, state: &SharedState) -> bool {
        self.store.save_log(&state.log)
    }

    pub(crate) fn persist_failed(&self, state: &SharedState) -> bool {
        self.store.save_failed(&state.failed)
    }

    pub(crate) fn persist_cache(&self, state: &mut SharedState) -> bool {
        let saved = self.store.save_cache(&state.cache);
        if saved {
            state.cache_dirty = false;
        }
        saved
    }

    /// Writes the log, the failed list and the cache.
    pub(crate) fn persist_all(&self) {
        let mut state = self.lock();
        self.persist_log(&state);
        self.persist_failed(&state);
        self.persist_cache(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use tablesync_protocol::{ActionKind, PendingAction};
    use tablesync_storage::InMemoryPersistence;

    fn action(id: &str) -> PendingAction {
        let payload = json!({"id": id}).as_object().cloned().unwrap();
        PendingAction::new(ActionKind::Create, "devices", id, payload, 1)
    }

    fn core(persistence: &Arc<InMemoryPersistence>) -> Core<InMemoryPersistence> {
        Core::open(
            SyncConfig::new("test"),
            Arc::clone(persistence),
            Arc::new(ManualClock::new(100)),
        )
    }

    #[test]
    fn state_survives_reopen() {
        let persistence = Arc::new(InMemoryPersistence::new());
        {
            let core = core(&persistence);
            let mut state = core.lock();
            let a = action("d1");
            state.cache.apply_local(a.kind, &a.table, &a.record_id, &a.payload, 1);
            state.log.append(a);
            state.failed.push(FailedAction {
                action: action("d2"),
                failed_at: 5,
            });
            drop(state);
            core.persist_all();
        }

        let core = core(&persistence);
        let state = core.lock();
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.failed.len(), 1);
        assert!(state.cache.peek("devices", "d1").is_some());
        assert_eq!(core.now(), 100);
    }

    /// Encodes `body` under a format version this build does not know.
    fn future_blob() -> Vec<u8> {
        #[derive(Serialize)]
        struct Envelope {
            version: u16,
            body: Vec<u32>,
        }
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(
            &Envelope {
                version: tablesync_protocol::FORMAT_VERSION + 1,
                body: vec![1, 2, 3],
            },
            &mut bytes,
        )
        .unwrap();
        bytes
    }

    #[test]
    fn unreadable_log_is_copied_before_overwrite() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let newer = future_blob();
        persistence.save("test.pending", &newer).unwrap();
        persistence.save("test.cache", b"garbage").unwrap();

        let core = core(&persistence);
        assert!(core.lock().log.is_empty());
        assert!(core.lock().cache.is_empty());

        let keys: Vec<_> = core.unreadable().iter().map(|u| u.key.as_str()).collect();
        assert_eq!(keys, vec!["test.pending", "test.cache"]);
        assert!(core.unreadable()[0].error.contains("version"));
        assert_eq!(
            core.unreadable()[0].preserved_as.as_deref(),
            Some("test.pending.unreadable")
        );

        // New state goes to the original key; the copy keeps the old bytes
        let mut state = core.lock();
        state.log.append(action("d1"));
        assert!(core.persist_log(&state));
        drop(state);
        assert_eq!(persistence.load("test.pending.unreadable").unwrap(), Some(newer));
        assert_eq!(persistence.load("test.cache.unreadable").unwrap(), Some(b"garbage".to_vec()));
    }

    #[test]
    fn earlier_copy_is_never_replaced() {
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.save("test.pending", b"second bad log").unwrap();
        persistence.save("test.pending.unreadable", b"first bad log").unwrap();

        let core = core(&persistence);
        assert!(core.unreadable()[0].is_sealed());

        let mut state = core.lock();
        state.log.append(action("d1"));
        assert!(!core.persist_log(&state));
        drop(state);
        assert_eq!(
            persistence.load("test.pending").unwrap(),
            Some(b"second bad log".to_vec())
        );
        assert_eq!(
            persistence.load("test.pending.unreadable").unwrap(),
            Some(b"first bad log".to_vec())
        );
    }

    #[test]
    fn load_error_seals_every_key() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let log_bytes = {
            let mut log = PendingLog::new();
            log.append(action("d1"));
            log.encode().unwrap()
        };
        persistence.save("test.pending", &log_bytes).unwrap();

        persistence.set_fail_loads(true);
        let core = core(&persistence);
        persistence.set_fail_loads(false);

        assert_eq!(core.unreadable().len(), 3);
        assert!(core.unreadable().iter().all(UnreadableState::is_sealed));

        // A readable log that merely failed to load is not clobbered
        core.persist_all();
        assert_eq!(persistence.load("test.pending").unwrap(), Some(log_bytes));
        assert_eq!(persistence.load("test.cache").unwrap(), None);
    }

    #[test]
    fn failed_saves_keep_dirty_flag() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let core = core(&persistence);
        persistence.set_fail_saves(true);

        let mut state = core.lock();
        state.cache_dirty = true;
        assert!(!core.persist_cache(&mut state));
        assert!(state.cache_dirty);

        persistence.set_fail_saves(false);
        assert!(core.persist_cache(&mut state));
        assert!(!state.cache_dirty);
    }
}
