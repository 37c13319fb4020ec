//! Local cache of last-known records.
//!
//! The cache maps `(table, id)` to the most recently known version of a
//! record together with its provenance:
//!
//! - `Optimistic` entries come from local mutations not yet acknowledged
//! - `Confirmed` entries come from the remote (inbound events, seeding) or
//!   from acknowledged local mutations
//!
//! When bounded, the cache evicts the least recently touched confirmed
//! entries. Optimistic entries are never evicted: while their action is
//! pending or in the failed list, that action and the cache are the only
//! copies. Once the action is discarded the entry is dropped with
//! [`LocalCache::discard_optimistic`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tablesync_protocol::{
    decode_versioned, encode_versioned, ActionKind, ChangeType, ProtocolResult, Record,
    RecordKey, SyncEvent,
};
use tracing::debug;

/// Provenance of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntrySource {
    /// Applied locally, not yet acknowledged by the remote.
    Optimistic,
    /// Known to match the remote.
    Confirmed,
}

/// A cached record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Record fields.
    pub record: Record,
    /// Provenance.
    pub source: EntrySource,
    /// Time of the change that produced this entry (ms).
    pub updated_at: u64,
    #[serde(skip)]
    touched: u64,
}

impl CacheEntry {
    fn new(record: Record, source: EntrySource, updated_at: u64) -> Self {
        Self {
            record,
            source,
            updated_at,
            touched: 0,
        }
    }

    /// Returns true if the entry is awaiting acknowledgment.
    pub fn is_optimistic(&self) -> bool {
        self.source == EntrySource::Optimistic
    }
}

/// Outcome of applying an inbound event to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// The event replaced or removed the entry.
    Applied,
    /// A newer optimistic entry was kept.
    Stale,
}

/// The local record cache.
#[derive(Debug, Default)]
pub struct LocalCache {
    tables: BTreeMap<String, BTreeMap<String, CacheEntry>>,
    max_entries: Option<usize>,
    len: usize,
    tick: u64,
    evicted: u64,
}

impl LocalCache {
    /// Creates an unbounded cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache holding at most `max_entries` confirmed records.
    pub fn with_max_entries(max_entries: Option<usize>) -> Self {
        Self {
            max_entries,
            ..Self::default()
        }
    }

    /// Returns an entry, marking it as recently used.
    pub fn get(&mut self, table: &str, id: &str) -> Option<&CacheEntry> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.tables.get_mut(table)?.get_mut(id)?;
        entry.touched = tick;
        Some(entry)
    }

    /// Returns an entry without touching it.
    pub fn peek(&self, table: &str, id: &str) -> Option<&CacheEntry> {
        self.tables.get(table)?.get(id)
    }

    /// Returns the entries of a table, ordered by id.
    pub fn table(&self, table: &str) -> Vec<(&str, &CacheEntry)> {
        self.tables
            .get(table)
            .map(|entries| entries.iter().map(|(id, e)| (id.as_str(), e)).collect())
            .unwrap_or_default()
    }

    /// Returns the names of all cached tables.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Returns the total number of cached records.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of entries evicted by the size policy so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Applies a local mutation optimistically.
    ///
    /// Create replaces the entry, Update merges the payload's fields into
    /// the known record, Delete removes the entry.
    pub fn apply_local(
        &mut self,
        kind: ActionKind,
        table: &str,
        id: &str,
        payload: &Record,
        now: u64,
    ) {
        match kind {
            ActionKind::Create => {
                self.put(table, id, CacheEntry::new(payload.clone(), EntrySource::Optimistic, now));
            }
            ActionKind::Update => {
                let mut record = self
                    .peek(table, id)
                    .map(|e| e.record.clone())
                    .unwrap_or_default();
                for (field, value) in payload {
                    record.insert(field.clone(), value.clone());
                }
                self.put(table, id, CacheEntry::new(record, EntrySource::Optimistic, now));
            }
            ActionKind::Delete => {
                self.remove(table, id);
            }
        }
    }

    /// Marks an optimistic entry as confirmed.
    ///
    /// Returns true if the entry changed.
    pub fn confirm(&mut self, key: &RecordKey) -> bool {
        match self
            .tables
            .get_mut(&key.table)
            .and_then(|entries| entries.get_mut(&key.id))
        {
            Some(entry) if entry.is_optimistic() => {
                entry.source = EntrySource::Confirmed;
                true
            }
            _ => false,
        }
    }

    /// Drops an optimistic entry whose action was discarded.
    ///
    /// Confirmed entries are left alone. Returns true if an entry was
    /// removed.
    pub fn discard_optimistic(&mut self, key: &RecordKey) -> bool {
        if !self
            .peek(&key.table, &key.id)
            .is_some_and(CacheEntry::is_optimistic)
        {
            return false;
        }
        self.remove(&key.table, &key.id).is_some()
    }

    /// Applies an inbound event.
    ///
    /// Confirmed entries always follow the remote. An optimistic entry is
    /// only replaced by an event strictly newer than the local change.
    pub fn apply_remote(&mut self, event: &SyncEvent) -> RemoteApply {
        if let Some(existing) = self.peek(&event.table, &event.record_id) {
            if existing.is_optimistic() && existing.updated_at >= event.timestamp {
                debug!(
                    table = %event.table,
                    id = %event.record_id,
                    local = existing.updated_at,
                    remote = event.timestamp,
                    "keeping newer optimistic entry"
                );
                return RemoteApply::Stale;
            }
        }

        match event.event_type {
            ChangeType::Insert | ChangeType::Update => {
                let entry =
                    CacheEntry::new(event.record.clone(), EntrySource::Confirmed, event.timestamp);
                self.put(&event.table, &event.record_id, entry);
            }
            ChangeType::Delete => {
                self.remove(&event.table, &event.record_id);
            }
        }
        RemoteApply::Applied
    }

    /// Loads a snapshot of a table as confirmed entries.
    ///
    /// Records without an id and records shadowed by an optimistic entry are
    /// skipped. Returns the number of records loaded.
    pub fn seed(&mut self, table: &str, records: Vec<Record>, now: u64) -> usize {
        let mut loaded = 0;
        for record in records {
            let Some(id) = tablesync_protocol::record_id(&record) else {
                continue;
            };
            if self.peek(table, &id).is_some_and(CacheEntry::is_optimistic) {
                continue;
            }
            self.put(table, &id, CacheEntry::new(record, EntrySource::Confirmed, now));
            loaded += 1;
        }
        loaded
    }

    /// Removes every confirmed entry of a table; optimistic ones stay.
    ///
    /// Returns the number of removed entries.
    pub fn clear_confirmed(&mut self, table: &str) -> usize {
        let Some(entries) = self.tables.get_mut(table) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| e.is_optimistic());
        let removed = before - entries.len();
        if entries.is_empty() {
            self.tables.remove(table);
        }
        self.len -= removed;
        removed
    }

    /// Encodes the cache for persistence.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_versioned(&self.tables)
    }

    /// Restores a cache persisted by [`LocalCache::encode`].
    pub fn decode(bytes: &[u8], max_entries: Option<usize>) -> ProtocolResult<Self> {
        let tables: BTreeMap<String, BTreeMap<String, CacheEntry>> = decode_versioned(bytes)?;
        let len = tables.values().map(BTreeMap::len).sum();
        let mut cache = Self {
            tables,
            max_entries,
            len,
            tick: 0,
            evicted: 0,
        };
        cache.enforce_limit();
        Ok(cache)
    }

    fn put(&mut self, table: &str, id: &str, mut entry: CacheEntry) {
        self.tick += 1;
        entry.touched = self.tick;
        let previous = self
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), entry);
        if previous.is_none() {
            self.len += 1;
        }
        self.enforce_limit();
    }

    fn remove(&mut self, table: &str, id: &str) -> Option<CacheEntry> {
        let entries = self.tables.get_mut(table)?;
        let removed = entries.remove(id)?;
        if entries.is_empty() {
            self.tables.remove(table);
        }
        self.len -= 1;
        Some(removed)
    }

    fn enforce_limit(&mut self) {
        let Some(max) = self.max_entries else {
            return;
        };
        while self.len > max {
            let victim = self
                .tables
                .iter()
                .flat_map(|(table, entries)| {
                    entries
                        .iter()
                        .filter(|(_, e)| !e.is_optimistic())
                        .map(move |(id, e)| (e.touched, table.clone(), id.clone()))
                })
                .min();
            let Some((_, table, id)) = victim else {
                // Only optimistic entries left.
                break;
            };
            debug!(%table, %id, "evicting cache entry");
            self.remove(&table, &id);
            self.evicted += 1;
        }
    }
}
