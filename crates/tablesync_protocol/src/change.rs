//! Inbound change notifications.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{record_id, Record, RecordKey};
use serde::{Deserialize, Serialize};

/// Type of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    /// Record was inserted remotely.
    Insert,
    /// Record was updated remotely.
    Update,
    /// Record was deleted remotely.
    Delete,
}

/// A raw notification delivered by a remote table subscription.
///
/// Insert and Update notifications carry `new_record`; Delete notifications
/// carry `old_record`. The remote may attach its commit timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Type of change.
    pub event_type: ChangeType,
    /// Record after the change.
    pub new_record: Option<Record>,
    /// Record before the change.
    pub old_record: Option<Record>,
    /// Remote commit time in milliseconds since the Unix epoch.
    pub commit_timestamp: Option<u64>,
}

impl RemoteChange {
    /// Creates an insert notification.
    pub fn insert(record: Record) -> Self {
        Self {
            event_type: ChangeType::Insert,
            new_record: Some(record),
            old_record: None,
            commit_timestamp: None,
        }
    }

    /// Creates an update notification.
    pub fn update(record: Record) -> Self {
        Self {
            event_type: ChangeType::Update,
            new_record: Some(record),
            old_record: None,
            commit_timestamp: None,
        }
    }

    /// Creates a delete notification.
    pub fn delete(old_record: Record) -> Self {
        Self {
            event_type: ChangeType::Delete,
            new_record: None,
            old_record: Some(old_record),
            commit_timestamp: None,
        }
    }

    /// Attaches a commit timestamp.
    pub fn at(mut self, timestamp: u64) -> Self {
        self.commit_timestamp = Some(timestamp);
        self
    }
}

/// A normalized change event, as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Table the record belongs to.
    pub table: String,
    /// Type of change.
    pub event_type: ChangeType,
    /// New record for Insert/Update, old record for Delete.
    pub record: Record,
    /// Identifier of `record`.
    pub record_id: String,
    /// Remote commit time, or receive time when the remote sent none.
    pub timestamp: u64,
}

impl SyncEvent {
    /// Normalizes a raw notification.
    ///
    /// `received_at` is used when the notification has no commit timestamp.
    /// Delete notifications without an old record fall back to the new one.
    ///
    /// # Errors
    ///
    /// Fails if the notification carries no record or the record has no id.
    pub fn normalize(
        table: &str,
        change: RemoteChange,
        received_at: u64,
    ) -> ProtocolResult<Self> {
        let RemoteChange {
            event_type,
            new_record,
            old_record,
            commit_timestamp,
        } = change;

        let record = match event_type {
            ChangeType::Insert | ChangeType::Update => new_record,
            ChangeType::Delete => old_record.or(new_record),
        }
        .ok_or_else(|| ProtocolError::MissingRecord {
            table: table.to_string(),
            event_type,
        })?;

        let id = record_id(&record).ok_or_else(|| ProtocolError::MissingId {
            table: table.to_string(),
        })?;

        Ok(Self {
            table: table.to_string(),
            event_type,
            record,
            record_id: id,
            timestamp: commit_timestamp.unwrap_or(received_at),
        })
    }

    /// Returns the key of the affected record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.record_id.clone())
    }
}
