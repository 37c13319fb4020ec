//! Queued local mutations.

use crate::record::{Record, RecordKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(Uuid);

impl ActionId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ActionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Type of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Record was created locally.
    Create,
    /// Record was replaced locally.
    Update,
    /// Record was deleted locally.
    Delete,
}

impl ActionKind {
    /// Returns a lowercase name for logs and tool output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation waiting to be acknowledged by the remote system.
///
/// # Fields
///
/// - `id`: Opaque action identifier
/// - `kind`: Create, Update or Delete
/// - `table` / `record_id`: The record being mutated
/// - `payload`: Full record for Create/Update, the last known record for Delete
/// - `created_at`: Enqueue time in milliseconds since the Unix epoch
/// - `attempts`: Failed remote attempts so far
/// - `last_error`: Message of the most recent failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Action identifier.
    pub id: ActionId,
    /// Mutation type.
    pub kind: ActionKind,
    /// Target table.
    pub table: String,
    /// Target record identifier.
    pub record_id: String,
    /// Record payload.
    pub payload: Record,
    /// Enqueue timestamp (ms).
    pub created_at: u64,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Most recent failure message.
    pub last_error: Option<String>,
}

impl PendingAction {
    /// Creates a fresh action with no attempts.
    pub fn new(
        kind: ActionKind,
        table: impl Into<String>,
        record_id: impl Into<String>,
        payload: Record,
        created_at: u64,
    ) -> Self {
        Self {
            id: ActionId::new(),
            kind,
            table: table.into(),
            record_id: record_id.into(),
            payload,
            created_at,
            attempts: 0,
            last_error: None,
        }
    }

    /// Returns the key of the record this action mutates.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.record_id.clone())
    }

    /// Records a failed attempt and returns the new attempt count.
    pub fn record_failure(&mut self, error: impl Into<String>) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
        self.attempts
    }

    /// Returns true if the action may not be attempted again.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}

/// An action evicted from the log after exhausting its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAction {
    /// The action as it was when evicted.
    pub action: PendingAction,
    /// Eviction timestamp (ms).
    pub failed_at: u64,
}
