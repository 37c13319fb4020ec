//! FIFO log of pending actions.

use crate::action::{ActionId, PendingAction};
use crate::codec::{decode_versioned, encode_versioned};
use crate::error::ProtocolResult;
use crate::record::RecordKey;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// An ordered log of not-yet-acknowledged actions.
///
/// # Invariants
///
/// - Actions are kept in enqueue order (oldest first)
/// - An action leaves the log only when acknowledged or evicted
/// - Removing an action never reorders the remaining ones
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingLog {
    actions: VecDeque<PendingAction>,
}

impl PendingLog {
    /// Creates a new empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an action at the tail and returns its id.
    pub fn append(&mut self, action: PendingAction) -> ActionId {
        let id = action.id;
        self.actions.push_back(action);
        id
    }

    /// Returns the oldest action.
    pub fn front(&self) -> Option<&PendingAction> {
        self.actions.front()
    }

    /// Looks up an action by id.
    pub fn get(&self, id: &ActionId) -> Option<&PendingAction> {
        self.actions.iter().find(|a| a.id == *id)
    }

    /// Looks up an action by id for mutation.
    pub fn get_mut(&mut self, id: &ActionId) -> Option<&mut PendingAction> {
        self.actions.iter_mut().find(|a| a.id == *id)
    }

    /// Removes an action, keeping the order of the rest.
    pub fn remove(&mut self, id: &ActionId) -> Option<PendingAction> {
        let index = self.actions.iter().position(|a| a.id == *id)?;
        self.actions.remove(index)
    }

    /// Returns the ids of all actions, oldest first.
    pub fn ids(&self) -> Vec<ActionId> {
        self.actions.iter().map(|a| a.id).collect()
    }

    /// Iterates over actions, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.actions.iter()
    }

    /// Returns true if any action other than `except` targets `key`.
    pub fn has_other_for(&self, key: &RecordKey, except: &ActionId) -> bool {
        self.actions
            .iter()
            .any(|a| a.id != *except && a.table == key.table && a.record_id == key.id)
    }

    /// Returns the number of actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Encodes the log for persistence.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_versioned(self)
    }

    /// Decodes a persisted log.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_versioned(bytes)
    }
}
