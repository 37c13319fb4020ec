//! # tablesync Protocol
//!
//! Data model shared by the tablesync engine and its tools.
//!
//! This crate provides:
//! - [`Record`] and [`RecordKey`] for table-shaped records
//! - [`PendingAction`] for queued local mutations
//! - [`PendingLog`], the FIFO of not-yet-acknowledged actions
//! - [`RemoteChange`] and [`SyncEvent`] for inbound change notifications
//! - CBOR encoding/decoding of everything the engine persists
//!
//! This is a pure data crate with no I/O operations.

mod action;
mod change;
mod codec;
mod error;
mod pending;
mod record;

pub use action::{ActionId, ActionKind, FailedAction, PendingAction};
pub use change::{ChangeType, RemoteChange, SyncEvent};
pub use codec::{decode_versioned, encode_versioned, FORMAT_VERSION};
pub use error::{ProtocolError, ProtocolResult};
pub use pending::PendingLog;
pub use record::{record_id, Record, RecordKey, ID_FIELD};
