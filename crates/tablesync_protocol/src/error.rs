//! Error types for the protocol crate.

use crate::change::ChangeType;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while encoding, decoding or normalizing data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// A persisted blob was written by an unknown format version.
    #[error("unsupported format version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the blob.
        found: u16,
        /// Version this build understands.
        expected: u16,
    },

    /// A change notification lacked the record it needs.
    #[error("{event_type:?} notification for table {table} carries no record")]
    MissingRecord {
        /// Table of the notification.
        table: String,
        /// Event type of the notification.
        event_type: ChangeType,
    },

    /// A record has no usable identifier.
    #[error("record in table {table} has no id")]
    MissingId {
        /// Table of the record.
        table: String,
    },
}
