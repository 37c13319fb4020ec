//! Error types for the sync engine.

use tablesync_protocol::{ActionId, ActionKind, ProtocolError};
use tablesync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors reported by a [`crate::RemoteStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The remote answered with an error status.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP-like status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// The remote rejected the record (validation, constraint violation).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The remote reported a conflicting write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A change subscription could not be established or was lost.
    #[error("subscription failed: {0}")]
    Subscription(String),
}

impl RemoteError {
    /// Creates a server error.
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Returns true if repeating the request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transport(_) | RemoteError::Timeout | RemoteError::Subscription(_) => {
                true
            }
            RemoteError::Server { status, .. } => *status >= 500 || *status == 429,
            RemoteError::Rejected(_) | RemoteError::Conflict(_) => false,
        }
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote system failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding or decoding of persisted state failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A mutation was enqueued for a record without an id.
    #[error("{kind} for table {table} needs a record id")]
    MissingRecordId {
        /// Target table.
        table: String,
        /// Mutation type.
        kind: ActionKind,
    },

    /// The table name is unusable.
    #[error("invalid table name {0:?}")]
    InvalidTable(String),

    /// No failed action has the given id.
    #[error("no failed action with id {0}")]
    UnknownAction(ActionId),

    /// `start` was called outside a Tokio runtime.
    #[error("no Tokio runtime available")]
    NoRuntime,

    /// `start` was called on a running engine.
    #[error("engine already started")]
    AlreadyStarted,

    /// The operation needs a started engine.
    #[error("engine not started")]
    NotStarted,
}

impl SyncError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Storage(_) => true,
            _ => false,
        }
    }
}
