//! # tablesync engine
//!
//! Offline-first synchronization between a local cache and a remote
//! table-oriented store.
//!
//! This crate provides:
//! - A persisted FIFO log of local mutations, replayed against the remote
//! - A local record cache with optimistic and confirmed entries
//! - A sync scheduler (periodic timer, on-enqueue and on-reconnect passes)
//! - Realtime change subscriptions with exponential reconnect backoff
//! - A listener registry for inbound change events
//! - Connectivity tracking for the network and the realtime channel
//!
//! ## Architecture
//!
//! Writes flow outward: `enqueue` applies a mutation to the cache, appends
//! it to the pending log and persists the log. The replicator later drains
//! the log in FIFO order; an acknowledged action leaves the persisted log
//! before the next one is sent.
//!
//! Changes flow inward: each watched table holds one subscription. Every
//! notification is normalized, applied to the cache and delivered to the
//! table's listeners and then to wildcard listeners.
//!
//! ## Key Invariants
//!
//! - Actions for one record reach the remote in enqueue order
//! - An acknowledged action is never replayed
//! - Only one drain pass runs at a time
//! - An action is attempted at most `max_attempts` times, then moved to the
//!   failed list
//! - A failing listener never prevents delivery to the others

mod cache;
mod clock;
mod config;
mod connectivity;
mod dispatcher;
mod engine;
mod error;
mod listeners;
mod remote;
mod replicator;
mod scheduler;
mod state;

pub use cache::{CacheEntry, EntrySource, LocalCache, RemoteApply};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackoffConfig, RetryPolicy, SyncConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, Transition};
pub use dispatcher::TableStatus;
pub use engine::{EngineStatus, SyncEngine};
pub use error::{RemoteError, SyncError, SyncResult};
pub use listeners::{
    Delivery, ListenerError, ListenerHandle, ListenerId, ListenerRegistry, ListenerResult, WILDCARD,
};
pub use remote::{MockRemote, RemoteCall, RemoteStore, RemoteSubscription, SubscriptionHandle};
pub use replicator::{ActionFailure, DrainReport, SyncOutcome};
pub use scheduler::SchedulerState;
pub use state::{SyncStats, UnreadableState};

pub use tablesync_protocol::{
    ActionId, ActionKind, ChangeType, FailedAction, PendingAction, Record, RecordKey,
    RemoteChange, SyncEvent,
};
