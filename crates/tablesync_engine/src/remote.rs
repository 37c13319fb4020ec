//! Remote table store abstraction.

use crate::error::RemoteError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tablesync_protocol::{Record, RecordKey, RemoteChange};
use tokio::sync::mpsc;

/// Handle identifying one live change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Wraps a backend-specific identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the identifier.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A live change subscription for one table.
///
/// Notifications arrive on `events` until the subscription ends. The remote
/// closes the channel when the subscription is lost; the engine treats that
/// as a subscription failure and reconnects.
#[derive(Debug)]
pub struct RemoteSubscription {
    /// Handle to pass to [`RemoteStore::unsubscribe`].
    pub handle: SubscriptionHandle,
    /// Stream of change notifications.
    pub events: mpsc::UnboundedReceiver<RemoteChange>,
}

/// A remote table-oriented store.
///
/// This trait abstracts the backend, allowing for different implementations
/// (REST, WebSocket, mock for testing, etc.). Writes are expected to be
/// idempotent upserts so replaying an action after a crash is harmless.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Inserts a full record.
    async fn insert(&self, table: &str, record: &Record) -> Result<(), RemoteError>;

    /// Replaces the record `id` with `record`.
    async fn update(&self, table: &str, id: &str, record: &Record) -> Result<(), RemoteError>;

    /// Deletes the record `id`.
    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;

    /// Opens a change subscription for `table`.
    async fn subscribe(&self, table: &str) -> Result<RemoteSubscription, RemoteError>;

    /// Closes a subscription. Unknown handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// A remote call observed by [`MockRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    /// `insert(table, record)`.
    Insert {
        /// Table.
        table: String,
        /// Record.
        record: Record,
    },
    /// `update(table, id, record)`.
    Update {
        /// Table.
        table: String,
        /// Record id.
        id: String,
        /// Record.
        record: Record,
    },
    /// `delete(table, id)`.
    Delete {
        /// Table.
        table: String,
        /// Record id.
        id: String,
    },
}

impl RemoteCall {
    /// Returns the key of the record the call targets.
    pub fn key(&self) -> Option<RecordKey> {
        match self {
            RemoteCall::Insert { table, record } => {
                tablesync_protocol::record_id(record).map(|id| RecordKey::new(table.clone(), id))
            }
            RemoteCall::Update { table, id, .. } | RemoteCall::Delete { table, id } => {
                Some(RecordKey::new(table.clone(), id.clone()))
            }
        }
    }
}

#[derive(Debug, Default)]
struct MockFailures {
    all: Option<RemoteError>,
    next: Vec<RemoteError>,
    keys: HashMap<RecordKey, RemoteError>,
}

/// An in-memory remote for testing.
///
/// Records every write, can be told to fail writes or subscriptions, and
/// lets tests push change notifications into open subscriptions.
#[derive(Debug, Default)]
pub struct MockRemote {
    calls: Mutex<Vec<RemoteCall>>,
    failures: Mutex<MockFailures>,
    call_delay: Mutex<Option<Duration>>,
    subscriptions: Mutex<HashMap<u64, (String, mpsc::UnboundedSender<RemoteChange>)>>,
    unsubscribed: Mutex<Vec<SubscriptionHandle>>,
    failing_subscribes: AtomicU32,
    subscribe_attempts: AtomicU64,
    next_handle: AtomicU64,
}

impl MockRemote {
    /// Creates a healthy mock remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every write received so far, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of writes received so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Makes every write fail with `error` until cleared with `None`.
    pub fn fail_all(&self, error: Option<RemoteError>) {
        self.failures.lock().all = error;
    }

    /// Makes the next write fail with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.failures.lock().next.push(error);
    }

    /// Makes every write to `key` fail with `error`.
    pub fn fail_key(&self, key: RecordKey, error: RemoteError) {
        self.failures.lock().keys.insert(key, error);
    }

    /// Removes every scripted write failure.
    pub fn clear_failures(&self) {
        *self.failures.lock() = MockFailures::default();
    }

    /// Delays every write by `delay`.
    pub fn set_call_delay(&self, delay: Option<Duration>) {
        *self.call_delay.lock() = delay;
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_subscribes(&self, count: u32) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Returns the number of subscribe calls so far.
    pub fn subscribe_attempts(&self) -> u64 {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }

    /// Returns the number of open subscriptions for `table`.
    pub fn active_subscriptions(&self, table: &str) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|(t, _)| t.as_str() == table)
            .count()
    }

    /// Returns the handles passed to `unsubscribe`.
    pub fn unsubscribed(&self) -> Vec<SubscriptionHandle> {
        self.unsubscribed.lock().clone()
    }

    /// Delivers a notification to every open subscription of `table`.
    ///
    /// Returns the number of subscriptions that received it.
    pub fn emit(&self, table: &str, change: RemoteChange) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|(t, _)| t.as_str() == table)
            .filter(|(_, tx)| tx.send(change.clone()).is_ok())
            .count()
    }

    /// Drops every open subscription of `table`, simulating a lost stream.
    pub fn drop_subscriptions(&self, table: &str) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|_, (t, _)| t.as_str() != table);
        before - subscriptions.len()
    }

    async fn record(&self, call: RemoteCall) -> Result<(), RemoteError> {
        let delay = *self.call_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let key = call.key();
        self.calls.lock().push(call);

        let mut failures = self.failures.lock();
        if !failures.next.is_empty() {
            return Err(failures.next.remove(0));
        }
        if let Some(error) = key.and_then(|k| failures.keys.get(&k).cloned()) {
            return Err(error);
        }
        match &failures.all {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn insert(&self, table: &str, record: &Record) -> Result<(), RemoteError> {
        self.record(RemoteCall::Insert {
            table: table.to_string(),
            record: record.clone(),
        })
        .await
    }

    async fn update(&self, table: &str, id: &str, record: &Record) -> Result<(), RemoteError> {
        self.record(RemoteCall::Update {
            table: table.to_string(),
            id: id.to_string(),
            record: record.clone(),
        })
        .await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.record(RemoteCall::Delete {
            table: table.to_string(),
            id: id.to_string(),
        })
        .await
    }

    async fn subscribe(&self, table: &str) -> Result<RemoteSubscription, RemoteError> {
        self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(RemoteError::Subscription(format!(
                "channel for {table} refused"
            )));
        }

        let id = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .insert(id, (table.to_string(), tx));

        Ok(RemoteSubscription {
            handle: SubscriptionHandle::new(id),
            events: rx,
        })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscriptions.lock().remove(&handle.id());
        self.unsubscribed.lock().push(handle);
    }
}
