//! Inbound change subscriptions.
//!
//! Each watched table runs one task that holds a remote subscription,
//! applies every notification to the cache and fans it out to listeners.
//! A lost subscription is re-established with exponential backoff; after
//! the configured number of attempts the table gives up until
//! `force_reconnect`.

use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::engine::EngineInner;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteStore, SubscriptionHandle};
use crate::replicator::validate_table;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tablesync_protocol::{RemoteChange, SyncEvent};
use tablesync_storage::Persistence;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Health of one table's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    /// The first subscribe call is in flight.
    Connecting,
    /// The subscription is established.
    Live,
    /// Waiting before reconnect attempt `attempt` (1-based).
    Reconnecting {
        /// Upcoming attempt number.
        attempt: u32,
    },
    /// Reconnect attempts are exhausted.
    GaveUp,
}

#[derive(Debug)]
struct WatchedTable {
    generation: u64,
    status: TableStatus,
    handle: Option<SubscriptionHandle>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Registry of per-table subscription tasks.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    tables: Mutex<HashMap<String, WatchedTable>>,
    desired: Mutex<BTreeSet<String>>,
    generation: AtomicU64,
    pub(crate) realtime: ConnectivityMonitor,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            desired: Mutex::new(BTreeSet::new()),
            generation: AtomicU64::new(0),
            realtime: ConnectivityMonitor::new("realtime", ConnectivityState::Offline),
        }
    }

    pub(crate) fn statuses(&self) -> BTreeMap<String, TableStatus> {
        self.tables
            .lock()
            .iter()
            .map(|(table, watched)| (table.clone(), watched.status))
            .collect()
    }

    pub(crate) fn desired(&self) -> Vec<String> {
        self.desired.lock().iter().cloned().collect()
    }

    /// Recomputes the realtime state from every table's status.
    fn refresh(&self) {
        let state = {
            let tables = self.tables.lock();
            if tables.is_empty() || tables.values().any(|w| w.status == TableStatus::GaveUp) {
                ConnectivityState::Offline
            } else if tables.values().all(|w| w.status == TableStatus::Live) {
                ConnectivityState::Online
            } else {
                ConnectivityState::Reconnecting
            }
        };
        self.realtime.set(state);
    }

    fn set_status(&self, table: &str, generation: u64, status: TableStatus) {
        {
            let mut tables = self.tables.lock();
            match tables.get_mut(table) {
                Some(watched) if watched.generation == generation => watched.status = status,
                _ => return,
            }
        }
        self.refresh();
    }

    /// Stores the handle of a new subscription. Returns false if the table
    /// was unwatched meanwhile.
    fn set_live(&self, table: &str, generation: u64, handle: SubscriptionHandle) -> bool {
        {
            let mut tables = self.tables.lock();
            match tables.get_mut(table) {
                Some(watched) if watched.generation == generation => {
                    watched.status = TableStatus::Live;
                    watched.handle = Some(handle);
                }
                _ => return false,
            }
        }
        self.refresh();
        true
    }

    fn take_handle(&self, table: &str, generation: u64) -> Option<SubscriptionHandle> {
        let mut tables = self.tables.lock();
        match tables.get_mut(table) {
            Some(watched) if watched.generation == generation => watched.handle.take(),
            _ => None,
        }
    }

    fn detach(&self, table: &str) -> Option<WatchedTable> {
        self.tables.lock().remove(table)
    }

    fn detach_all(&self) -> Vec<(String, WatchedTable)> {
        self.tables.lock().drain().collect()
    }
}

impl<R, P> EngineInner<R, P>
where
    R: RemoteStore + ?Sized + 'static,
    P: Persistence + 'static,
{
    /// Starts watching `table`. Watching a live or reconnecting table is a
    /// no-op; a table that gave up is restarted.
    pub(crate) fn watch(self: &Arc<Self>, table: &str) -> SyncResult<()> {
        validate_table(table)?;
        let (handle, shutdown) = self.runtime_handle().ok_or(SyncError::NotStarted)?;
        self.dispatcher.desired.lock().insert(table.to_string());

        let generation = self.dispatcher.generation.fetch_add(1, Ordering::SeqCst);
        let token = shutdown.child_token();
        {
            let mut tables = self.dispatcher.tables.lock();
            if let Some(existing) = tables.get(table) {
                if existing.status != TableStatus::GaveUp {
                    return Ok(());
                }
            }
            // Registered before the task starts so its first status update
            // finds the entry.
            tables.insert(
                table.to_string(),
                WatchedTable {
                    generation,
                    status: TableStatus::Connecting,
                    handle: None,
                    token: token.clone(),
                    task: None,
                },
            );
        }
        self.dispatcher.refresh();

        let task = handle.spawn(Arc::clone(self).run_subscription(
            table.to_string(),
            generation,
            token,
        ));
        if let Some(watched) = self.dispatcher.tables.lock().get_mut(table) {
            if watched.generation == generation {
                watched.task = Some(task);
            }
        }
        Ok(())
    }

    /// Stops watching `table`. Returns false if it was not watched.
    pub(crate) async fn unwatch(&self, table: &str) -> bool {
        let desired = self.dispatcher.desired.lock().remove(table);
        let watched = self.dispatcher.detach(table);
        let found = watched.is_some();
        if let Some(watched) = watched {
            self.close(table, watched).await;
        }
        self.dispatcher.refresh();
        desired || found
    }

    /// Closes every subscription. The tables stay registered for
    /// `force_reconnect`.
    pub(crate) async fn close_subscriptions(&self) {
        for (table, watched) in self.dispatcher.detach_all() {
            self.close(&table, watched).await;
        }
        self.dispatcher.refresh();
    }

    /// Closes every subscription and re-subscribes each registered table
    /// with a fresh attempt budget.
    pub(crate) async fn reconnect_all(self: &Arc<Self>) -> SyncResult<()> {
        if self.runtime_handle().is_none() {
            return Err(SyncError::NotStarted);
        }
        self.close_subscriptions().await;
        for table in self.dispatcher.desired() {
            self.watch(&table)?;
        }
        info!(tables = self.dispatcher.desired.lock().len(), "realtime reconnect forced");
        Ok(())
    }

    async fn close(&self, table: &str, mut watched: WatchedTable) {
        watched.token.cancel();
        if let Some(task) = watched.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(table, "subscription task panicked");
                }
            }
        }
        if let Some(handle) = watched.handle.take() {
            self.remote.unsubscribe(handle);
        }
        self.core.lock().stats.watched_tables.remove(table);
        debug!(table, "subscription closed");
    }

    async fn run_subscription(self: Arc<Self>, table: String, generation: u64, token: CancellationToken) {
        let backoff = self.core.config.reconnect.clone();
        let mut attempt: u32 = 0;

        loop {
            let subscribed = tokio::select! {
                biased;
                () = token.cancelled() => return,
                result = self.remote.subscribe(&table) => result,
            };

            match subscribed {
                Ok(subscription) => {
                    if token.is_cancelled()
                        || !self.dispatcher.set_live(&table, generation, subscription.handle)
                    {
                        self.remote.unsubscribe(subscription.handle);
                        return;
                    }
                    attempt = 0;
                    self.core.lock().stats.watched_tables.insert(table.clone());
                    info!(table = %table, handle = subscription.handle.id(), "subscribed");

                    if !self.pump(&table, subscription.events, &token).await {
                        return;
                    }

                    warn!(table = %table, "subscription lost");
                    if let Some(handle) = self.dispatcher.take_handle(&table, generation) {
                        self.remote.unsubscribe(handle);
                    }
                    self.core.lock().stats.watched_tables.remove(&table);
                }
                Err(e) => {
                    warn!(table = %table, attempt, error = %e, "subscribe failed");
                }
            }

            if attempt >= backoff.max_attempts {
                warn!(table = %table, attempts = attempt, "giving up on realtime subscription");
                self.dispatcher.set_status(&table, generation, TableStatus::GaveUp);
                return;
            }

            let delay = backoff.delay_for_attempt(attempt);
            attempt += 1;
            self.core.lock().stats.reconnect_attempts += 1;
            self.dispatcher
                .set_status(&table, generation, TableStatus::Reconnecting { attempt });
            debug!(table = %table, attempt, ?delay, "reconnecting");

            tokio::select! {
                biased;
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Delivers notifications until the channel closes (true) or the task
    /// is cancelled (false).
    async fn pump(
        &self,
        table: &str,
        mut events: mpsc::UnboundedReceiver<RemoteChange>,
        token: &CancellationToken,
    ) -> bool {
        loop {
            let change = tokio::select! {
                biased;
                () = token.cancelled() => return false,
                change = events.recv() => change,
            };
            match change {
                Some(change) => self.deliver(table, change),
                None => return true,
            }
        }
    }

    /// Applies one notification to the cache, then notifies listeners.
    pub(crate) fn deliver(&self, table: &str, change: RemoteChange) {
        let now = self.core.now();
        let event = match SyncEvent::normalize(table, change, now) {
            Ok(event) => event,
            Err(e) => {
                warn!(table, error = %e, "dropping malformed notification");
                return;
            }
        };

        {
            let mut state = self.core.lock();
            state.cache.apply_remote(&event);
            state.cache_dirty = true;
            state.stats.total_events += 1;
            state.stats.last_sync = Some(now);
        }

        let delivery = self.listeners.dispatch(&event);
        debug!(
            table,
            id = %event.record_id,
            event_type = ?event.event_type,
            delivered = delivery.delivered,
            failed = delivery.failed,
            "change delivered"
        );
    }
}
