//! The sync engine.

use crate::cache::CacheEntry;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState, Transition};
use crate::dispatcher::{Dispatcher, TableStatus};
use crate::error::{SyncError, SyncResult};
use crate::listeners::{ListenerHandle, ListenerRegistry, ListenerResult};
use crate::remote::RemoteStore;
use crate::replicator::{validate_table, Replicator, SyncOutcome};
use crate::scheduler::{PassTrigger, Scheduler, SchedulerState};
use crate::state::{Core, SyncStats, UnreadableState};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tablesync_protocol::{
    ActionId, ActionKind, FailedAction, PendingAction, Record, RemoteChange, SyncEvent,
};
use tablesync_storage::Persistence;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    /// True if the network is online.
    pub is_online: bool,
    /// Network connectivity.
    pub network: ConnectivityState,
    /// Realtime subscription health.
    pub realtime: ConnectivityState,
    /// Scheduler activity.
    pub scheduler: SchedulerState,
    /// Actions waiting to be sent.
    pub pending_count: usize,
    /// Actions that exhausted their attempts.
    pub failed_count: usize,
    /// Tables with an established subscription.
    pub watched_tables: Vec<String>,
    /// Per-table subscription health.
    pub subscriptions: BTreeMap<String, TableStatus>,
    /// Time of the last successful sync (ms).
    pub last_sync: Option<u64>,
    /// True between `start` and `stop`.
    pub running: bool,
    /// Persisted state that could not be restored at open.
    pub unreadable_state: Vec<UnreadableState>,
}

#[derive(Debug)]
struct Runtime {
    handle: Handle,
    shutdown: CancellationToken,
    timer: JoinHandle<()>,
}

/// State shared between the engine handle and its background tasks.
pub(crate) struct EngineInner<R: ?Sized, P> {
    pub(crate) core: Core<P>,
    pub(crate) remote: Arc<R>,
    pub(crate) replicator: Replicator,
    pub(crate) scheduler: Scheduler,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) network: ConnectivityMonitor,
    runtime: Mutex<Option<Runtime>>,
}

impl<R: ?Sized, P> EngineInner<R, P> {
    /// Returns the runtime handle and shutdown token while started.
    pub(crate) fn runtime_handle(&self) -> Option<(Handle, CancellationToken)> {
        self.runtime
            .lock()
            .as_ref()
            .map(|rt| (rt.handle.clone(), rt.shutdown.child_token()))
    }
}

/// An offline-first synchronization engine.
///
/// The engine keeps a local cache of remote tables, queues local mutations
/// in a persisted log and replays them against the remote when it is
/// reachable. Remote changes arrive through per-table subscriptions and are
/// fanned out to listeners.
///
/// Reads and [`enqueue`](Self::enqueue) never wait on the network. Several
/// engines may run side by side as long as their namespaces differ.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use serde_json::json;
/// use tablesync_engine::{ActionKind, MockRemote, SyncConfig, SyncEngine, SyncOutcome};
/// use tablesync_storage::InMemoryPersistence;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let remote = Arc::new(MockRemote::new());
/// let engine = SyncEngine::new(
///     SyncConfig::new("pos"),
///     Arc::clone(&remote),
///     Arc::new(InMemoryPersistence::new()),
/// );
///
/// let record = json!({"id": "d1", "status": "online"});
/// engine.enqueue(ActionKind::Create, "devices", record.as_object().cloned().unwrap_or_default())?;
/// assert!(engine.get_local_record("devices", "d1").is_some());
///
/// let outcome = engine.force_sync().await;
/// assert!(matches!(outcome, SyncOutcome::Completed(_)));
/// assert_eq!(remote.call_count(), 1);
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine<R: ?Sized, P> {
    inner: Arc<EngineInner<R, P>>,
}

impl<R, P> std::fmt::Debug for SyncEngine<R, P>
where
    R: ?Sized,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("namespace", &self.inner.core.config.namespace)
            .field("network", &self.inner.network.current())
            .finish_non_exhaustive()
    }
}

impl<R, P> SyncEngine<R, P>
where
    R: RemoteStore + ?Sized + 'static,
    P: Persistence + 'static,
{
    /// Creates an engine using the system clock.
    ///
    /// The pending log, the failed list and the cache snapshot are restored
    /// from `persistence`. Nothing runs in the background until
    /// [`start`](Self::start).
    pub fn new(config: SyncConfig, remote: Arc<R>, persistence: Arc<P>) -> Self {
        Self::with_clock(config, remote, persistence, Arc::new(SystemClock))
    }

    /// Creates an engine with an explicit clock.
    pub fn with_clock(
        config: SyncConfig,
        remote: Arc<R>,
        persistence: Arc<P>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let network = if config.initially_online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        let core = Core::open(config, persistence, clock);

        Self {
            inner: Arc::new(EngineInner {
                core,
                remote,
                replicator: Replicator::new(),
                scheduler: Scheduler::new(),
                dispatcher: Dispatcher::new(),
                listeners: ListenerRegistry::new(),
                network: ConnectivityMonitor::new("network", network),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.core.config
    }

    /// Starts the periodic timer and the configured subscriptions.
    ///
    /// Must be called from within a Tokio runtime. Actions restored from
    /// persistence are sent right away when online.
    pub fn start(&self) -> SyncResult<()> {
        let handle = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        {
            let mut runtime = self.inner.runtime.lock();
            if runtime.is_some() {
                return Err(SyncError::AlreadyStarted);
            }
            let shutdown = CancellationToken::new();
            let timer = handle.spawn(Arc::clone(&self.inner).run_timer(shutdown.child_token()));
            *runtime = Some(Runtime {
                handle,
                shutdown,
                timer,
            });
        }

        let mut tables = self.inner.core.config.watched_tables.clone();
        tables.extend(self.inner.dispatcher.desired());
        tables.sort();
        tables.dedup();
        for table in &tables {
            self.inner.watch(table)?;
        }
        self.inner.request_pass(PassTrigger::Startup);

        info!(
            namespace = %self.inner.core.config.namespace,
            tables = tables.len(),
            network = %self.inner.network.current(),
            "sync engine started"
        );
        Ok(())
    }

    /// Stops background work and persists the state.
    ///
    /// Cancels the timer and any reconnect backoff, closes every
    /// subscription, waits for an in-flight pass to stop and writes the log,
    /// the failed list and the cache. The log is left intact for the next
    /// instance.
    pub async fn stop(&self) -> SyncResult<()> {
        let runtime = self.inner.runtime.lock().take();
        let Some(runtime) = runtime else {
            return Err(SyncError::NotStarted);
        };

        runtime.shutdown.cancel();
        if let Err(e) = runtime.timer.await {
            if e.is_panic() {
                error!("sync timer panicked");
            }
        }
        self.inner.close_subscriptions().await;
        self.inner.replicator.wait().await;
        self.inner.scheduler.wait_settled().await;
        self.inner.core.persist_all();

        info!(namespace = %self.inner.core.config.namespace, "sync engine stopped");
        Ok(())
    }

    /// Returns true between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.inner.runtime.lock().is_some()
    }

    /// Queues a local mutation and applies it to the cache.
    ///
    /// Returns once the action is in the persisted log; never waits on the
    /// network. A `Create` payload without an `id` field receives a
    /// generated one. When started and online, a sync pass is requested.
    ///
    /// # Errors
    ///
    /// [`SyncError::MissingRecordId`] for an `Update` or `Delete` payload
    /// without an id, [`SyncError::InvalidTable`] for an empty or wildcard
    /// table name.
    pub fn enqueue(&self, kind: ActionKind, table: &str, payload: Record) -> SyncResult<ActionId> {
        let id = Replicator::enqueue(&self.inner.core, kind, table, payload)?;
        self.inner.request_pass(PassTrigger::Enqueue);
        Ok(id)
    }

    /// Returns the cached record, if known.
    pub fn get_local_record(&self, table: &str, id: &str) -> Option<Record> {
        self.inner
            .core
            .lock()
            .cache
            .get(table, id)
            .map(|entry| entry.record.clone())
    }

    /// Returns the cached entry with its provenance.
    pub fn get_local_entry(&self, table: &str, id: &str) -> Option<CacheEntry> {
        self.inner.core.lock().cache.get(table, id).cloned()
    }

    /// Returns every cached record of a table, ordered by id.
    pub fn get_local_table(&self, table: &str) -> Vec<Record> {
        self.inner
            .core
            .lock()
            .cache
            .table(table)
            .into_iter()
            .map(|(_, entry)| entry.record.clone())
            .collect()
    }

    /// Registers a change listener for `table`, or every table with
    /// [`WILDCARD`](crate::WILDCARD).
    pub fn subscribe<F>(&self, table: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&SyncEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(table, callback)
    }

    /// Removes a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: ListenerHandle) -> bool {
        self.inner.listeners.unsubscribe(handle)
    }

    /// Returns a snapshot of the engine's state.
    pub fn status(&self) -> EngineStatus {
        let (pending_count, failed_count, stats) = {
            let state = self.inner.core.lock();
            (state.log.len(), state.failed.len(), state.stats_snapshot())
        };
        let network = self.inner.network.current();

        EngineStatus {
            is_online: network.is_online(),
            network,
            realtime: self.inner.dispatcher.realtime.current(),
            scheduler: self.inner.scheduler.state(),
            pending_count,
            failed_count,
            watched_tables: stats.watched_tables.into_iter().collect(),
            subscriptions: self.inner.dispatcher.statuses(),
            last_sync: stats.last_sync,
            running: self.is_running(),
            unreadable_state: self.inner.core.unreadable().to_vec(),
        }
    }

    /// Returns the statistics.
    pub fn stats(&self) -> SyncStats {
        self.inner.core.lock().stats_snapshot()
    }

    /// Runs a sync pass now.
    ///
    /// Returns [`SyncOutcome::Offline`] while the network is down and
    /// [`SyncOutcome::Busy`] if a pass is already running.
    pub async fn force_sync(&self) -> SyncOutcome {
        let token = self.pass_token();
        self.inner.run_pass(PassTrigger::ForceSync, &token).await
    }

    /// Drains the log now, whatever the network state.
    ///
    /// Returns [`SyncOutcome::Busy`] if a pass is already running.
    pub async fn drain(&self) -> SyncOutcome {
        let token = self.pass_token();
        self.inner.run_pass(PassTrigger::Drain, &token).await
    }

    /// Waits until no sync pass is running or queued.
    pub async fn wait_idle(&self) {
        self.inner.scheduler.wait_settled().await;
    }

    fn pass_token(&self) -> CancellationToken {
        self.inner
            .runtime_handle()
            .map(|(_, token)| token)
            .unwrap_or_default()
    }

    /// Closes and re-opens every table subscription with a fresh attempt
    /// budget.
    pub async fn force_reconnect(&self) -> SyncResult<()> {
        self.inner.reconnect_all().await
    }

    /// Closes every subscription without forgetting the watched tables.
    pub async fn disconnect(&self) {
        self.inner.close_subscriptions().await;
        info!("realtime disconnected");
    }

    /// Subscribes to changes of `table`.
    pub fn watch_table(&self, table: &str) -> SyncResult<()> {
        self.inner.watch(table)
    }

    /// Stops watching `table`. Returns false if it was not watched.
    pub async fn unwatch_table(&self, table: &str) -> bool {
        self.inner.unwatch(table).await
    }

    /// Reports the OS network state.
    ///
    /// Returns the transition if the state changed. Coming online requests a
    /// sync pass; going offline suspends the periodic timer.
    pub fn set_network_online(&self, online: bool) -> Option<Transition> {
        let state = if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        let transition = self.inner.network.set(state)?;
        info!(from = %transition.from, to = %transition.to, "network state changed");
        if transition.came_online() {
            self.inner.request_pass(PassTrigger::NetworkRestored);
        }
        Some(transition)
    }

    /// Returns a receiver of network transitions.
    pub fn network_transitions(&self) -> broadcast::Receiver<Transition> {
        self.inner.network.transitions()
    }

    /// Returns a receiver of realtime transitions.
    pub fn realtime_transitions(&self) -> broadcast::Receiver<Transition> {
        self.inner.dispatcher.realtime.transitions()
    }

    /// Loads a snapshot of a table as confirmed entries.
    ///
    /// Entries with unacknowledged local changes are kept. Returns the
    /// number of records loaded.
    pub fn seed_table(&self, table: &str, records: Vec<Record>) -> SyncResult<usize> {
        validate_table(table)?;
        let now = self.inner.core.now();
        let mut state = self.inner.core.lock();
        let loaded = state.cache.seed(table, records, now);
        state.cache_dirty = true;
        self.inner.core.persist_cache(&mut state);
        debug!(table, loaded, "table seeded");
        Ok(loaded)
    }

    /// Injects a change notification as if it came from a subscription.
    pub fn apply_remote_change(&self, table: &str, change: RemoteChange) -> SyncResult<()> {
        validate_table(table)?;
        self.inner.deliver(table, change);
        Ok(())
    }

    /// Returns the queued actions, oldest first.
    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.inner.core.lock().log.iter().cloned().collect()
    }

    /// Returns the actions that exhausted their attempts.
    pub fn failed_actions(&self) -> Vec<FailedAction> {
        self.inner.core.lock().failed.clone()
    }

    /// Removes and returns the failed actions.
    ///
    /// Optimistic cache entries left by these actions are dropped unless
    /// another pending action still targets the same record.
    pub fn take_failed_actions(&self) -> Vec<FailedAction> {
        let mut state = self.inner.core.lock();
        let failed = std::mem::take(&mut state.failed);
        self.inner.core.persist_failed(&state);

        let state = &mut *state;
        let mut dropped = 0usize;
        for f in &failed {
            let key = f.action.key();
            if !state.log.has_other_for(&key, &f.action.id) && state.cache.discard_optimistic(&key) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            state.cache_dirty = true;
            self.inner.core.persist_cache(state);
            debug!(dropped, "discarded optimistic entries of failed actions");
        }
        failed
    }

    /// Moves a failed action back into the log with a fresh attempt budget.
    ///
    /// The action keeps its id and is re-applied to the cache.
    pub fn retry_failed(&self, action_id: ActionId) -> SyncResult<ActionId> {
        {
            let now = self.inner.core.now();
            let mut state = self.inner.core.lock();
            let index = state
                .failed
                .iter()
                .position(|f| f.action.id == action_id)
                .ok_or(SyncError::UnknownAction(action_id))?;

            let mut action = state.failed.remove(index).action;
            action.attempts = 0;
            action.last_error = None;
            state
                .cache
                .apply_local(action.kind, &action.table, &action.record_id, &action.payload, now);
            state.cache_dirty = true;
            state.log.append(action);
            self.inner.core.persist_log(&state);
            self.inner.core.persist_failed(&state);
        }

        debug!(action = %action_id, "failed action re-queued");
        self.inner.request_pass(PassTrigger::Retry);
        Ok(action_id)
    }

    /// Drops every confirmed cache entry. Entries with unacknowledged local
    /// changes are kept. Returns the number of removed entries.
    pub fn clear_cache(&self) -> usize {
        let mut state = self.inner.core.lock();
        let removed: usize = state
            .cache
            .table_names()
            .iter()
            .map(|table| state.cache.clear_confirmed(table))
            .sum();
        state.cache_dirty = true;
        self.inner.core.persist_cache(&mut state);
        debug!(removed, "cache cleared");
        removed
    }
}

impl<R: ?Sized, P> Drop for SyncEngine<R, P> {
    fn drop(&mut self) {
        if let Some(runtime) = self.inner.runtime.lock().take() {
            runtime.shutdown.cancel();
        }
    }
}
