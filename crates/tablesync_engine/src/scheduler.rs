//! Sync scheduling.
//!
//! The scheduler decides when the replicator drains. A pass runs when:
//!
//! - the periodic timer fires while the network is online and the log is
//!   non-empty;
//! - a mutation is enqueued while online;
//! - the network comes back online;
//! - the application calls `force_sync` or `drain`.
//!
//! Only one pass runs at a time. Requests from enqueue or reconnect that
//! arrive during a pass are coalesced into a single trailing pass; direct
//! requests get [`SyncOutcome::Busy`].

use crate::engine::EngineInner;
use crate::remote::RemoteStore;
use crate::replicator::SyncOutcome;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tablesync_storage::Persistence;
use tokio::sync::Notify;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Activity of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No pass is running.
    Idle,
    /// A pass is running.
    Running,
}

/// What started a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassTrigger {
    Timer,
    Enqueue,
    NetworkRestored,
    Startup,
    Retry,
    Trailing,
    ForceSync,
    Drain,
}

impl PassTrigger {
    fn needs_network(self) -> bool {
        !matches!(self, PassTrigger::Drain)
    }
}

impl fmt::Display for PassTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PassTrigger::Timer => "timer",
            PassTrigger::Enqueue => "enqueue",
            PassTrigger::NetworkRestored => "network-restored",
            PassTrigger::Startup => "startup",
            PassTrigger::Retry => "retry",
            PassTrigger::Trailing => "trailing",
            PassTrigger::ForceSync => "force-sync",
            PassTrigger::Drain => "drain",
        };
        f.write_str(s)
    }
}

/// Run state shared by every pass.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    running: AtomicBool,
    rerun: AtomicBool,
    queued: AtomicUsize,
    settled: Notify,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(self))
    }

    fn is_settled(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
            && !self.rerun.load(Ordering::SeqCst)
            && self.queued.load(Ordering::SeqCst) == 0
    }

    /// Waits until no pass is running or queued.
    pub(crate) async fn wait_settled(&self) {
        loop {
            let notified = self.settled.notified();
            if self.is_settled() {
                return;
            }
            notified.await;
        }
    }
}

/// Marks the scheduler running until dropped.
struct RunGuard<'a>(&'a Scheduler);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
        self.0.settled.notify_waiters();
    }
}

/// Counts a spawned pass until dropped.
struct QueuedGuard<'a>(&'a Scheduler);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
        self.0.settled.notify_waiters();
    }
}

impl<R, P> EngineInner<R, P>
where
    R: RemoteStore + ?Sized + 'static,
    P: Persistence + 'static,
{
    /// Runs one pass now.
    ///
    /// Returns `Offline` without touching the log when the trigger needs the
    /// network and it is down, and `Busy` when another pass holds the
    /// scheduler.
    pub(crate) async fn run_pass(
        self: &Arc<Self>,
        trigger: PassTrigger,
        token: &CancellationToken,
    ) -> SyncOutcome {
        if trigger.needs_network() && !self.network.current().is_online() {
            debug!(%trigger, "skipping pass while offline");
            return SyncOutcome::Offline;
        }
        let Some(guard) = self.scheduler.try_begin() else {
            debug!(%trigger, "pass already running");
            return SyncOutcome::Busy;
        };

        debug!(%trigger, "pass started");
        let outcome = self
            .replicator
            .drain(&self.core, self.remote.as_ref(), token)
            .await;

        {
            let mut state = self.core.lock();
            if let SyncOutcome::Completed(report) = &outcome {
                state.stats.passes_completed += 1;
                if report.is_clean() {
                    state.stats.last_sync = Some(self.core.now());
                }
            }
            self.core.persist_cache(&mut state);
        }

        drop(guard);
        if self.scheduler.rerun.load(Ordering::SeqCst) {
            self.spawn_pass(PassTrigger::Trailing);
        }
        outcome
    }

    /// Asks for a background pass.
    ///
    /// Does nothing while stopped or offline. While a pass is running the
    /// request is folded into one trailing pass.
    pub(crate) fn request_pass(self: &Arc<Self>, trigger: PassTrigger) {
        if !self.network.current().is_online() || self.runtime_handle().is_none() {
            return;
        }
        self.scheduler.rerun.store(true, Ordering::SeqCst);
        if self.scheduler.state() == SchedulerState::Running {
            trace!(%trigger, "pass request coalesced");
            return;
        }
        self.spawn_pass(trigger);
    }

    fn spawn_pass(self: &Arc<Self>, trigger: PassTrigger) {
        let Some((handle, token)) = self.runtime_handle() else {
            self.scheduler.rerun.store(false, Ordering::SeqCst);
            self.scheduler.settled.notify_waiters();
            return;
        };

        self.scheduler.queued.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(self);
        handle.spawn(async move {
            let _queued = QueuedGuard(&inner.scheduler);
            if !inner.scheduler.rerun.swap(false, Ordering::SeqCst) || token.is_cancelled() {
                return;
            }
            if inner.core.lock().log.is_empty() {
                return;
            }
            if inner.run_pass(trigger, &token).await.is_busy() {
                inner.request_pass(PassTrigger::Trailing);
            }
        });
    }

    /// Periodic timer. Suspended while the network is not online.
    pub(crate) async fn run_timer(self: Arc<Self>, token: CancellationToken) {
        let period = self.core.config.sync_interval;
        let mut network = self.network.watch();
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !network.borrow_and_update().is_online() {
                debug!("sync timer suspended");
                tokio::select! {
                    () = token.cancelled() => break,
                    changed = network.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        interval.reset();
                        continue;
                    }
                }
            }

            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => self.on_tick(&token).await,
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("sync timer stopped");
    }

    async fn on_tick(self: &Arc<Self>, token: &CancellationToken) {
        let pending = !self.core.lock().log.is_empty();
        if pending {
            self.run_pass(PassTrigger::Timer, token).await;
            return;
        }

        let mut state = self.core.lock();
        if state.cache_dirty {
            self.core.persist_cache(&mut state);
        }
    }
}
