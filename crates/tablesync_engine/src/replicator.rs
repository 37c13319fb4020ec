//! Outbound replication of the pending action log.
//!
//! [`Replicator::enqueue`] records a local mutation: it is applied to the
//! cache optimistically, appended to the log and persisted before the call
//! returns. [`Replicator::drain`] replays the log against the remote in FIFO
//! order.
//!
//! ## Drain rules
//!
//! - The log is snapshotted when the pass starts; actions enqueued during
//!   the pass wait for the next one.
//! - An acknowledged action is removed from the persisted log before the
//!   next action is attempted, so a crash replays at most one action.
//! - Once an action for a record fails, later actions for the same record
//!   are deferred until the next pass. Per-record order is never violated.
//! - An action that reaches `max_attempts` failures is moved to the failed
//!   list and never attempted again unless re-queued.
//! - Only one drain runs at a time; a concurrent caller gets
//!   [`SyncOutcome::Busy`] immediately.

use crate::config::RetryPolicy;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::remote::RemoteStore;
use crate::state::Core;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tablesync_protocol::{
    record_id, ActionId, ActionKind, FailedAction, PendingAction, Record, RecordKey, ID_FIELD,
};
use tablesync_storage::Persistence;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A failed remote write within a drain pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionFailure {
    /// The failed action.
    pub action_id: ActionId,
    /// Its mutation type.
    pub kind: ActionKind,
    /// The record it targets.
    pub key: RecordKey,
    /// Failed attempts including this one.
    pub attempts: u32,
    /// The remote error.
    pub error: RemoteError,
    /// True if the action was moved to the failed list.
    pub evicted: bool,
}

/// Per-action outcomes of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Acknowledged actions, in the order they were sent.
    pub synced: Vec<ActionId>,
    /// Failed attempts, in the order they were made.
    pub failures: Vec<ActionFailure>,
    /// Actions skipped because an earlier action for their record failed.
    pub deferred: Vec<ActionId>,
    /// Actions moved to the failed list during this pass.
    pub evicted: Vec<ActionId>,
    /// True if the pass stopped early because of shutdown.
    pub interrupted: bool,
    /// Wall time of the pass.
    pub duration: Duration,
}

impl DrainReport {
    /// Returns true if every attempted action was acknowledged.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.deferred.is_empty() && !self.interrupted
    }

    /// Returns the number of actions attempted.
    pub fn attempted(&self) -> usize {
        self.synced.len() + self.failures.len()
    }
}

/// Result of a sync request.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// A drain pass ran.
    Completed(DrainReport),
    /// Another pass was already running; nothing was done.
    Busy,
    /// The network is offline; nothing was attempted.
    Offline,
}

impl SyncOutcome {
    /// Returns the drain report if a pass ran.
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }

    /// Returns true if the request was rejected because a pass was running.
    pub fn is_busy(&self) -> bool {
        matches!(self, SyncOutcome::Busy)
    }
}

/// Single-flight executor of drain passes.
#[derive(Debug, Default)]
pub(crate) struct Replicator {
    drain_lock: tokio::sync::Mutex<()>,
}

impl Replicator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a local mutation and returns its action id.
    ///
    /// A `Create` payload without an id receives a generated UUID.
    pub(crate) fn enqueue<P: Persistence>(
        core: &Core<P>,
        kind: ActionKind,
        table: &str,
        mut payload: Record,
    ) -> SyncResult<ActionId> {
        validate_table(table)?;

        let id = match (record_id(&payload), kind) {
            (Some(id), _) => id,
            (None, ActionKind::Create) => {
                let id = Uuid::new_v4().to_string();
                payload.insert(ID_FIELD.to_string(), id.clone().into());
                id
            }
            (None, kind) => {
                return Err(SyncError::MissingRecordId {
                    table: table.to_string(),
                    kind,
                })
            }
        };

        let now = core.now();
        let action = PendingAction::new(kind, table, id.as_str(), payload, now);

        let mut state = core.lock();
        state.cache.apply_local(kind, table, &id, &action.payload, now);
        state.cache_dirty = true;
        let action_id = state.log.append(action);
        core.persist_log(&state);

        debug!(action = %action_id, %kind, table, id = %id, pending = state.log.len(), "enqueued");
        Ok(action_id)
    }

    /// Waits for a running drain to finish.
    pub(crate) async fn wait(&self) {
        let _guard = self.drain_lock.lock().await;
    }

    /// Runs one drain pass unless another is in flight.
    ///
    /// Cancelling `token` stops the pass before the next action; an
    /// in-flight remote call is abandoned and its action stays queued.
    pub(crate) async fn drain<R, P>(
        &self,
        core: &Core<P>,
        remote: &R,
        token: &CancellationToken,
    ) -> SyncOutcome
    where
        R: RemoteStore + ?Sized,
        P: Persistence,
    {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("drain already in flight");
            return SyncOutcome::Busy;
        };

        let started = Instant::now();
        let max_attempts = core.config.max_attempts;
        let policy = core.config.retry_policy;
        let ids = core.lock().log.ids();
        let mut blocked: HashSet<RecordKey> = HashSet::new();
        let mut report = DrainReport::default();

        for action_id in ids {
            if token.is_cancelled() {
                report.interrupted = true;
                break;
            }

            let Some(action) = core.lock().log.get(&action_id).cloned() else {
                continue;
            };
            let key = action.key();
            if blocked.contains(&key) {
                debug!(action = %action_id, %key, "deferred behind failed action");
                report.deferred.push(action_id);
                continue;
            }

            let result = tokio::select! {
                biased;
                () = token.cancelled() => {
                    report.interrupted = true;
                    break;
                }
                result = send(remote, &action) => result,
            };

            match result {
                Ok(()) => {
                    let mut state = core.lock();
                    state.log.remove(&action_id);
                    core.persist_log(&state);
                    if !state.log.has_other_for(&key, &action_id) && state.cache.confirm(&key) {
                        state.cache_dirty = true;
                    }
                    state.stats.actions_synced += 1;
                    state.stats.last_sync = Some(core.now());
                    debug!(action = %action_id, kind = %action.kind, %key, "acknowledged");
                    report.synced.push(action_id);
                }
                Err(error) => {
                    blocked.insert(key.clone());
                    let mut state = core.lock();
                    state.stats.total_errors += 1;
                    let Some(pending) = state.log.get_mut(&action_id) else {
                        continue;
                    };
                    let attempts = pending.record_failure(error.to_string());
                    let evict = pending.is_exhausted(max_attempts)
                        || (policy == RetryPolicy::SkipNonRetryable && !error.is_retryable());

                    if evict {
                        if let Some(action) = state.log.remove(&action_id) {
                            let failed_at = core.now();
                            state.failed.push(FailedAction { action, failed_at });
                            state.stats.actions_failed += 1;
                            core.persist_failed(&state);
                        }
                        warn!(
                            action = %action_id,
                            kind = %action.kind,
                            %key,
                            attempts,
                            error = %error,
                            "action permanently failed"
                        );
                        report.evicted.push(action_id);
                    } else {
                        warn!(
                            action = %action_id,
                            kind = %action.kind,
                            %key,
                            attempts,
                            max_attempts,
                            error = %error,
                            "action failed, will retry"
                        );
                    }
                    core.persist_log(&state);

                    report.failures.push(ActionFailure {
                        action_id,
                        kind: action.kind,
                        key,
                        attempts,
                        error,
                        evicted: evict,
                    });
                }
            }
        }

        report.duration = started.elapsed();
        if report.attempted() > 0 || report.interrupted {
            info!(
                synced = report.synced.len(),
                failed = report.failures.len(),
                deferred = report.deferred.len(),
                evicted = report.evicted.len(),
                interrupted = report.interrupted,
                "drain finished"
            );
        }
        SyncOutcome::Completed(report)
    }
}

async fn send<R: RemoteStore + ?Sized>(
    remote: &R,
    action: &PendingAction,
) -> Result<(), RemoteError> {
    match action.kind {
        ActionKind::Create => remote.insert(&action.table, &action.payload).await,
        ActionKind::Update => {
            remote
                .update(&action.table, &action.record_id, &action.payload)
                .await
        }
        ActionKind::Delete => remote.delete(&action.table, &action.record_id).await,
    }
}

pub(crate) fn validate_table(table: &str) -> SyncResult<()> {
    if table.is_empty() || table == crate::listeners::WILDCARD {
        return Err(SyncError::InvalidTable(table.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntrySource;
    use crate::clock::ManualClock;
    use crate::config::SyncConfig;
    use crate::remote::{MockRemote, RemoteCall};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tablesync_storage::InMemoryPersistence;

    fn rec(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn core_with(config: SyncConfig) -> Core<InMemoryPersistence> {
        Core::open(
            config,
            Arc::new(InMemoryPersistence::new()),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    fn core() -> Core<InMemoryPersistence> {
        core_with(SyncConfig::new("test"))
    }

    async fn drain(replicator: &Replicator, core: &Core<InMemoryPersistence>, remote: &MockRemote) -> DrainReport {
        match replicator
            .drain(core, remote, &CancellationToken::new())
            .await
        {
            SyncOutcome::Completed(report) => report,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn create_without_id_gets_one() {
        let core = core();
        Replicator::enqueue(&core, ActionKind::Create, "devices", rec(json!({"name": "x"}))).unwrap();

        let state = core.lock();
        let action = state.log.front().unwrap();
        assert!(Uuid::parse_str(&action.record_id).is_ok());
        assert_eq!(
            action.payload.get("id"),
            Some(&Value::String(action.record_id.clone()))
        );
        assert!(state.cache.peek("devices", &action.record_id).unwrap().is_optimistic());
    }

    #[test]
    fn update_and_delete_need_an_id() {
        let core = core();
        for kind in [ActionKind::Update, ActionKind::Delete] {
            let err = Replicator::enqueue(&core, kind, "devices", rec(json!({"x": 1}))).unwrap_err();
            assert!(matches!(err, SyncError::MissingRecordId { .. }));
        }
        assert!(matches!(
            Replicator::enqueue(&core, ActionKind::Create, "*", Record::new()),
            Err(SyncError::InvalidTable(_))
        ));
        assert!(core.lock().log.is_empty());
    }

    #[tokio::test]
    async fn drain_sends_in_order_and_confirms() {
        let core = core();
        let remote = MockRemote::new();
        let replicator = Replicator::new();

        Replicator::enqueue(&core, ActionKind::Create, "devices", rec(json!({"id": "d1", "status": "new"}))).unwrap();
        Replicator::enqueue(&core, ActionKind::Update, "devices", rec(json!({"id": "d1", "status": "ok"}))).unwrap();
        Replicator::enqueue(&core, ActionKind::Delete, "devices", rec(json!({"id": "d2"}))).unwrap();

        let report = drain(&replicator, &core, &remote).await;
        assert_eq!(report.synced.len(), 3);
        assert!(report.is_clean());

        let calls = remote.calls();
        assert!(matches!(calls[0], RemoteCall::Insert { .. }));
        assert!(matches!(calls[1], RemoteCall::Update { .. }));
        assert_eq!(
            calls[2],
            RemoteCall::Delete {
                table: "devices".into(),
                id: "d2".into()
            }
        );

        let state = core.lock();
        assert!(state.log.is_empty());
        let entry = state.cache.peek("devices", "d1").unwrap();
        assert_eq!(entry.source, EntrySource::Confirmed);
        assert_eq!(entry.record.get("status"), Some(&json!("ok")));
        assert_eq!(state.stats.actions_synced, 3);
    }

    #[tokio::test]
    async fn failure_defers_same_record_only() {
        let core = core();
        let remote = MockRemote::new();
        let replicator = Replicator::new();
        remote.fail_key(RecordKey::new("devices", "d1"), RemoteError::Timeout);

        let first = Replicator::enqueue(&core, ActionKind::Create, "devices", rec(json!({"id": "d1"}))).unwrap();
        let second = Replicator::enqueue(&core, ActionKind::Update, "devices", rec(json!({"id": "d1", "v": 2}))).unwrap();
        let other = Replicator::enqueue(&core, ActionKind::Create, "devices", rec(json!({"id": "d2"}))).unwrap();

        let report = drain(&replicator, &core, &remote).await;
        assert_eq!(report.synced, vec![other]);
        assert_eq!(report.deferred, vec![second]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].action_id, first);
        assert_eq!(report.failures[0].attempts, 1);
        assert!(!report.failures[0].evicted);

        let state = core.lock();
        assert_eq!(state.log.ids(), vec![first, second]);
        assert_eq!(state.log.front().unwrap().last_error.as_deref(), Some("request timed out"));
        // Only the failing action was sent for d1.
        assert_eq!(remote.call_count(), 2);
    }

    #[tokio::test]
    async fn evicts_after_max_attempts() {
        let core = core();
        let remote = MockRemote::new();
        let replicator = Replicator::new();
        remote.fail_all(Some(RemoteError::server(500, "boom")));

        let id = Replicator::enqueue(&core, ActionKind::Create, "devices", rec(json!({"id": "d1"}))).unwrap();

        for attempt in 1..=3 {
            let report = drain(&replicator, &core, &remote).await;
            assert_eq!(report.failures[0].attempts, attempt);
            assert_eq!(report.failures[0].evicted, attempt == 3);
        }

        let report = drain(&replicator, &core, &remote).await;
        assert_eq!(report.attempted(), 0);
        assert_eq!(remote.call_count(), 3);

        let state = core.lock();
        assert!(state.log.is_empty());
        assert_eq!(state.failed.len(), 1);
        assert_eq!(state.failed[0].action.id, id);
        assert_eq!(state.failed[0].action.attempts, 3);
        assert_eq!(state.stats.actions_failed, 1);
        assert_eq!(state.stats.total_errors, 3);
    }

    #[tokio::test]
    async fn skip_non_retryable_evicts_immediately() {
        let core = core_with(SyncConfig::new("test").with_retry_policy(RetryPolicy::SkipNonRetryable));
        let remote = MockRemote::new();
        let replicator = Replicator::new();

        remote.fail_next(RemoteError::Timeout);
        Replicator::enqueue(&core, ActionKind::Create, "devices", rec(json!({"id": "d1"}))).unwrap();
        let report = drain(&replicator, &core, &remote).await;
        assert!(report.evicted.is_empty());

        remote.fail_next(RemoteError::Rejected("bad field".into()));
        let report = drain(&replicator, &core, &remote).await;
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.failures[0].attempts, 2);
    }

    #[tokio::test]
    async fn concurrent_drain_is_busy() {
        let core = core();
        let remote = MockRemote::new();
        let replicator = Replicator::new();

        let _held = replicator.drain_lock.try_lock().unwrap();
        let outcome = replicator
            .drain(&core, &remote, &CancellationToken::new())
            .await;
        assert!(outcome.is_busy());
    }

    #[tokio::test]
    async fn cancelled_drain_leaves_log() {
        let core = core();
        let remote = MockRemote::new();
        let replicator = Replicator::new();
        Replicator::enqueue(&core, ActionKind::Create, "devices", rec(json!({"id": "d1"}))).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let outcome = replicator.drain(&core, &remote, &token).await;
        assert!(outcome.report().unwrap().interrupted);
        assert_eq!(remote.call_count(), 0);
        assert_eq!(core.lock().log.len(), 1);
    }
}
