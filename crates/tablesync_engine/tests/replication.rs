//! Integration tests for outbound replication.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tablesync_engine::{
    ActionKind, EntrySource, ManualClock, MockRemote, Record, RecordKey, RemoteCall, RemoteError,
    SyncConfig, SyncEngine, SyncError, SyncOutcome,
};
use tablesync_storage::{DirPersistence, InMemoryPersistence, Persistence};

type TestEngine = SyncEngine<MockRemote, InMemoryPersistence>;

fn rec(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn engine_with(
    config: SyncConfig,
    remote: &Arc<MockRemote>,
    persistence: &Arc<InMemoryPersistence>,
) -> TestEngine {
    SyncEngine::with_clock(
        config,
        Arc::clone(remote),
        Arc::clone(persistence),
        Arc::new(ManualClock::new(1_000)),
    )
}

fn engine(remote: &Arc<MockRemote>) -> TestEngine {
    engine_with(
        SyncConfig::new("test"),
        remote,
        &Arc::new(InMemoryPersistence::new()),
    )
}

fn completed(outcome: SyncOutcome) -> tablesync_engine::DrainReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed pass, got {other:?}"),
    }
}

#[tokio::test]
async fn optimistic_update_converges_to_confirmed() {
    let remote = Arc::new(MockRemote::new());
    let engine = engine(&remote);

    engine
        .seed_table("devices", vec![rec(json!({"id": "d1", "status": "online", "site": "s1"}))])
        .unwrap();

    // Local change is visible immediately
    engine
        .enqueue(ActionKind::Update, "devices", rec(json!({"id": "d1", "status": "offline"})))
        .unwrap();
    let entry = engine.get_local_entry("devices", "d1").unwrap();
    assert_eq!(entry.source, EntrySource::Optimistic);
    assert_eq!(entry.record["status"], json!("offline"));
    assert_eq!(entry.record["site"], json!("s1"));

    let report = completed(engine.drain().await);
    assert_eq!(report.synced.len(), 1);

    let entry = engine.get_local_entry("devices", "d1").unwrap();
    assert_eq!(entry.source, EntrySource::Confirmed);
    assert_eq!(
        engine.get_local_record("devices", "d1").unwrap()["status"],
        json!("offline")
    );

    // The payload goes to the remote as given
    assert_eq!(
        remote.calls(),
        vec![RemoteCall::Update {
            table: "devices".into(),
            id: "d1".into(),
            record: rec(json!({"id": "d1", "status": "offline"})),
        }]
    );
}

#[tokio::test]
async fn entry_stays_optimistic_while_later_action_pending() {
    let remote = Arc::new(MockRemote::new());
    let engine = engine(&remote);

    engine
        .enqueue(ActionKind::Create, "devices", rec(json!({"id": "d1", "v": 1})))
        .unwrap();
    engine
        .enqueue(ActionKind::Update, "devices", rec(json!({"id": "d1", "v": 2})))
        .unwrap();
    remote.fail_key(RecordKey::new("devices", "d1"), RemoteError::Timeout);
    remote.fail_next(RemoteError::Timeout);

    // First action fails, second is deferred
    let report = completed(engine.drain().await);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.deferred.len(), 1);
    assert!(engine.get_local_entry("devices", "d1").unwrap().is_optimistic());

    remote.clear_failures();
    let report = completed(engine.drain().await);
    assert_eq!(report.synced.len(), 2);
    assert!(!engine.get_local_entry("devices", "d1").unwrap().is_optimistic());
    assert_eq!(engine.get_local_record("devices", "d1").unwrap()["v"], json!(2));
}

#[tokio::test(start_paused = true)]
async fn concurrent_force_sync_drains_once() {
    let remote = Arc::new(MockRemote::new());
    remote.set_call_delay(Some(Duration::from_millis(50)));
    let engine = engine(&remote);

    engine
        .enqueue(ActionKind::Create, "devices", rec(json!({"id": "d1"})))
        .unwrap();

    let (first, second) = tokio::join!(engine.force_sync(), engine.force_sync());

    assert_eq!(completed(first).synced.len(), 1);
    assert_eq!(second, SyncOutcome::Busy);
    assert_eq!(remote.call_count(), 1);
    assert_eq!(engine.status().pending_count, 0);
}

#[tokio::test]
async fn evicts_after_third_failure() {
    let remote = Arc::new(MockRemote::new());
    let engine = engine(&remote);
    remote.fail_all(Some(RemoteError::server(503, "unavailable")));

    let id = engine
        .enqueue(ActionKind::Create, "devices", rec(json!({"id": "d1"})))
        .unwrap();

    for _ in 0..3 {
        completed(engine.force_sync().await);
    }
    assert_eq!(remote.call_count(), 3);
    assert_eq!(engine.status().pending_count, 0);
    assert_eq!(engine.status().failed_count, 1);

    // No fourth attempt
    let report = completed(engine.force_sync().await);
    assert_eq!(report.attempted(), 0);
    assert_eq!(remote.call_count(), 3);

    let failed = engine.failed_actions();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].action.id, id);
    assert_eq!(failed[0].action.attempts, 3);
    assert!(failed[0].action.last_error.as_deref().unwrap().contains("503"));

    let stats = engine.stats();
    assert_eq!(stats.actions_failed, 1);
    assert_eq!(stats.total_errors, 3);
}

#[tokio::test]
async fn retry_failed_requeues_with_fresh_budget() {
    let remote = Arc::new(MockRemote::new());
    let engine = engine_with(
        SyncConfig::new("test").with_max_attempts(1),
        &remote,
        &Arc::new(InMemoryPersistence::new()),
    );

    remote.fail_next(RemoteError::Rejected("bad field".into()));
    let id = engine
        .enqueue(ActionKind::Create, "devices", rec(json!({"id": "d1"})))
        .unwrap();
    completed(engine.force_sync().await);
    assert_eq!(engine.failed_actions().len(), 1);

    assert_eq!(engine.retry_failed(id).unwrap(), id);
    let pending = engine.pending_actions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 0);
    assert!(engine.failed_actions().is_empty());

    let report = completed(engine.force_sync().await);
    assert_eq!(report.synced, vec![id]);

    assert!(matches!(
        engine.retry_failed(id),
        Err(SyncError::UnknownAction(unknown)) if unknown == id
    ));
}

#[tokio::test]
async fn take_failed_actions_empties_list() {
    let remote = Arc::new(MockRemote::new());
    let persistence = Arc::new(InMemoryPersistence::new());
    let config = SyncConfig::new("test").with_max_attempts(1);
    {
        let engine = engine_with(config.clone(), &remote, &persistence);
        remote.fail_next(RemoteError::Timeout);
        engine
            .enqueue(ActionKind::Delete, "devices", rec(json!({"id": "d1"})))
            .unwrap();
        completed(engine.force_sync().await);
    }

    // The failed list survives a restart
    let engine = engine_with(config.clone(), &remote, &persistence);
    assert_eq!(engine.take_failed_actions().len(), 1);
    assert!(engine.failed_actions().is_empty());

    let engine = engine_with(config, &remote, &persistence);
    assert!(engine.failed_actions().is_empty());
}

#[tokio::test]
async fn discarded_failure_does_not_pin_rejected_value() {
    let remote = Arc::new(MockRemote::new());
    let engine = engine(&remote);
    engine
        .seed_table("devices", vec![rec(json!({"id": "d1", "status": "online"}))])
        .unwrap();

    remote.fail_key(
        RecordKey::new("devices", "d1"),
        RemoteError::Rejected("bad status".into()),
    );
    engine
        .enqueue(ActionKind::Update, "devices", rec(json!({"id": "d1", "status": "bogus"})))
        .unwrap();
    for _ in 0..3 {
        completed(engine.force_sync().await);
    }
    assert_eq!(engine.failed_actions().len(), 1);

    // Still backed by the failed action, so still visible
    assert!(engine.get_local_entry("devices", "d1").unwrap().is_optimistic());

    assert_eq!(engine.take_failed_actions().len(), 1);
    assert!(engine.get_local_entry("devices", "d1").is_none());

    engine
        .seed_table("devices", vec![rec(json!({"id": "d1", "status": "online"}))])
        .unwrap();
    let entry = engine.get_local_entry("devices", "d1").unwrap();
    assert_eq!(entry.source, EntrySource::Confirmed);
    assert_eq!(entry.record["status"], json!("online"));
}

#[tokio::test]
async fn discarded_failure_keeps_entry_of_later_pending_action() {
    let remote = Arc::new(MockRemote::new());
    let engine = engine_with(
        SyncConfig::new("test").with_max_attempts(1),
        &remote,
        &Arc::new(InMemoryPersistence::new()),
    );

    remote.fail_next(RemoteError::Rejected("bad status".into()));
    engine
        .enqueue(ActionKind::Update, "devices", rec(json!({"id": "d1", "status": "bogus"})))
        .unwrap();
    completed(engine.force_sync().await);
    assert_eq!(engine.failed_actions().len(), 1);

    engine
        .enqueue(ActionKind::Update, "devices", rec(json!({"id": "d1", "status": "idle"})))
        .unwrap();

    engine.take_failed_actions();
    let entry = engine.get_local_entry("devices", "d1").unwrap();
    assert!(entry.is_optimistic());
    assert_eq!(entry.record["status"], json!("idle"));
}

#[tokio::test]
async fn unreadable_log_survives_enqueue_and_is_reported() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let original = b"bytes written by a newer engine version".to_vec();
    persistence.save("test.pending", &original).unwrap();

    let remote = Arc::new(MockRemote::new());
    let engine = engine_with(SyncConfig::new("test"), &remote, &persistence);
    engine
        .enqueue(ActionKind::Create, "devices", rec(json!({"id": "d1"})))
        .unwrap();

    assert_eq!(persistence.load("test.pending.unreadable").unwrap(), Some(original));
    let status = engine.status();
    assert_eq!(status.pending_count, 1);
    assert_eq!(status.unreadable_state.len(), 1);
    assert_eq!(status.unreadable_state[0].key, "test.pending");
    assert_eq!(
        status.unreadable_state[0].preserved_as.as_deref(),
        Some("test.pending.unreadable")
    );
}

#[tokio::test]
async fn acknowledged_actions_are_not_replayed_after_restart() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let remote = Arc::new(MockRemote::new());
    {
        let engine = engine_with(SyncConfig::new("pos"), &remote, &persistence);
        for id in ["a", "b", "c"] {
            engine
                .enqueue(ActionKind::Create, "devices", rec(json!({"id": id})))
                .unwrap();
        }
        remote.fail_key(RecordKey::new("devices", "c"), RemoteError::Timeout);

        let report = completed(engine.force_sync().await);
        assert_eq!(report.synced.len(), 2);
        // Dropped without stop, like a crash
    }

    let fresh_remote = Arc::new(MockRemote::new());
    let engine = engine_with(SyncConfig::new("pos"), &fresh_remote, &persistence);
    let pending = engine.pending_actions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].record_id, "c");
    assert_eq!(pending[0].attempts, 1);

    completed(engine.force_sync().await);
    assert_eq!(fresh_remote.call_count(), 1);
    assert_eq!(
        fresh_remote.calls()[0].key(),
        Some(RecordKey::new("devices", "c"))
    );
}

#[tokio::test]
async fn namespaces_isolate_engines() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let remote = Arc::new(MockRemote::new());

    let pos = engine_with(SyncConfig::new("pos"), &remote, &persistence);
    let admin = engine_with(SyncConfig::new("admin"), &remote, &persistence);
    pos.enqueue(ActionKind::Create, "devices", rec(json!({"id": "d1"})))
        .unwrap();

    assert_eq!(pos.status().pending_count, 1);
    assert_eq!(admin.status().pending_count, 0);
    assert!(admin.get_local_record("devices", "d1").is_none());
}

#[tokio::test]
async fn offline_create_is_sent_once_on_reconnect() {
    let remote = Arc::new(MockRemote::new());
    let engine = engine_with(
        SyncConfig::new("test").initially_online(false),
        &remote,
        &Arc::new(InMemoryPersistence::new()),
    );
    let mut transitions = engine.network_transitions();
    engine.start().unwrap();

    engine
        .enqueue(ActionKind::Create, "devices", rec(json!({"id": "d9", "status": "new"})))
        .unwrap();
    assert_eq!(engine.force_sync().await, SyncOutcome::Offline);
    engine.wait_idle().await;
    assert_eq!(remote.call_count(), 0);
    assert!(engine.get_local_entry("devices", "d9").unwrap().is_optimistic());

    let transition = engine.set_network_online(true).unwrap();
    assert!(transition.came_online());
    assert_eq!(transitions.try_recv().unwrap(), transition);
    engine.wait_idle().await;

    assert_eq!(
        remote.calls(),
        vec![RemoteCall::Insert {
            table: "devices".into(),
            record: rec(json!({"id": "d9", "status": "new"})),
        }]
    );
    assert_eq!(engine.status().pending_count, 0);
    assert!(!engine.get_local_entry("devices", "d9").unwrap().is_optimistic());

    // Repeated signal changes nothing
    assert!(engine.set_network_online(true).is_none());
    engine.wait_idle().await;
    assert_eq!(remote.call_count(), 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn enqueue_while_started_syncs_in_background() {
    let remote = Arc::new(MockRemote::new());
    let engine = engine(&remote);
    engine.start().unwrap();

    for i in 0..5 {
        engine
            .enqueue(ActionKind::Create, "devices", rec(json!({"id": format!("d{i}")})))
            .unwrap();
    }
    engine.wait_idle().await;

    assert_eq!(remote.call_count(), 5);
    let stats = engine.stats();
    assert_eq!(stats.actions_synced, 5);
    assert!(stats.passes_completed >= 1);
    assert!(stats.last_sync.is_some());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn persistence_failures_degrade_to_memory() {
    let remote = Arc::new(MockRemote::new());
    let persistence = Arc::new(InMemoryPersistence::new());
    let engine = engine_with(SyncConfig::new("test"), &remote, &persistence);
    persistence.set_fail_saves(true);

    engine
        .enqueue(ActionKind::Create, "devices", rec(json!({"id": "d1"})))
        .unwrap();
    assert!(engine.get_local_record("devices", "d1").is_some());
    assert_eq!(engine.status().pending_count, 1);

    let report = completed(engine.force_sync().await);
    assert_eq!(report.synced.len(), 1);
    assert_eq!(persistence.save_count(), 0);
}

#[tokio::test]
async fn update_without_id_is_rejected() {
    let remote = Arc::new(MockRemote::new());
    let engine = engine(&remote);

    let err = engine
        .enqueue(ActionKind::Update, "devices", rec(json!({"status": "x"})))
        .unwrap_err();
    assert!(matches!(err, SyncError::MissingRecordId { kind: ActionKind::Update, .. }));

    let id = engine
        .enqueue(ActionKind::Create, "devices", rec(json!({"status": "x"})))
        .unwrap();
    let pending = engine.pending_actions();
    assert_eq!(pending[0].id, id);
    assert!(engine.get_local_record("devices", &pending[0].record_id).is_some());
}

#[tokio::test]
async fn state_survives_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemote::new());
    let config = SyncConfig::new("pos").initially_online(false);

    {
        let persistence = Arc::new(DirPersistence::open(dir.path()).unwrap());
        let engine = SyncEngine::new(config.clone(), Arc::clone(&remote), persistence);
        engine.start().unwrap();
        engine
            .seed_table("sites", vec![rec(json!({"id": "s1", "name": "Depot"}))])
            .unwrap();
        engine
            .enqueue(ActionKind::Create, "devices", rec(json!({"id": "d1"})))
            .unwrap();
        engine.stop().await.unwrap();
    }

    let persistence = Arc::new(DirPersistence::open(dir.path()).unwrap());
    let engine = SyncEngine::new(config, Arc::clone(&remote), persistence);
    assert_eq!(engine.status().pending_count, 1);
    assert!(engine.get_local_entry("devices", "d1").unwrap().is_optimistic());
    assert_eq!(engine.get_local_table("sites").len(), 1);
    assert_eq!(remote.call_count(), 0);
}

#[tokio::test]
async fn clear_cache_keeps_optimistic_entries() {
    let remote = Arc::new(MockRemote::new());
    let engine = engine(&remote);

    engine
        .seed_table("devices", vec![rec(json!({"id": "d1"})), rec(json!({"id": "d2"}))])
        .unwrap();
    engine
        .enqueue(ActionKind::Create, "devices", rec(json!({"id": "d3"})))
        .unwrap();

    assert_eq!(engine.clear_cache(), 2);
    let ids: Vec<_> = engine
        .get_local_table("devices")
        .into_iter()
        .map(|r| r["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!("d3")]);
}

#[derive(Debug, Clone)]
struct Op {
    key: usize,
    kind: ActionKind,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    (
        0usize..4,
        prop_oneof![
            Just(ActionKind::Create),
            Just(ActionKind::Update),
            Just(ActionKind::Delete),
        ],
    )
        .prop_map(|(key, kind)| Op { key, kind })
}

fn call_shape(call: &RemoteCall) -> (String, &'static str, Option<Value>) {
    match call {
        RemoteCall::Insert { record, .. } => {
            (record["id"].as_str().unwrap().to_string(), "create", record.get("seq").cloned())
        }
        RemoteCall::Update { id, record, .. } => (id.clone(), "update", record.get("seq").cloned()),
        RemoteCall::Delete { id, .. } => (id.clone(), "delete", None),
    }
}

proptest! {
    #[test]
    fn per_record_order_is_preserved(
        ops in prop::collection::vec(op_strategy(), 1..30),
        failing in prop::collection::btree_set(0usize..4, 0..3),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let remote = Arc::new(MockRemote::new());
            let engine = engine_with(
                SyncConfig::new("prop").with_max_attempts(10),
                &remote,
                &Arc::new(InMemoryPersistence::new()),
            );

            let mut expected: HashMap<String, Vec<(&'static str, Option<Value>)>> = HashMap::new();
            for (seq, op) in ops.iter().enumerate() {
                let id = format!("r{}", op.key);
                engine
                    .enqueue(op.kind, "items", rec(json!({"id": id, "seq": seq})))
                    .unwrap();
                let shape = match op.kind {
                    ActionKind::Create => ("create", Some(json!(seq))),
                    ActionKind::Update => ("update", Some(json!(seq))),
                    ActionKind::Delete => ("delete", None),
                };
                expected.entry(id).or_default().push(shape);
            }

            for key in &failing {
                remote.fail_key(RecordKey::new("items", format!("r{key}")), RemoteError::Timeout);
            }
            completed(engine.drain().await);
            remote.clear_failures();
            completed(engine.drain().await);
            assert_eq!(engine.status().pending_count, 0);

            let mut seen: HashMap<String, Vec<(&'static str, Option<Value>)>> = HashMap::new();
            let mut failed_once: Vec<String> = Vec::new();
            for call in remote.calls() {
                let (id, kind, seq) = call_shape(&call);
                let key: usize = id[1..].parse().unwrap();
                // The first call for a failing record was the failed attempt.
                if failing.contains(&key) && !failed_once.contains(&id) {
                    failed_once.push(id);
                    continue;
                }
                seen.entry(id).or_default().push((kind, seq));
            }
            assert_eq!(seen, expected);
        });
    }
}
