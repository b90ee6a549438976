use revlog::{
    ActorId, ChangeEvent, ChangeOp, ChangeOrchestrator, ChangeRecord, ChangeStatus, ChangeStore,
    Command, CommitOutcome, LockSet, MemoryCache, MemoryStore, RevlogConfig, TreeId, Value,
};
use revlog::Address;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn tree() -> TreeId {
    TreeId::new("acme", "inventory")
}

fn patient_config() -> RevlogConfig {
    RevlogConfig {
        wait_initial_delay_ms: 1,
        wait_max_delay_ms: 20,
        shared_refresh_interval_ms: 10,
        ..RevlogConfig::default()
    }
}

fn harness() -> (Arc<MemoryStore>, Arc<ChangeOrchestrator<MemoryStore, MemoryCache>>) {
    let store = Arc::new(MemoryStore::new());
    let orch = Arc::new(
        ChangeOrchestrator::new(
            Arc::clone(&store),
            Arc::new(MemoryCache::new()),
            patient_config(),
        )
        .expect("config is valid"),
    );
    (store, orch)
}

fn created(object: &str) -> ChangeEvent {
    ChangeEvent::ObjectCreated { object: object.into() }
}

/// Test Case 1: Feed Reconstruction
///
/// A realistic sequence of changes; the feed must reproduce each
/// revision's net events in order, with per-event point reads agreeing
/// with the batch view.
#[tokio::test]
async fn test_feed_reconstructs_workload() {
    let (_store, orch) = harness();
    let t = tree();
    let actor = ActorId::from("loader");

    let commands: Vec<Command> = vec![
        Command::new(
            t.clone(),
            [
                ChangeOp::create("sku-1"),
                ChangeOp::set("sku-1", "qty", Value::Integer(10)),
            ],
        ),
        Command::single(t.clone(), ChangeOp::create("sku-2")),
        Command::single(t.clone(), ChangeOp::set("sku-1", "qty", Value::Integer(4))),
        Command::single(t.clone(), ChangeOp::remove("sku-2")),
    ];
    for (i, command) in commands.iter().enumerate() {
        let outcome = orch.execute_command(command, &actor).await.expect("command");
        assert_eq!(outcome.revision(), i as u64 + 1);
    }

    let feed = orch.events_between(&t, 1, 4).await.unwrap().expect("tree exists");
    assert_eq!(feed.len(), 4);
    assert_eq!(
        feed[0].events,
        vec![
            created("sku-1"),
            ChangeEvent::FieldSet {
                object: "sku-1".into(),
                field: "qty".into(),
                value: Some(Value::Integer(10)),
            },
        ]
    );
    assert_eq!(feed[3].events, vec![ChangeEvent::ObjectRemoved { object: "sku-2".into() }]);

    // point reads serve single events from the per-event rows
    assert_eq!(orch.event(&t, 1, 0).await.unwrap(), Some(created("sku-1")));
    assert_eq!(orch.event(&t, 1, 1).await.unwrap(), feed[0].events.get(1).cloned());
    assert_eq!(orch.event(&t, 1, 2).await.unwrap(), None);
    assert_eq!(orch.event(&t, 4, 0).await.unwrap(), feed[3].events.first().cloned());
}

/// Test Case 2: Cold Process Catch-Up
///
/// A second orchestrator joins with empty caches over the same
/// backend. Its first current-revision call scans the log forward in
/// expanding windows and lands on the same executed point, skipping
/// the no-change tail.
#[tokio::test]
async fn test_cold_process_catches_up_by_scanning() {
    let (store, orch_a) = harness();
    let t = tree();
    let actor = ActorId::from("writer");

    orch_a
        .execute_command(&Command::single(t.clone(), ChangeOp::create("obj")), &actor)
        .await
        .expect("create");
    for i in 0..10 {
        let outcome = orch_a
            .execute_command(
                &Command::single(t.clone(), ChangeOp::set("obj", "v", Value::Integer(i))),
                &actor,
            )
            .await
            .expect("set");
        assert!(matches!(outcome, CommitOutcome::Executed { .. }));
    }
    for _ in 0..3 {
        let outcome = orch_a
            .execute_command(
                &Command::single(t.clone(), ChangeOp::set("obj", "v", Value::Integer(9))),
                &actor,
            )
            .await
            .expect("duplicate set");
        assert!(matches!(outcome, CommitOutcome::NoChange { .. }));
    }

    // fresh process: same store, empty distributed cache, cold bounds
    let orch_b = Arc::new(
        ChangeOrchestrator::new(
            Arc::clone(&store),
            Arc::new(MemoryCache::new()),
            patient_config(),
        )
        .expect("config is valid"),
    );
    assert_eq!(orch_b.current_revision(&t).await.unwrap(), 11);
    // settled bounds make the second call cheap and identical
    assert_eq!(orch_b.current_revision(&t).await.unwrap(), 11);

    let feed = orch_b.events_between(&t, 5, 14).await.unwrap().expect("tree exists");
    assert_eq!(
        feed.iter().map(|r| r.revision).collect::<Vec<_>>(),
        vec![5, 6, 7, 8, 9, 10, 11],
        "no-change burns contribute nothing"
    );
}

/// Test Case 3: Live In-Flight Work Blocks The Feed
///
/// A record still inside its timeout budget belongs to its owner. The
/// feed reports contention instead of waiting or recovering, and the
/// current-revision scan stops short of it.
#[tokio::test]
async fn test_live_claim_blocks_feed_with_contention() {
    let (store, orch) = harness();
    let t = tree();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_millis() as u64;
    let mut live = ChangeRecord::allocate(
        1,
        LockSet::from_iter([Address::object(&t, "wip")]),
        ActorId::from("other"),
        now,
    );
    live.begin_executing(vec![created("wip")], now).expect("stage events");
    store.create_record(&t, &live).await.expect("plant live claim");

    let err = orch.events_between(&t, 1, 1).await.expect_err("live claim blocks");
    assert!(err.is_contention(), "got {err:?}");
    assert!(err.is_recoverable());

    assert_eq!(orch.current_revision(&t).await.unwrap(), 0);
    assert_eq!(
        orch.change(&t, 1).await.unwrap().expect("record visible").status,
        ChangeStatus::Executing
    );
    assert_eq!(orch.metrics().roll_forwards, 0);
}

/// Test Case 4: The Reader Recovers Dead Work In Its Range
///
/// A timed-out Executing record inside the requested range is rolled
/// forward by the reader itself; afterwards its events are part of the
/// feed and its effects part of the tree.
#[tokio::test]
async fn test_reader_rolls_dead_claim_forward() {
    let (store, orch) = harness();
    let t = tree();
    let mut dead = ChangeRecord::allocate(
        1,
        LockSet::from_iter([Address::object(&t, "phantom")]),
        ActorId::from("crashed"),
        0,
    );
    dead.begin_executing(vec![created("phantom")], 0).expect("stage events");
    store.create_record(&t, &dead).await.expect("plant dead claim");

    let feed = orch.events_between(&t, 1, 1).await.unwrap().expect("tree exists");
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].events, vec![created("phantom")]);
    assert_eq!(orch.metrics().roll_forwards, 1);

    let outcome = orch
        .execute_command(&Command::single(t.clone(), ChangeOp::create("phantom")), &ActorId::from("probe"))
        .await
        .expect("probe");
    assert!(
        matches!(outcome, CommitOutcome::Rejected { .. }),
        "recovered effects must be visible, got {outcome:?}"
    );
}

/// Test Case 5: Range Edges
///
/// Degenerate and overshooting ranges: empty windows answer the
/// existence question, reads past the end of the log stop quietly, and
/// revision zero never resolves to a record.
#[tokio::test]
async fn test_range_edges() {
    let (_store, orch) = harness();
    let t = tree();

    // nothing was ever executed against this tree
    assert_eq!(orch.events_between(&t, 1, 5).await.unwrap(), None);
    assert_eq!(orch.events_between(&t, 0, 0).await.unwrap(), None);
    assert_eq!(orch.change(&t, 1).await.unwrap(), None);

    orch.execute_command(&Command::single(t.clone(), ChangeOp::create("only")), &ActorId::from("w"))
        .await
        .expect("create");

    let empty = orch.events_between(&t, 0, 0).await.unwrap();
    assert_eq!(empty, Some(Vec::new()), "empty range on an existing tree");
    assert_eq!(orch.events_between(&t, 7, 3).await.unwrap(), Some(Vec::new()));

    let overshoot = orch.events_between(&t, 1, 1_000).await.unwrap().expect("tree exists");
    assert_eq!(overshoot.len(), 1, "the feed ends where the log ends");

    assert_eq!(orch.change(&t, 0).await.unwrap(), None);
    assert_eq!(orch.event(&t, 1, 7).await.unwrap(), None);
}
