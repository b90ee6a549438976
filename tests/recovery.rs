use revlog::{
    ActorId, Address, ChangeEvent, ChangeOp, ChangeOrchestrator, ChangeRecord, ChangeStatus,
    ChangeStore, Command, CommitOutcome, LockSet, MemoryCache, MemoryStore, NodeExpectation,
    NodeRecord, RevlogConfig, TreeId, Value,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinSet;
use tokio::time::sleep;

fn tree() -> TreeId {
    TreeId::new("acme", "inventory")
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_millis() as u64
}

fn patient_config() -> RevlogConfig {
    RevlogConfig {
        wait_initial_delay_ms: 1,
        wait_max_delay_ms: 20,
        shared_refresh_interval_ms: 10,
        max_command_attempts: 8,
        ..RevlogConfig::default()
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    cache: Arc<MemoryCache>,
    orch: Arc<ChangeOrchestrator<MemoryStore, MemoryCache>>,
}

fn harness(config: RevlogConfig) -> Harness {
    let _ = tracing_subscriber::fmt::try_init();
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let orch = Arc::new(
        ChangeOrchestrator::new(Arc::clone(&store), Arc::clone(&cache), config)
            .expect("config is valid"),
    );
    Harness { store, cache, orch }
}

fn object_locks(t: &TreeId, object: &str) -> LockSet {
    LockSet::from_iter([Address::object(t, object)])
}

/// A claim whose owner died before writing any events. Its ancient
/// activity stamp makes it look abandoned under any timeout config.
fn dead_creating(t: &TreeId, revision: u64, object: &str) -> ChangeRecord {
    ChangeRecord::allocate(revision, object_locks(t, object), ActorId::from("crashed"), 0)
}

/// A claim whose owner died after staging events but before applying
/// or committing them. Roll-forward material.
fn dead_executing(t: &TreeId, revision: u64, object: &str, events: Vec<ChangeEvent>) -> ChangeRecord {
    let mut record = dead_creating(t, revision, object);
    record.begin_executing(events, 0).expect("creating accepts events");
    record
}

fn created(object: &str) -> ChangeEvent {
    ChangeEvent::ObjectCreated { object: object.into() }
}

fn field_set(object: &str, field: &str, value: Value) -> ChangeEvent {
    ChangeEvent::FieldSet {
        object: object.into(),
        field: field.into(),
        value: Some(value),
    }
}

/// Test Case 1: Roll-Forward By A Competing Writer
///
/// A process died after durably staging its events. The next writer
/// that conflicts with the dead claim must finish the dead change
/// first, and then see its effects in the tree.
#[tokio::test]
async fn test_conflicting_writer_rolls_dead_change_forward() {
    let h = harness(patient_config());
    let t = tree();
    let dead = dead_executing(
        &t,
        1,
        "ghost",
        vec![created("ghost"), field_set("ghost", "owner", Value::Text("crashed".into()))],
    );
    h.store.create_record(&t, &dead).await.expect("plant dead claim");

    let outcome = h
        .orch
        .execute_command(&Command::single(t.clone(), ChangeOp::create("ghost")), &ActorId::from("writer"))
        .await
        .expect("command");
    let CommitOutcome::Rejected { revision, reason } = outcome else {
        panic!("the rolled-forward create makes ours redundant, got {outcome:?}");
    };
    assert_eq!(revision, 2);
    assert!(reason.contains("already exists"), "reason: {reason}");

    let record = h.orch.change(&t, 1).await.unwrap().expect("dead record settled");
    assert_eq!(record.status, ChangeStatus::SuccessExecuted);
    assert!(record.locks.is_empty());
    assert_eq!(record.events.len(), 2);

    assert_eq!(h.orch.current_revision(&t).await.unwrap(), 1);
    let feed = h.orch.events_between(&t, 1, 2).await.unwrap().expect("tree exists");
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].revision, 1);
    assert_eq!(feed[0].actor, ActorId::from("crashed"));

    let metrics = h.orch.metrics();
    assert_eq!(metrics.roll_forwards, 1);
    assert!(metrics.predecessor_waits >= 1);
}

/// Test Case 2: Dead Claim With No Events Is Finalized, Not Replayed
///
/// A claim that never staged events has nothing to roll forward; the
/// waiter declares it FailedTimeout and proceeds with its own change.
#[tokio::test]
async fn test_dead_creating_claim_finalized_as_timeout() {
    let h = harness(patient_config());
    let t = tree();
    h.store
        .create_record(&t, &dead_creating(&t, 1, "x"))
        .await
        .expect("plant dead claim");

    let outcome = h
        .orch
        .execute_command(&Command::single(t.clone(), ChangeOp::create("x")), &ActorId::from("writer"))
        .await
        .expect("command");
    assert_eq!(outcome, CommitOutcome::Executed { revision: 2 });

    let record = h.orch.change(&t, 1).await.unwrap().expect("finalized record");
    assert_eq!(record.status, ChangeStatus::FailedTimeout);
    assert!(record.locks.is_empty());
    assert!(record.events.is_empty());

    assert_eq!(h.orch.current_revision(&t).await.unwrap(), 2);
    assert_eq!(h.orch.metrics().timeouts_finalized, 1);
}

/// Test Case 3: Allocation Steps Over Dead Claims
///
/// Dead Creating claims below the probe point get finalized during
/// allocation itself, even when their locks never conflict with the
/// incoming command.
#[tokio::test]
async fn test_allocation_finalizes_dead_claims_in_its_path() {
    let h = harness(patient_config());
    let t = tree();
    for revision in [1, 2] {
        h.store
            .create_record(&t, &dead_creating(&t, revision, "other"))
            .await
            .expect("plant dead claim");
    }

    let outcome = h
        .orch
        .execute_command(&Command::single(t.clone(), ChangeOp::create("mine")), &ActorId::from("writer"))
        .await
        .expect("command");
    assert_eq!(outcome, CommitOutcome::Executed { revision: 3 });

    for revision in [1, 2] {
        let record = h.orch.change(&t, revision).await.unwrap().expect("finalized");
        assert_eq!(record.status, ChangeStatus::FailedTimeout);
    }
    let metrics = h.orch.metrics();
    assert_eq!(metrics.timeouts_finalized, 2);
    assert_eq!(metrics.allocation_conflicts, 2);
    assert_eq!(h.orch.current_revision(&t).await.unwrap(), 3);
}

/// Test Case 4: Replay Over Half-Applied Effects
///
/// The dead process already applied part of its event list before
/// dying. Roll-forward replays the whole list; the revision stamps on
/// the node records make the second application a no-op instead of a
/// corruption.
#[tokio::test]
async fn test_roll_forward_is_idempotent_over_partial_application() {
    let h = harness(patient_config());
    let t = tree();
    let events = vec![created("dup"), field_set("dup", "n", Value::Integer(1))];
    h.store
        .create_record(&t, &dead_executing(&t, 1, "dup", events.clone()))
        .await
        .expect("plant dead claim");

    // the dead process got as far as applying both effects
    let mut node = NodeRecord::created(1, 0);
    assert!(node.apply_field("n", Some(Value::Integer(1)), 1));
    h.store
        .write_node(&t, &Address::object(&t, "dup"), NodeExpectation::Absent, &node)
        .await
        .expect("pre-apply effects");

    // a reader settles the range, which rolls the dead change forward
    let feed = h.orch.events_between(&t, 1, 1).await.unwrap().expect("tree exists");
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].events, events);
    assert_eq!(
        h.orch.change(&t, 1).await.unwrap().expect("settled").status,
        ChangeStatus::SuccessExecuted
    );
    assert_eq!(h.orch.metrics().roll_forwards, 1);

    // state probes: the object exists and holds exactly the one value
    let outcome = h
        .orch
        .execute_command(&Command::single(t.clone(), ChangeOp::create("dup")), &ActorId::from("probe"))
        .await
        .expect("probe create");
    assert!(matches!(outcome, CommitOutcome::Rejected { .. }));
    let outcome = h
        .orch
        .execute_command(
            &Command::single(t.clone(), ChangeOp::set("dup", "n", Value::Integer(1))),
            &ActorId::from("probe"),
        )
        .await
        .expect("probe set");
    assert!(
        matches!(outcome, CommitOutcome::NoChange { .. }),
        "value applied exactly once, got {outcome:?}"
    );
}

/// Test Case 5: Racing Recoverers, Single Winner
///
/// Two processes observe the same dead Executing claim and race to
/// recover it. The claim compare-and-swap lets exactly one of them
/// roll it forward; both then execute their own changes normally.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_recoverers_roll_forward_once() {
    let _ = tracing_subscriber::fmt::try_init();
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let orch_a = Arc::new(
        ChangeOrchestrator::new(Arc::clone(&store), Arc::clone(&cache), patient_config())
            .expect("config is valid"),
    );
    let orch_b = Arc::new(
        ChangeOrchestrator::new(Arc::clone(&store), Arc::clone(&cache), patient_config())
            .expect("config is valid"),
    );
    let t = tree();
    store
        .create_record(&t, &dead_executing(&t, 1, "ghost", vec![created("ghost")]))
        .await
        .expect("plant dead claim");

    let mut tasks = JoinSet::new();
    for (i, orch) in [Arc::clone(&orch_a), Arc::clone(&orch_b)].into_iter().enumerate() {
        let t = t.clone();
        tasks.spawn(async move {
            let command = Command::single(
                t,
                ChangeOp::set("ghost", "tag", Value::Integer(i as i64)),
            );
            orch.execute_command(&command, &ActorId::new(format!("proc-{i}"))).await
        });
    }

    let mut revisions = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result.expect("task panicked") {
            Ok(CommitOutcome::Executed { revision }) => revisions.push(revision),
            Ok(other) => panic!("distinct tags must execute: {other:?}"),
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
    revisions.sort_unstable();
    assert_eq!(revisions, vec![2, 3]);

    let record = orch_a.change(&t, 1).await.unwrap().expect("settled");
    assert_eq!(record.status, ChangeStatus::SuccessExecuted);

    let recoveries = orch_a.metrics().roll_forwards + orch_b.metrics().roll_forwards;
    assert_eq!(recoveries, 1, "the claim swap admits exactly one recoverer");
    assert_eq!(orch_a.current_revision(&t).await.unwrap(), 3);
}

/// Test Case 6: Hijacked Heartbeat Forces A Voluntary Retreat
///
/// While a writer waits behind a live predecessor, another process
/// (simulated here by rewriting the record directly) declares the
/// writer dead and finalizes its claim. The writer's next heartbeat
/// loses its compare-and-swap, it retreats with a voluntary timeout,
/// and the retry completes the command at a fresh revision.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_foreign_finalization_forces_retry() {
    let config = RevlogConfig {
        change_timeout_ms: 400,
        critical_timeout_ms: 60,
        wait_initial_delay_ms: 1,
        wait_max_delay_ms: 10,
        shared_refresh_interval_ms: 10,
        max_command_attempts: 4,
        ..RevlogConfig::default()
    };
    let h = harness(config);
    let t = tree();

    // a live predecessor the writer has to wait behind
    let mut blocker = ChangeRecord::allocate(
        1,
        object_locks(&t, "blocker"),
        ActorId::from("other"),
        now_epoch_ms(),
    );
    blocker
        .begin_executing(vec![created("blocker")], now_epoch_ms())
        .expect("creating accepts events");
    h.store.create_record(&t, &blocker).await.expect("plant blocker");

    let orch = Arc::clone(&h.orch);
    let t_writer = t.clone();
    let writer = tokio::spawn(async move {
        let command = Command::single(
            t_writer,
            ChangeOp::set("blocker", "x", Value::Integer(1)),
        );
        orch.execute_command(&command, &ActorId::from("writer")).await
    });

    // wait for the writer's claim at revision 2, then finalize it out
    // from under the writer the way a recoverer would
    let mut hijacked = false;
    for _ in 0..500 {
        if let Some(v) = h.store.read_record(&t, 2).await.expect("read claim") {
            assert_eq!(
                v.value.status,
                ChangeStatus::Creating,
                "hijack must land while the writer still waits"
            );
            let mut rewritten = v.value.clone();
            rewritten
                .commit(ChangeStatus::FailedTimeout, now_epoch_ms())
                .expect("creating finalizes");
            match h.store.update_record(&t, v.version, &rewritten).await {
                Ok(_) => {
                    hijacked = true;
                    break;
                }
                // lost to a heartbeat; read the fresh version and retry
                Err(e) if e.is_contention() => continue,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        sleep(Duration::from_millis(2)).await;
    }
    assert!(hijacked, "never caught the writer's claim");

    let outcome = writer.await.expect("writer panicked").expect("command");
    assert_eq!(outcome, CommitOutcome::Executed { revision: 3 });

    assert_eq!(
        h.orch.change(&t, 2).await.unwrap().expect("hijacked record").status,
        ChangeStatus::FailedTimeout
    );
    let metrics = h.orch.metrics();
    println!("foreign finalization metrics: {metrics:?}");
    assert_eq!(metrics.voluntary_timeouts, 1);
    assert_eq!(metrics.roll_forwards, 1, "the blocker went stale and was recovered");
    assert_eq!(h.orch.current_revision(&t).await.unwrap(), 3);
    let feed = h.orch.events_between(&t, 1, 3).await.unwrap().expect("tree exists");
    assert_eq!(feed.iter().map(|r| r.revision).collect::<Vec<_>>(), vec![1, 3]);

    // cache tiers are advisory; wiping the distributed tier loses nothing
    h.cache.flush();
    assert_eq!(h.orch.change(&t, 3).await.unwrap().expect("re-read").status, ChangeStatus::SuccessExecuted);
}
