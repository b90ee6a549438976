use criterion::{Criterion, black_box, criterion_group, criterion_main};
use revlog::{
    ActorId, Address, ChangeOp, ChangeOrchestrator, Command, LockSet, MemoryCache, MemoryStore,
    RevlogConfig, TreeId, Value,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

const SEEDED_REVISIONS: i64 = 256;
const FEED_WINDOW: u64 = 32;

fn bench_config() -> RevlogConfig {
    RevlogConfig {
        wait_initial_delay_ms: 1,
        wait_max_delay_ms: 10,
        shared_refresh_interval_ms: 50,
        ..RevlogConfig::default()
    }
}

async fn seeded_orchestrator() -> (TreeId, Arc<ChangeOrchestrator<MemoryStore, MemoryCache>>) {
    let tree = TreeId::new("bench", "inventory");
    let orch = Arc::new(
        ChangeOrchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::new()),
            bench_config(),
        )
        .expect("config"),
    );
    let actor = ActorId::from("seed");
    orch.execute_command(&Command::single(tree.clone(), ChangeOp::create("hot")), &actor)
        .await
        .expect("seed create");
    for i in 0..SEEDED_REVISIONS {
        orch.execute_command(
            &Command::single(tree.clone(), ChangeOp::set("hot", "counter", Value::Integer(i))),
            &actor,
        )
        .await
        .expect("seed set");
    }
    (tree, orch)
}

fn bench_revlog_hot_paths(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let (tree, orch) = rt.block_on(seeded_orchestrator());
    let actor = ActorId::from("bench");

    let mut next_value = SEEDED_REVISIONS;
    c.bench_function("commit_field_update", |b| {
        b.iter(|| {
            rt.block_on(async {
                let value = black_box(next_value);
                next_value += 1;
                orch.execute_command(
                    &Command::single(
                        tree.clone(),
                        ChangeOp::set("hot", "counter", Value::Integer(value)),
                    ),
                    &actor,
                )
                .await
                .expect("commit")
            })
        })
    });

    // the planner detects the no-op before any record is staged,
    // but a revision slot is still claimed and committed
    let frozen = next_value - 1;
    c.bench_function("commit_no_change", |b| {
        b.iter(|| {
            rt.block_on(async {
                orch.execute_command(
                    &Command::single(
                        tree.clone(),
                        ChangeOp::set("hot", "counter", Value::Integer(black_box(frozen))),
                    ),
                    &actor,
                )
                .await
                .expect("commit")
            })
        })
    });

    c.bench_function("current_revision_cached", |b| {
        b.iter(|| {
            rt.block_on(async { orch.current_revision(black_box(&tree)).await.expect("read") })
        })
    });

    c.bench_function("events_window_32", |b| {
        b.iter(|| {
            rt.block_on(async {
                orch.events_between(black_box(&tree), 5, 5 + FEED_WINDOW - 1)
                    .await
                    .expect("read")
                    .expect("tree exists")
            })
        })
    });

    let held: Vec<LockSet> = (0..64)
        .map(|i| LockSet::from_iter([Address::field(&tree, format!("obj-{i}"), "state")]))
        .collect();
    let incoming = LockSet::from_iter([
        Address::object(&tree, "obj-17"),
        Address::field(&tree, "obj-63", "state"),
    ]);
    c.bench_function("lockset_conflict_check", |b| {
        b.iter(|| {
            held.iter()
                .filter(|locks| locks.conflicts_with(black_box(&incoming)))
                .count()
        })
    });
}

criterion_group!(benches, bench_revlog_hot_paths);
criterion_main!(benches);
