//! The change orchestrator: optimistic execution of commands against a
//! shared versioned tree. One [`ChangeOrchestrator`] per process drives
//! the whole protocol: claim a revision slot, wait out conflicting
//! predecessors, validate, stage events durably, apply effects, commit.
//! Any process can finish a change its owner abandoned, so no crash
//! leaves the log wedged.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::address::TreeId;
use crate::cache::{
    CounterKind, DistributedCounters, LocalRevisionCache, RevisionBounds, SharedRevisionCache,
};
use crate::command::{ActorId, Command};
use crate::config::RevlogConfig;
use crate::error::{RevlogError, RevlogErrorCode, RevlogResult};
use crate::record::{ChangeRecord, ChangeStatus};
use crate::store::{ChangeStore, DistributedCache};

mod allocate;
mod apply;
mod log;
mod recovery;
mod waiting;

pub use log::RevisionEvents;
pub use recovery::RecoveryOutcome;

/// Final outcome of one executed command. Precondition failure is an
/// outcome here, not an error: it is an expected result of optimistic
/// concurrency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The command mutated the tree at this revision.
    Executed { revision: u64 },
    /// The command was a no-op; the revision is burned but the tree is
    /// untouched.
    NoChange { revision: u64 },
    /// Preconditions failed against the state the command saw.
    Rejected { revision: u64, reason: String },
}

impl CommitOutcome {
    pub fn revision(&self) -> u64 {
        match self {
            Self::Executed { revision }
            | Self::NoChange { revision }
            | Self::Rejected { revision, .. } => *revision,
        }
    }
}

#[derive(Debug, Default)]
struct OrchestratorTelemetry {
    commands_executed: AtomicU64,
    commands_no_change: AtomicU64,
    commands_rejected: AtomicU64,
    allocation_conflicts: AtomicU64,
    predecessor_waits: AtomicU64,
    roll_forwards: AtomicU64,
    timeouts_finalized: AtomicU64,
    voluntary_timeouts: AtomicU64,
    record_cache_hits: AtomicU64,
    record_cache_misses: AtomicU64,
}

/// Point-in-time counter snapshot, see [`ChangeOrchestrator::metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorMetrics {
    pub commands_executed: u64,
    pub commands_no_change: u64,
    pub commands_rejected: u64,
    pub allocation_conflicts: u64,
    pub predecessor_waits: u64,
    pub roll_forwards: u64,
    pub timeouts_finalized: u64,
    pub voluntary_timeouts: u64,
    pub record_cache_hits: u64,
    pub record_cache_misses: u64,
}

/// Our claim on one revision slot: the record image we last wrote plus
/// the store version that image carries. Every conditional rewrite goes
/// through this pair.
pub(crate) struct Claim {
    pub(crate) record: ChangeRecord,
    pub(crate) version: u64,
}

impl Claim {
    pub(crate) fn revision(&self) -> u64 {
        self.record.revision
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Protocol engine over a [`ChangeStore`] backend and a
/// [`DistributedCache`]. Clones of the orchestrator are cheap and share
/// the process-wide revision cache and telemetry; spawn one per process
/// and hand clones to tasks.
pub struct ChangeOrchestrator<S, C> {
    store: Arc<S>,
    counters: DistributedCounters<C>,
    shared: Arc<SharedRevisionCache>,
    config: RevlogConfig,
    telemetry: Arc<OrchestratorTelemetry>,
}

impl<S, C> Clone for ChangeOrchestrator<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            counters: self.counters.clone(),
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
            telemetry: Arc::clone(&self.telemetry),
        }
    }
}

impl<S: ChangeStore, C: DistributedCache> ChangeOrchestrator<S, C> {
    pub fn new(store: Arc<S>, cache: Arc<C>, config: RevlogConfig) -> RevlogResult<Self> {
        config.validate()?;
        let shared = Arc::new(SharedRevisionCache::new(
            Duration::from_millis(config.shared_refresh_interval_ms),
            config.record_cache_capacity,
        ));
        Ok(Self {
            store: Arc::clone(&store),
            counters: DistributedCounters::new(cache),
            shared,
            config,
            telemetry: Arc::new(OrchestratorTelemetry::default()),
        })
    }

    pub fn config(&self) -> &RevlogConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn counters(&self) -> &DistributedCounters<C> {
        &self.counters
    }

    pub(crate) fn shared(&self) -> &SharedRevisionCache {
        &self.shared
    }

    /// Runs the full protocol for one command. Contention is absorbed
    /// internally; the returned error cases are invalid input, backend
    /// failure, integrity violations, and a voluntary timeout that
    /// survived every retry attempt.
    pub async fn execute_command(
        &self,
        command: &Command,
        actor: &ActorId,
    ) -> RevlogResult<CommitOutcome> {
        command.validate_shape()?;
        let tree = command.tree.clone();
        let locks = command.lock_set();

        let mut local = LocalRevisionCache::seeded(self.fresh_bounds(&tree).await);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut claim = self
                .allocate_revision(&mut local, &tree, &locks, actor)
                .await?;
            let revision = claim.revision();

            let run = async {
                self.await_predecessors(&mut local, &tree, &mut claim, &locks)
                    .await?;
                self.execute_claim(&mut local, &tree, command, claim).await
            };

            match run.await {
                Ok(outcome) => {
                    self.tally_outcome(&outcome);
                    return Ok(outcome);
                }
                Err(err) if err.code() == RevlogErrorCode::VoluntaryTimeout => {
                    self.telemetry
                        .voluntary_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    match self.resolve_own_timeout(&mut local, &tree, revision).await? {
                        Some(outcome) => {
                            self.tally_outcome(&outcome);
                            return Ok(outcome);
                        }
                        None if attempt < self.config.max_command_attempts => continue,
                        None => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn tally_outcome(&self, outcome: &CommitOutcome) {
        let counter = match outcome {
            CommitOutcome::Executed { .. } => &self.telemetry.commands_executed,
            CommitOutcome::NoChange { .. } => &self.telemetry.commands_no_change,
            CommitOutcome::Rejected { .. } => &self.telemetry.commands_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Resolution after this process abandoned its own claim. The record
    /// is re-read: a record that made it to `Executing` has durable
    /// events and is driven to completion here (ours or a recoverer's);
    /// a record caught earlier is finalized `FailedTimeout` and the
    /// caller re-allocates. `None` = attempt burned, try again.
    async fn resolve_own_timeout(
        &self,
        local: &mut LocalRevisionCache,
        tree: &TreeId,
        revision: u64,
    ) -> RevlogResult<Option<CommitOutcome>> {
        let settled = self.settle_record(local, tree, revision).await?;
        match settled.status {
            ChangeStatus::SuccessExecuted => Ok(Some(CommitOutcome::Executed { revision })),
            ChangeStatus::FailedTimeout => Ok(None),
            status => Err(RevlogError::integrity(format!(
                "abandoned revision {revision} settled as {status}, \
                 which only its owner could have written"
            ))),
        }
    }

    /// Shared bounds for `tree`, refreshed from the distributed tier
    /// when the process-wide entry has gone stale.
    pub(crate) async fn fresh_bounds(&self, tree: &TreeId) -> RevisionBounds {
        let (bounds, stale) = self.shared.bounds(tree);
        if !stale {
            return bounds;
        }
        let distributed = self.counters.read_bounds(tree).await;
        self.shared.apply_refresh(tree, distributed)
    }

    /// Folds a terminal record into every cache tier and opportunistically
    /// advances the committed floor when this record extends it.
    pub(crate) async fn remember_terminal(
        &self,
        local: &mut LocalRevisionCache,
        tree: &TreeId,
        record: Arc<ChangeRecord>,
    ) {
        debug_assert!(record.is_terminal());
        let revision = record.revision;
        local.remember(Arc::clone(&record));
        self.shared.remember_record(tree, Arc::clone(&record));
        self.counters.publish_record(tree, &record).await;

        let (bounds, _) = self.shared.bounds(tree);
        if bounds.last_committed() + 1 == revision {
            self.shared.note(tree, CounterKind::LastCommitted, revision);
            local.bounds_mut().note_committed(revision);
            if record.status == ChangeStatus::SuccessExecuted {
                self.shared.note(tree, CounterKind::Current, revision);
                local.bounds_mut().note_current(revision);
                self.counters.raise(tree, CounterKind::Current, revision).await;
            } else {
                self.counters
                    .raise(tree, CounterKind::LastCommitted, revision)
                    .await;
            }
        }
    }

    pub(crate) fn note_taken(&self, local: &mut LocalRevisionCache, tree: &TreeId, revision: u64) {
        local.bounds_mut().note_taken(revision);
        self.shared.note(tree, CounterKind::LastTaken, revision);
    }

    pub(crate) fn count_allocation_conflict(&self) {
        self.telemetry
            .allocation_conflicts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_predecessor_wait(&self) {
        self.telemetry
            .predecessor_waits
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_roll_forward(&self) {
        self.telemetry.roll_forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_timeout_finalized(&self) {
        self.telemetry
            .timeouts_finalized
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_record_cache(&self, hit: bool) {
        let counter = if hit {
            &self.telemetry.record_cache_hits
        } else {
            &self.telemetry.record_cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            commands_executed: self.telemetry.commands_executed.load(Ordering::Relaxed),
            commands_no_change: self.telemetry.commands_no_change.load(Ordering::Relaxed),
            commands_rejected: self.telemetry.commands_rejected.load(Ordering::Relaxed),
            allocation_conflicts: self.telemetry.allocation_conflicts.load(Ordering::Relaxed),
            predecessor_waits: self.telemetry.predecessor_waits.load(Ordering::Relaxed),
            roll_forwards: self.telemetry.roll_forwards.load(Ordering::Relaxed),
            timeouts_finalized: self.telemetry.timeouts_finalized.load(Ordering::Relaxed),
            voluntary_timeouts: self.telemetry.voluntary_timeouts.load(Ordering::Relaxed),
            record_cache_hits: self.telemetry.record_cache_hits.load(Ordering::Relaxed),
            record_cache_misses: self.telemetry.record_cache_misses.load(Ordering::Relaxed),
        }
    }
}
