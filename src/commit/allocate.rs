use std::sync::Arc;
use tracing::{debug, trace};

use crate::address::TreeId;
use crate::cache::{CounterKind, LocalRevisionCache};
use crate::command::ActorId;
use crate::error::{RevlogError, RevlogResult};
use crate::lock::LockSet;
use crate::record::{ChangeRecord, ChangeStatus};
use crate::store::{ChangeStore, DistributedCache};

use super::{ChangeOrchestrator, Claim, now_ms};

impl<S: ChangeStore, C: DistributedCache> ChangeOrchestrator<S, C> {
    /// Claims the next free revision slot for this change.
    ///
    /// Starting just above the highest revision any tier knows to be
    /// taken, probes upward with put-if-absent writes. A lost probe
    /// inspects the occupant: terminal records are cached and stepped
    /// over, a stale `Creating` corpse is finalized `FailedTimeout`
    /// first, and anything alive is stepped over for the wait phase to
    /// deal with. Revisions are claimed densely, so the probe always
    /// catches up with the head of the log.
    pub(crate) async fn allocate_revision(
        &self,
        local: &mut LocalRevisionCache,
        tree: &TreeId,
        locks: &LockSet,
        actor: &ActorId,
    ) -> RevlogResult<Claim> {
        local.bounds_mut().merge(&self.fresh_bounds(tree).await);
        let mut revision = local.bounds().last_taken() + 1;

        for _ in 0..self.config.max_allocate_probes {
            let record = ChangeRecord::allocate(revision, locks.clone(), actor.clone(), now_ms());
            match self.store().create_record(tree, &record).await {
                Ok(version) => {
                    trace!(%tree, revision, "claimed revision slot");
                    self.note_taken(local, tree, revision);
                    self.counters()
                        .raise(tree, CounterKind::LastTaken, revision)
                        .await;
                    return Ok(Claim { record, version });
                }
                Err(err) if err.is_contention() => {
                    self.count_allocation_conflict();
                    if let Some(next) = self.step_over_occupant(local, tree, revision).await? {
                        revision = next;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(RevlogError::integrity(format!(
            "allocation scan on {tree} exceeded {} probes without finding \
             a free slot",
            self.config.max_allocate_probes
        )))
    }

    /// Decides where the probe goes after losing the claim race at
    /// `revision`. `Some(next)` advances the probe, `None` re-probes the
    /// same slot.
    async fn step_over_occupant(
        &self,
        local: &mut LocalRevisionCache,
        tree: &TreeId,
        revision: u64,
    ) -> RevlogResult<Option<u64>> {
        let Some(occupant) = self.store().read_record(tree, revision).await? else {
            // The winning write is not readable yet. Re-probe; the slot
            // cannot be claimed twice.
            debug!(%tree, revision, "lost claim race but occupant not yet visible");
            return Ok(None);
        };
        occupant.value.validate()?;

        if occupant.value.is_terminal() {
            self.remember_terminal(local, tree, Arc::new(occupant.value))
                .await;
            return Ok(Some(revision + 1));
        }

        if occupant.value.status == ChangeStatus::Creating
            && occupant
                .value
                .is_timed_out(now_ms(), self.config.change_timeout_ms)
        {
            // A corpse that never staged events has nothing to recover.
            if let Some(terminal) = self.finalize_timed_out(tree, &occupant).await? {
                self.remember_terminal(local, tree, terminal).await;
                return Ok(Some(revision + 1));
            }
            // Lost the finalize race; re-evaluate the slot.
            return Ok(None);
        }

        // Actively worked on, or an Executing record whose recovery is
        // the wait phase's job. Either way the slot is spoken for.
        self.note_taken(local, tree, revision);
        Ok(Some(revision + 1))
    }
}
