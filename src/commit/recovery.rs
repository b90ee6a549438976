use std::sync::Arc;
use tracing::{debug, info};

use crate::address::TreeId;
use crate::error::{RevlogError, RevlogResult};
use crate::record::{ChangeRecord, ChangeStatus};
use crate::store::{ChangeStore, DistributedCache, Versioned};

use super::{ChangeOrchestrator, now_ms};

/// Result of one roll-forward attempt on a foreign record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// This process claimed the record and drove it to `SuccessExecuted`.
    Recovered,
    /// Another process holds the claim, or the record moved on before we
    /// could take it. The caller re-reads and re-evaluates.
    NotRecovered,
}

impl<S: ChangeStore, C: DistributedCache> ChangeOrchestrator<S, C> {
    /// Finishes an `Executing` change whose owner went quiet: claim it
    /// with a compare-and-swap heartbeat, replay its durable events, and
    /// commit `SuccessExecuted`.
    ///
    /// The claim only succeeds while the record is still timed out at
    /// claim time, so two recoverers (or a recoverer racing a
    /// resurrected owner) cannot both believe they finished it: one
    /// swap wins, the other observes `NotRecovered`.
    pub(crate) async fn roll_forward(
        &self,
        tree: &TreeId,
        observed: &Versioned<ChangeRecord>,
    ) -> RevlogResult<RecoveryOutcome> {
        let revision = observed.value.revision;

        // Re-read at claim time; the observation may be stale.
        let Some(fresh) = self.store().read_record(tree, revision).await? else {
            return Err(RevlogError::integrity(format!(
                "executing record {revision} on {tree} vanished"
            )));
        };
        if !fresh.value.can_roll_forward()
            || !fresh
                .value
                .is_timed_out(now_ms(), self.config.change_timeout_ms)
        {
            return Ok(RecoveryOutcome::NotRecovered);
        }

        let mut claimed = fresh.value.clone();
        claimed.touch(now_ms());
        let version = match self
            .store()
            .update_record(tree, fresh.version, &claimed)
            .await
        {
            Ok(version) => version,
            Err(err) if err.is_contention() => {
                debug!(%tree, revision, "lost roll-forward claim race");
                return Ok(RecoveryOutcome::NotRecovered);
            }
            Err(err) => return Err(err),
        };

        info!(
            %tree,
            revision,
            actor = %claimed.actor,
            idle_ms = observed.value.idle_ms(now_ms()),
            "rolling forward abandoned change"
        );

        // The owner may have died between staging and finishing its
        // per-event rows. Rewriting them is idempotent; the bytes are
        // derived from the same record.
        for (index, event) in claimed.events.iter().enumerate() {
            self.store()
                .put_event(tree, revision, index as u32, event)
                .await?;
        }
        self.apply_events(tree, revision, &claimed.events).await?;

        let mut committed = claimed.clone();
        committed.commit(ChangeStatus::SuccessExecuted, now_ms())?;
        match self.store().update_record(tree, version, &committed).await {
            Ok(_) => {
                self.count_roll_forward();
                self.counters().publish_record(tree, &committed).await;
                Ok(RecoveryOutcome::Recovered)
            }
            Err(err) if err.is_contention() => {
                // Someone re-claimed after deciding we died mid-recovery.
                // The effects we applied are idempotent; their commit
                // counts, ours does not.
                debug!(%tree, revision, "roll-forward commit superseded");
                Ok(RecoveryOutcome::NotRecovered)
            }
            Err(err) => Err(err),
        }
    }

    /// Finalizes a timed-out `Creating` record as `FailedTimeout`. There
    /// is nothing to recover: no events were staged. Returns the
    /// terminal record if this slot is settled after the call, `None`
    /// when a racer rewrote it first and the caller must re-read.
    pub(crate) async fn finalize_timed_out(
        &self,
        tree: &TreeId,
        observed: &Versioned<ChangeRecord>,
    ) -> RevlogResult<Option<Arc<ChangeRecord>>> {
        let revision = observed.value.revision;
        if observed.value.status != ChangeStatus::Creating {
            return Err(RevlogError::integrity(format!(
                "finalize of record {revision} in status {}",
                observed.value.status
            )));
        }

        let mut failed = observed.value.clone();
        failed.commit(ChangeStatus::FailedTimeout, now_ms())?;
        match self
            .store()
            .update_record(tree, observed.version, &failed)
            .await
        {
            Ok(_) => {
                self.count_timeout_finalized();
                info!(%tree, revision, actor = %failed.actor, "finalized abandoned claim");
                self.counters().publish_record(tree, &failed).await;
                Ok(Some(Arc::new(failed)))
            }
            Err(err) if err.is_contention() => {
                // The owner woke up, or another finalizer won. Re-read
                // and hand back whatever is settled.
                let stored = self.store().read_record(tree, revision).await?;
                match stored {
                    Some(v) if v.value.is_terminal() => Ok(Some(Arc::new(v.value))),
                    Some(_) => Ok(None),
                    None => Err(RevlogError::integrity(format!(
                        "record {revision} on {tree} vanished during finalize"
                    ))),
                }
            }
            Err(err) => Err(err),
        }
    }
}
