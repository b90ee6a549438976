use backon::{Backoff, BackoffBuilder, ExponentialBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, trace};

use crate::address::TreeId;
use crate::cache::LocalRevisionCache;
use crate::error::{RevlogError, RevlogResult};
use crate::lock::LockSet;
use crate::record::{ChangeRecord, ChangeStatus};
use crate::store::{ChangeStore, DistributedCache};

use super::{ChangeOrchestrator, Claim, now_ms};

impl<S: ChangeStore, C: DistributedCache> ChangeOrchestrator<S, C> {
    /// Blocks the claimed change until every conflicting uncommitted
    /// predecessor reached a terminal status.
    ///
    /// Scans backward from the claimed revision to the committed floor.
    /// Terminal predecessors are cached and skipped; live ones with
    /// disjoint locks never block us; conflicting ones are polled with
    /// backoff and recovered if their owner died. Our own slot keeps
    /// holding its locks throughout, so later claims queue behind us
    /// exactly as we queue behind earlier ones.
    pub(crate) async fn await_predecessors(
        &self,
        local: &mut LocalRevisionCache,
        tree: &TreeId,
        claim: &mut Claim,
        locks: &LockSet,
    ) -> RevlogResult<()> {
        let floor = local.bounds().last_committed();
        let mut high = claim.revision().saturating_sub(1);

        while high > floor {
            let low = high
                .saturating_sub(self.config.max_scan_window.saturating_sub(1))
                .max(floor + 1);
            let batch = self.store().read_record_range(tree, low, high).await?;

            for (offset, slot) in batch.into_iter().enumerate().rev() {
                let revision = low + offset as u64;
                let Some(stored) = slot else {
                    return Err(RevlogError::integrity(format!(
                        "missing predecessor record {revision} below live \
                         claim {} on {tree}",
                        claim.revision()
                    )));
                };
                if stored.value.is_terminal() {
                    self.remember_terminal(local, tree, Arc::new(stored.value))
                        .await;
                    continue;
                }
                if !stored.value.locks.conflicts_with(locks) {
                    trace!(%tree, revision, "predecessor in flight but disjoint");
                    continue;
                }
                debug!(
                    %tree,
                    revision,
                    waiter = claim.revision(),
                    "waiting for conflicting predecessor"
                );
                self.count_predecessor_wait();
                self.settle_with_claim(local, tree, revision, Some(claim))
                    .await?;
            }

            high = low - 1;
        }
        Ok(())
    }

    /// Polls `revision` until it is terminal, recovering it if its owner
    /// went quiet. Used for foreign records and for this process's own
    /// abandoned claims alike.
    pub(crate) async fn settle_record(
        &self,
        local: &mut LocalRevisionCache,
        tree: &TreeId,
        revision: u64,
    ) -> RevlogResult<Arc<ChangeRecord>> {
        self.settle_with_claim(local, tree, revision, None).await
    }

    async fn settle_with_claim(
        &self,
        local: &mut LocalRevisionCache,
        tree: &TreeId,
        revision: u64,
        mut claim: Option<&mut Claim>,
    ) -> RevlogResult<Arc<ChangeRecord>> {
        let mut backoff = self.wait_backoff();

        loop {
            let Some(stored) = self.store().read_record(tree, revision).await? else {
                return Err(RevlogError::integrity(format!(
                    "record {revision} on {tree} vanished while being watched"
                )));
            };
            stored.value.validate()?;

            if stored.value.is_terminal() {
                let record = Arc::new(stored.value);
                self.remember_terminal(local, tree, Arc::clone(&record))
                    .await;
                return Ok(record);
            }

            if stored
                .value
                .is_timed_out(now_ms(), self.config.change_timeout_ms)
            {
                match stored.value.status {
                    ChangeStatus::Executing => {
                        // Events are durable; finish the work on the
                        // owner's behalf. Win or lose, re-read.
                        self.roll_forward(tree, &stored).await?;
                    }
                    ChangeStatus::Creating => {
                        if let Some(terminal) = self.finalize_timed_out(tree, &stored).await? {
                            self.remember_terminal(local, tree, terminal.clone()).await;
                            return Ok(terminal);
                        }
                    }
                    status => {
                        return Err(RevlogError::integrity(format!(
                            "non-terminal record {revision} in status {status}"
                        )));
                    }
                }
                continue;
            }

            if let Some(claim) = claim.as_deref_mut() {
                self.keep_claim_alive(tree, claim).await?;
            }

            let delay = backoff
                .next()
                .unwrap_or(Duration::from_millis(self.config.wait_max_delay_ms));
            time::sleep(delay).await;
        }
    }

    fn wait_backoff(&self) -> impl Backoff {
        ExponentialBuilder::new()
            .with_min_delay(Duration::from_millis(self.config.wait_initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.config.wait_max_delay_ms))
            .with_jitter()
            .without_max_times()
            .build()
    }

    /// Heartbeats our own record so nobody declares us dead while we
    /// wait or apply. Also the cooperative give-up point: once the
    /// critical margin is blown despite the heartbeats, we abandon
    /// rather than race the hard deadline against a recoverer.
    pub(crate) async fn keep_claim_alive(
        &self,
        tree: &TreeId,
        claim: &mut Claim,
    ) -> RevlogResult<()> {
        let now = now_ms();
        if claim
            .record
            .is_timeout_critical(now, self.config.critical_timeout_ms)
        {
            debug!(
                %tree,
                revision = claim.revision(),
                idle_ms = claim.record.idle_ms(now),
                "critical timeout margin blown; abandoning claim"
            );
            if claim.record.status == ChangeStatus::Creating {
                self.abandon_creating_claim(tree, claim).await;
            }
            return Err(RevlogError::VoluntaryTimeout {
                revision: claim.revision(),
            });
        }
        if claim.record.idle_ms(now) * 2 < self.config.critical_timeout_ms {
            return Ok(());
        }

        let mut touched = claim.record.clone();
        touched.touch(now);
        match self
            .store()
            .update_record(tree, claim.version, &touched)
            .await
        {
            Ok(version) => {
                claim.record = touched;
                claim.version = version;
                Ok(())
            }
            Err(err) if err.is_contention() => {
                // Someone rewrote our record. The only legal foreign
                // write is a FailedTimeout finalization of a claim
                // presumed dead.
                let stored = self.store().read_record(tree, claim.revision()).await?;
                match stored {
                    Some(v) if v.value.status == ChangeStatus::FailedTimeout => {
                        Err(RevlogError::VoluntaryTimeout {
                            revision: claim.revision(),
                        })
                    }
                    Some(v) => Err(RevlogError::integrity(format!(
                        "own record {} rewritten to {} by another process",
                        claim.revision(),
                        v.value.status
                    ))),
                    None => Err(RevlogError::integrity(format!(
                        "own record {} vanished",
                        claim.revision()
                    ))),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Finalizes our own abandoned `Creating` record right away instead
    /// of leaving it for a recoverer, so a retry is not stuck waiting
    /// behind its former self. Losing the swap means a recoverer got
    /// there first, which is the same end state.
    async fn abandon_creating_claim(&self, tree: &TreeId, claim: &Claim) {
        let mut failed = claim.record.clone();
        if failed
            .commit(ChangeStatus::FailedTimeout, now_ms())
            .is_err()
        {
            return;
        }
        match self
            .store()
            .update_record(tree, claim.version, &failed)
            .await
        {
            Ok(_) => {
                debug!(
                    %tree,
                    revision = claim.revision(),
                    "abandoned claim finalized as failed_timeout"
                );
                self.counters().publish_record(tree, &failed).await;
            }
            Err(err) if err.is_contention() => {}
            Err(err) => {
                debug!(
                    %tree,
                    revision = claim.revision(),
                    error = %err,
                    "abandoned claim left for recovery"
                );
            }
        }
    }
}
