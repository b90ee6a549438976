use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

use crate::address::TreeId;
use crate::cache::CounterKind;
use crate::command::ActorId;
use crate::error::{RevlogError, RevlogResult};
use crate::event::ChangeEvent;
use crate::record::{ChangeRecord, ChangeStatus};
use crate::store::{ChangeStore, DistributedCache, Versioned};

use super::{ChangeOrchestrator, now_ms};

/// Leading window sizes for the forward catch-up scan; past the last
/// one the window keeps growing fourfold, capped by the configured
/// maximum.
const SCAN_WINDOWS: [u64; 4] = [1, 8, 32, 128];

/// The durable outcome of one executed revision, as consumers of the
/// change feed see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionEvents {
    pub revision: u64,
    pub actor: ActorId,
    pub events: Vec<ChangeEvent>,
}

/// How one revision slot was resolved while assembling a range read.
enum Resolved {
    Cached(Arc<ChangeRecord>),
    Stored(Versioned<ChangeRecord>),
}

impl<S: ChangeStore, C: DistributedCache> ChangeOrchestrator<S, C> {
    /// Returns the newest executed revision of the tree, refreshing the
    /// cached value by scanning the record log forward from the
    /// committed floor in expanding windows until an unterminated or
    /// absent record ends the contiguous terminal prefix. Returns 0 for
    /// a tree nothing was ever executed against.
    pub async fn current_revision(&self, tree: &TreeId) -> RevlogResult<u64> {
        let bounds = self.fresh_bounds(tree).await;
        let mut floor = bounds.last_committed();
        let mut current = bounds.current();

        let mut windows = SCAN_WINDOWS.iter().copied();
        let mut window = 1u64;
        'scan: loop {
            window = windows
                .next()
                .unwrap_or_else(|| window.saturating_mul(4))
                .min(self.config.max_scan_window);
            let first = floor + 1;
            let last = floor + window;
            let batch = self.store().read_record_range(tree, first, last).await?;
            for (offset, slot) in batch.into_iter().enumerate() {
                let revision = first + offset as u64;
                match slot {
                    Some(v) if v.value.is_terminal() => {
                        floor = revision;
                        if v.value.status == ChangeStatus::SuccessExecuted {
                            current = revision;
                        }
                        self.shared().remember_record(tree, Arc::new(v.value));
                    }
                    _ => break 'scan,
                }
            }
        }

        if floor > bounds.last_committed() || current > bounds.current() {
            trace!(%tree, floor, current, "forward scan advanced the revision floor");
            self.shared().note(tree, CounterKind::LastCommitted, floor);
            self.shared().note(tree, CounterKind::Current, current);
            self.counters()
                .raise(tree, CounterKind::LastCommitted, floor)
                .await;
            self.counters()
                .raise(tree, CounterKind::Current, current)
                .await;
        }
        Ok(current)
    }

    /// Collects the events of every executed revision in
    /// `begin..=end`, in revision order. Revisions that produced no
    /// events are skipped; a timed-out in-flight record inside the
    /// range is recovered before the read proceeds. Returns `None` when
    /// the tree never existed (it has no revision 1), and ends the list
    /// early where the log ends.
    ///
    /// A record that is still being worked on (or actively recovered)
    /// inside the range surfaces as a `Contention` error; the range is
    /// readable once its writer settles.
    pub async fn events_between(
        &self,
        tree: &TreeId,
        begin: u64,
        end: u64,
    ) -> RevlogResult<Option<Vec<RevisionEvents>>> {
        let begin = begin.max(1);
        if end < begin {
            return match self.change(tree, 1).await? {
                Some(_) => Ok(Some(Vec::new())),
                None => Ok(None),
            };
        }

        let committed_floor = self.fresh_bounds(tree).await.last_committed();
        let mut out = Vec::new();
        let mut revision = begin;
        while revision <= end {
            let chunk_last = end.min(revision + self.config.max_scan_window - 1);
            let len = (chunk_last - revision + 1) as usize;

            let mut slots: Vec<Option<Resolved>> = Vec::with_capacity(len);
            let mut unresolved = Vec::new();
            for offset in 0..len {
                match self.shared().record(tree, revision + offset as u64) {
                    Some(rec) => {
                        self.count_record_cache(true);
                        slots.push(Some(Resolved::Cached(rec)));
                    }
                    None => {
                        self.count_record_cache(false);
                        slots.push(None);
                        unresolved.push(offset);
                    }
                }
            }
            let mut missing = Vec::new();
            for offset in unresolved {
                match self
                    .counters()
                    .fetch_record(tree, revision + offset as u64)
                    .await
                {
                    Some(rec) => {
                        let rec = Arc::new(rec);
                        self.shared().remember_record(tree, rec.clone());
                        slots[offset] = Some(Resolved::Cached(rec));
                    }
                    None => missing.push(offset),
                }
            }
            if !missing.is_empty() {
                let batch = self
                    .store()
                    .read_record_range(tree, revision, chunk_last)
                    .await?;
                for offset in missing {
                    slots[offset] = batch[offset].clone().map(Resolved::Stored);
                }
            }

            for (offset, slot) in slots.into_iter().enumerate() {
                let r = revision + offset as u64;
                let record = match slot {
                    None => {
                        if r <= committed_floor {
                            return Err(RevlogError::integrity(format!(
                                "missing record {r} at or below the committed floor \
                                 {committed_floor} on {tree}"
                            )));
                        }
                        if r == 1 || (out.is_empty() && self.change(tree, 1).await?.is_none()) {
                            return Ok(None);
                        }
                        return Ok(Some(out));
                    }
                    Some(Resolved::Cached(rec)) => rec,
                    Some(Resolved::Stored(v)) if v.value.is_terminal() => {
                        let rec = Arc::new(v.value);
                        self.shared().remember_record(tree, rec.clone());
                        rec
                    }
                    Some(Resolved::Stored(v)) => self.settle_for_read(tree, v).await?,
                };
                if record.status == ChangeStatus::SuccessExecuted && !record.events.is_empty() {
                    out.push(RevisionEvents {
                        revision: r,
                        actor: record.actor.clone(),
                        events: record.events.clone(),
                    });
                }
            }
            revision = chunk_last + 1;
        }
        Ok(Some(out))
    }

    /// Looks up one change record, cheapest tier first.
    pub async fn change(
        &self,
        tree: &TreeId,
        revision: u64,
    ) -> RevlogResult<Option<Arc<ChangeRecord>>> {
        if revision == 0 {
            return Ok(None);
        }
        if let Some(rec) = self.shared().record(tree, revision) {
            self.count_record_cache(true);
            return Ok(Some(rec));
        }
        self.count_record_cache(false);
        if let Some(rec) = self.counters().fetch_record(tree, revision).await {
            let rec = Arc::new(rec);
            self.shared().remember_record(tree, rec.clone());
            return Ok(Some(rec));
        }
        match self.store().read_record(tree, revision).await? {
            None => Ok(None),
            Some(v) => {
                let rec = Arc::new(v.value);
                if rec.is_terminal() {
                    self.shared().remember_record(tree, rec.clone());
                    if self.config.cache_write_through {
                        self.counters().publish_record(tree, &rec).await;
                    }
                }
                Ok(Some(rec))
            }
        }
    }

    /// Reads a single event without loading the whole batch. The
    /// per-event rows are written after the record itself becomes
    /// durable, so a missing row falls back to the record's own list.
    pub async fn event(
        &self,
        tree: &TreeId,
        revision: u64,
        index: u32,
    ) -> RevlogResult<Option<ChangeEvent>> {
        if let Some(event) = self.store().read_event(tree, revision, index).await? {
            return Ok(Some(event));
        }
        let record = self.change(tree, revision).await?;
        Ok(record.and_then(|rec| rec.events.get(index as usize).cloned()))
    }

    /// Resolves a non-terminal record encountered by a reader. A
    /// timed-out one is recovered the same way the write path would
    /// recover it; a live one is its owner's business and the reader
    /// reports contention instead of waiting.
    async fn settle_for_read(
        &self,
        tree: &TreeId,
        observed: Versioned<ChangeRecord>,
    ) -> RevlogResult<Arc<ChangeRecord>> {
        let revision = observed.value.revision;
        observed.value.validate()?;
        if !observed
            .value
            .is_timed_out(now_ms(), self.config.change_timeout_ms)
        {
            return Err(RevlogError::contention(format!(
                "revision {revision} is still in flight"
            )));
        }
        match observed.value.status {
            ChangeStatus::Executing => {
                self.roll_forward(tree, &observed).await?;
            }
            ChangeStatus::Creating => {
                if let Some(rec) = self.finalize_timed_out(tree, &observed).await? {
                    return Ok(rec);
                }
            }
            status => {
                return Err(RevlogError::integrity(format!(
                    "terminal record {revision} ({status}) reached the recovery path"
                )));
            }
        }
        match self.store().read_record(tree, revision).await? {
            Some(fresh) if fresh.value.is_terminal() => {
                let rec = Arc::new(fresh.value);
                self.shared().remember_record(tree, rec.clone());
                Ok(rec)
            }
            Some(_) => Err(RevlogError::contention(format!(
                "revision {revision} is being recovered"
            ))),
            None => Err(RevlogError::integrity(format!(
                "record {revision} on {tree} vanished during recovery"
            ))),
        }
    }
}
