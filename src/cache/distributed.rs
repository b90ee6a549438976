use std::sync::Arc;
use tracing::{debug, warn};

use crate::address::TreeId;
use crate::cache::{CounterKind, RevisionBounds};
use crate::record::ChangeRecord;
use crate::store::{CacheKey, DistributedCache, decode, encode};

/// Give up raising a counter after this many lost compare-and-sets; the
/// value that beat us is at least as high as ours.
const MAX_RAISE_RACES: usize = 8;

/// Counter and record traffic against the distributed cache tier.
///
/// Everything here is advisory: the backing store is the source of
/// truth, so cache failures are logged and absorbed, never propagated
/// into a command's outcome. Counters only ever move up; a raise that
/// loses its race to a higher value simply stops.
pub struct DistributedCounters<C> {
    cache: Arc<C>,
}

impl<C> Clone for DistributedCounters<C> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<C: DistributedCache> DistributedCounters<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }

    /// Reads all three counters of `tree`. Missing or unreadable entries
    /// count as zero, which is always a valid lower bound.
    pub async fn read_bounds(&self, tree: &TreeId) -> RevisionBounds {
        let taken = self.read_counter(tree, CounterKind::LastTaken).await;
        let committed = self.read_counter(tree, CounterKind::LastCommitted).await;
        let current = self.read_counter(tree, CounterKind::Current).await;
        RevisionBounds::new(taken, committed, current)
    }

    async fn read_counter(&self, tree: &TreeId, kind: CounterKind) -> u64 {
        let key = CacheKey::Counter {
            tree: tree.clone(),
            kind,
        };
        let bytes = match self.cache.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return 0,
            Err(err) => {
                warn!(%key, error = %err, "counter read failed; using zero bound");
                return 0;
            }
        };
        match decode::<u64>(&bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(%key, error = %err, "counter entry undecodable; using zero bound");
                0
            }
        }
    }

    /// Raises `kind` to at least `value`, dragging the counters above it
    /// along so the stored state keeps `current <= last_committed <=
    /// last_taken`. Written top-down for readers that fetch entries one
    /// at a time.
    pub async fn raise(&self, tree: &TreeId, kind: CounterKind, value: u64) {
        let chain: &[CounterKind] = match kind {
            CounterKind::LastTaken => &[CounterKind::LastTaken],
            CounterKind::LastCommitted => {
                &[CounterKind::LastTaken, CounterKind::LastCommitted]
            }
            CounterKind::Current => &[
                CounterKind::LastTaken,
                CounterKind::LastCommitted,
                CounterKind::Current,
            ],
        };
        for k in chain {
            self.raise_one(tree, *k, value).await;
        }
    }

    async fn raise_one(&self, tree: &TreeId, kind: CounterKind, value: u64) {
        let key = CacheKey::Counter {
            tree: tree.clone(),
            kind,
        };
        let encoded = match encode(&value) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%key, error = %err, "counter encode failed");
                return;
            }
        };
        for _ in 0..MAX_RAISE_RACES {
            let stored = match self.cache.get(&key).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(%key, error = %err, "counter read failed; raise skipped");
                    return;
                }
            };
            // An unreadable stored value is treated as zero and
            // overwritten; a readable one that already meets the target
            // ends the raise.
            if let Some(bytes) = &stored
                && decode::<u64>(bytes).is_ok_and(|stored| stored >= value)
            {
                return;
            }
            let written = self
                .cache
                .put_if_unchanged(&key, stored.as_deref(), encoded.clone())
                .await;
            match written {
                Ok(true) => return,
                Ok(false) => continue,
                Err(err) => {
                    warn!(%key, error = %err, "counter write failed; raise skipped");
                    return;
                }
            }
        }
        debug!(%key, value, "counter raise gave up after repeated races");
    }

    /// Publishes a terminal record so other processes can skip a store
    /// read. Terminal records are immutable, so put-if-absent is exact.
    pub async fn publish_record(&self, tree: &TreeId, record: &ChangeRecord) {
        if !record.is_terminal() {
            return;
        }
        let key = CacheKey::Record {
            tree: tree.clone(),
            revision: record.revision,
        };
        let encoded = match encode(record) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%key, error = %err, "record encode failed");
                return;
            }
        };
        if let Err(err) = self.cache.put_if_absent(&key, encoded).await {
            warn!(%key, error = %err, "record publish failed");
        }
    }

    pub async fn fetch_record(&self, tree: &TreeId, revision: u64) -> Option<ChangeRecord> {
        let key = CacheKey::Record {
            tree: tree.clone(),
            revision,
        };
        let bytes = match self.cache.get(&key).await {
            Ok(bytes) => bytes?,
            Err(err) => {
                warn!(%key, error = %err, "record fetch failed");
                return None;
            }
        };
        match decode::<ChangeRecord>(&bytes) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(%key, error = %err, "cached record undecodable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DistributedCounters;
    use crate::address::{Address, TreeId};
    use crate::cache::CounterKind;
    use crate::command::ActorId;
    use crate::lock::LockSet;
    use crate::record::{ChangeRecord, ChangeStatus};
    use crate::store::{CacheKey, DistributedCache, MemoryCache};
    use std::sync::Arc;

    fn tree() -> TreeId {
        TreeId::new("repo", "model")
    }

    fn counters() -> (DistributedCounters<MemoryCache>, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        (DistributedCounters::new(Arc::clone(&cache)), cache)
    }

    #[tokio::test]
    async fn raise_cascades_and_reads_back() {
        let (counters, _) = counters();
        counters.raise(&tree(), CounterKind::Current, 5).await;

        let bounds = counters.read_bounds(&tree()).await;
        assert_eq!(bounds.current(), 5);
        assert_eq!(bounds.last_committed(), 5);
        assert_eq!(bounds.last_taken(), 5);

        counters.raise(&tree(), CounterKind::LastTaken, 9).await;
        let bounds = counters.read_bounds(&tree()).await;
        assert_eq!(bounds.last_taken(), 9);
        assert_eq!(bounds.current(), 5);
    }

    #[tokio::test]
    async fn raise_never_lowers() {
        let (counters, _) = counters();
        counters.raise(&tree(), CounterKind::LastTaken, 9).await;
        counters.raise(&tree(), CounterKind::LastTaken, 3).await;
        assert_eq!(counters.read_bounds(&tree()).await.last_taken(), 9);
    }

    #[tokio::test]
    async fn empty_cache_reads_as_zero_bounds() {
        let (counters, _) = counters();
        let bounds = counters.read_bounds(&tree()).await;
        assert_eq!(bounds.last_taken(), 0);
        assert_eq!(bounds.current(), 0);
    }

    #[tokio::test]
    async fn poisoned_counter_is_overwritten() {
        let (counters, cache) = counters();
        let key = CacheKey::Counter {
            tree: tree(),
            kind: CounterKind::LastTaken,
        };
        cache
            .put_if_absent(&key, b"garbage".to_vec())
            .await
            .unwrap();
        assert_eq!(counters.read_bounds(&tree()).await.last_taken(), 0);

        counters.raise(&tree(), CounterKind::LastTaken, 4).await;
        assert_eq!(counters.read_bounds(&tree()).await.last_taken(), 4);
    }

    #[tokio::test]
    async fn publishes_terminal_records_only() {
        let (counters, _) = counters();
        let locks = LockSet::new([Address::object(&tree(), "o1")]);
        let creating = ChangeRecord::allocate(1, locks.clone(), ActorId::new("a"), 10);
        counters.publish_record(&tree(), &creating).await;
        assert!(counters.fetch_record(&tree(), 1).await.is_none());

        let mut terminal = ChangeRecord::allocate(2, locks, ActorId::new("a"), 10);
        terminal.commit(ChangeStatus::SuccessNoChange, 20).unwrap();
        counters.publish_record(&tree(), &terminal).await;
        assert_eq!(counters.fetch_record(&tree(), 2).await, Some(terminal));
    }
}
