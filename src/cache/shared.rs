use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::address::TreeId;
use crate::cache::{CounterKind, RevisionBounds};
use crate::record::ChangeRecord;

struct TreeEntry {
    bounds: RevisionBounds,
    /// When the distributed tier last backed these bounds. None until the
    /// first refresh, so fresh entries always trigger one.
    refreshed_at: Option<Instant>,
}

/// Process-wide revision cache, shared by every unit of work in the
/// process. Holds one lower-bound entry per tree plus an LRU of terminal
/// records; both sit behind mutexes and are touched only briefly.
pub struct SharedRevisionCache {
    trees: Mutex<HashMap<TreeId, TreeEntry>>,
    records: Mutex<LruCache<(TreeId, u64), Arc<ChangeRecord>>>,
    refresh_interval: Duration,
}

impl SharedRevisionCache {
    pub fn new(refresh_interval: Duration, record_capacity: usize) -> Self {
        let cap = NonZeroUsize::new(record_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            trees: Mutex::new(HashMap::new()),
            records: Mutex::new(LruCache::new(cap)),
            refresh_interval,
        }
    }

    /// Current lower bounds for `tree`, plus whether they are stale and
    /// due for a distributed-tier refresh.
    pub fn bounds(&self, tree: &TreeId) -> (RevisionBounds, bool) {
        let trees = self.trees.lock();
        match trees.get(tree) {
            Some(entry) => {
                let stale = entry
                    .refreshed_at
                    .is_none_or(|at| at.elapsed() >= self.refresh_interval);
                (entry.bounds, stale)
            }
            None => (RevisionBounds::default(), true),
        }
    }

    /// Merges a local observation into the shared bounds. Does not count
    /// as a refresh.
    pub fn note(&self, tree: &TreeId, kind: CounterKind, revision: u64) {
        let mut trees = self.trees.lock();
        trees
            .entry(tree.clone())
            .or_insert_with(|| TreeEntry {
                bounds: RevisionBounds::default(),
                refreshed_at: None,
            })
            .bounds
            .note(kind, revision);
    }

    /// Merges bounds read back from the distributed tier and stamps the
    /// entry fresh.
    pub fn apply_refresh(&self, tree: &TreeId, bounds: RevisionBounds) -> RevisionBounds {
        let mut trees = self.trees.lock();
        let entry = trees.entry(tree.clone()).or_insert_with(|| TreeEntry {
            bounds: RevisionBounds::default(),
            refreshed_at: None,
        });
        entry.bounds.merge(&bounds);
        entry.refreshed_at = Some(Instant::now());
        entry.bounds
    }

    /// Caches a terminal record process-wide. Non-terminal records are
    /// ignored; they are still being rewritten by their owner.
    pub fn remember_record(&self, tree: &TreeId, record: Arc<ChangeRecord>) {
        if !record.is_terminal() {
            return;
        }
        self.note(tree, CounterKind::LastTaken, record.revision);
        self.records
            .lock()
            .put((tree.clone(), record.revision), record);
    }

    pub fn record(&self, tree: &TreeId, revision: u64) -> Option<Arc<ChangeRecord>> {
        self.records.lock().get(&(tree.clone(), revision)).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }
}
