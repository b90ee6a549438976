//! The three revision-counter tiers. [`local`] is exact within one unit
//! of work, [`shared`] is one lock-guarded lower bound per process,
//! [`distributed`] wraps the conditional-write protocol against the
//! external cache. Every tier stores lower bounds that only move up.

use serde::{Deserialize, Serialize};

mod distributed;
mod local;
mod shared;

pub use distributed::DistributedCounters;
pub use local::LocalRevisionCache;
pub use shared::SharedRevisionCache;

/// Which of the three per-tree counters a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterKind {
    LastTaken,
    LastCommitted,
    Current,
}

impl CounterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastTaken => "last_taken",
            Self::LastCommitted => "last_committed",
            Self::Current => "current",
        }
    }
}

/// Lower bounds on the three revision counters of one tree, maintaining
/// `current <= last_committed <= last_taken` at all times.
///
/// `last_taken` bounds the highest revision any process tried to claim;
/// `last_committed` bounds the prefix of the log that is entirely
/// terminal; `current` bounds the highest revision that actually mutated
/// the tree. Raising one counter drags the ones above it along so the
/// invariant never breaks; writes that would lower a counter are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionBounds {
    last_taken: u64,
    last_committed: u64,
    current: u64,
}

impl RevisionBounds {
    pub fn new(last_taken: u64, last_committed: u64, current: u64) -> Self {
        let mut bounds = Self::default();
        bounds.note_taken(last_taken);
        bounds.note_committed(last_committed);
        bounds.note_current(current);
        bounds
    }

    pub fn last_taken(&self) -> u64 {
        self.last_taken
    }

    pub fn last_committed(&self) -> u64 {
        self.last_committed
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn get(&self, kind: CounterKind) -> u64 {
        match kind {
            CounterKind::LastTaken => self.last_taken,
            CounterKind::LastCommitted => self.last_committed,
            CounterKind::Current => self.current,
        }
    }

    /// Records that revision `r` was claimed. Returns true if anything moved.
    pub fn note_taken(&mut self, r: u64) -> bool {
        if r <= self.last_taken {
            return false;
        }
        self.last_taken = r;
        true
    }

    /// Records that every revision up to `r` is terminal.
    pub fn note_committed(&mut self, r: u64) -> bool {
        if r <= self.last_committed {
            return false;
        }
        self.last_committed = r;
        self.last_taken = self.last_taken.max(r);
        true
    }

    /// Records that revision `r` reached `SuccessExecuted`.
    pub fn note_current(&mut self, r: u64) -> bool {
        if r <= self.current {
            return false;
        }
        self.current = r;
        self.last_committed = self.last_committed.max(r);
        self.last_taken = self.last_taken.max(r);
        true
    }

    pub fn note(&mut self, kind: CounterKind, r: u64) -> bool {
        match kind {
            CounterKind::LastTaken => self.note_taken(r),
            CounterKind::LastCommitted => self.note_committed(r),
            CounterKind::Current => self.note_current(r),
        }
    }

    /// Folds in another observation of the same tree, field-wise max.
    pub fn merge(&mut self, other: &RevisionBounds) -> bool {
        let taken = self.note_taken(other.last_taken);
        let committed = self.note_committed(other.last_committed);
        let current = self.note_current(other.current);
        taken || committed || current
    }

    pub fn is_consistent(&self) -> bool {
        self.current <= self.last_committed && self.last_committed <= self.last_taken
    }
}
