use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::RevisionBounds;
use crate::record::ChangeRecord;

/// Exact, unshared revision cache owned by one unit of work (one
/// orchestrator call). Read-your-own-writes: everything this unit
/// learned or wrote during its run is visible here without any lock.
#[derive(Debug, Default)]
pub struct LocalRevisionCache {
    bounds: RevisionBounds,
    records: HashMap<u64, Arc<ChangeRecord>>,
}

impl LocalRevisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the unit with the lower bounds known process-wide.
    pub fn seeded(bounds: RevisionBounds) -> Self {
        Self {
            bounds,
            records: HashMap::new(),
        }
    }

    pub fn bounds(&self) -> &RevisionBounds {
        &self.bounds
    }

    pub fn bounds_mut(&mut self) -> &mut RevisionBounds {
        &mut self.bounds
    }

    /// Remembers a terminal record this unit observed. Non-terminal
    /// records are deliberately not kept: they can change under us.
    pub fn remember(&mut self, record: Arc<ChangeRecord>) {
        if !record.is_terminal() {
            return;
        }
        self.bounds.note_taken(record.revision);
        self.records.insert(record.revision, record);
    }

    pub fn record(&self, revision: u64) -> Option<&Arc<ChangeRecord>> {
        self.records.get(&revision)
    }

    pub fn terminal_count(&self) -> usize {
        self.records.len()
    }
}
