use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::{Address, TreeId};
use crate::error::{RevlogError, RevlogResult};
use crate::event::ChangeEvent;
use crate::record::ChangeRecord;
use crate::tree::NodeRecord;

use super::{CacheKey, ChangeStore, DistributedCache, NodeExpectation, Versioned, decode, encode};

#[derive(Debug, Clone)]
struct Slot {
    bytes: Vec<u8>,
    version: u64,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<(TreeId, u64), Slot>,
    events: HashMap<(TreeId, u64, u32), Vec<u8>>,
    nodes: HashMap<(TreeId, Address), Slot>,
}

/// In-memory [`ChangeStore`] with real conditional-write semantics.
/// Values are stored MessagePack-encoded, the same bytes a remote
/// backend would hold, so the codec is exercised on every operation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    next_version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl ChangeStore for MemoryStore {
    async fn create_record(&self, tree: &TreeId, record: &ChangeRecord) -> RevlogResult<u64> {
        record.validate()?;
        let bytes = encode(record)?;
        let version = self.tick();
        let mut inner = self.inner.lock();
        let key = (tree.clone(), record.revision);
        if inner.records.contains_key(&key) {
            return Err(RevlogError::contention(format!(
                "revision {} already claimed",
                record.revision
            )));
        }
        inner.records.insert(key, Slot { bytes, version });
        Ok(version)
    }

    async fn update_record(
        &self,
        tree: &TreeId,
        expected_version: u64,
        record: &ChangeRecord,
    ) -> RevlogResult<u64> {
        record.validate()?;
        let bytes = encode(record)?;
        let version = self.tick();
        let mut inner = self.inner.lock();
        let key = (tree.clone(), record.revision);
        let Some(slot) = inner.records.get_mut(&key) else {
            return Err(RevlogError::integrity(format!(
                "updating missing record at revision {}",
                record.revision
            )));
        };
        if slot.version != expected_version {
            return Err(RevlogError::contention(format!(
                "record {} rewritten concurrently",
                record.revision
            )));
        }
        *slot = Slot { bytes, version };
        Ok(version)
    }

    async fn read_record(
        &self,
        tree: &TreeId,
        revision: u64,
    ) -> RevlogResult<Option<Versioned<ChangeRecord>>> {
        let slot = {
            let inner = self.inner.lock();
            inner.records.get(&(tree.clone(), revision)).cloned()
        };
        slot.map(|s| Ok(Versioned::new(decode(&s.bytes)?, s.version)))
            .transpose()
    }

    async fn read_record_range(
        &self,
        tree: &TreeId,
        first: u64,
        last: u64,
    ) -> RevlogResult<Vec<Option<Versioned<ChangeRecord>>>> {
        if first > last {
            return Ok(Vec::new());
        }
        let slots: Vec<Option<Slot>> = {
            let inner = self.inner.lock();
            (first..=last)
                .map(|rev| inner.records.get(&(tree.clone(), rev)).cloned())
                .collect()
        };
        slots
            .into_iter()
            .map(|slot| {
                slot.map(|s| Ok(Versioned::new(decode(&s.bytes)?, s.version)))
                    .transpose()
            })
            .collect()
    }

    async fn put_event(
        &self,
        tree: &TreeId,
        revision: u64,
        index: u32,
        event: &ChangeEvent,
    ) -> RevlogResult<()> {
        let bytes = encode(event)?;
        self.inner
            .lock()
            .events
            .insert((tree.clone(), revision, index), bytes);
        Ok(())
    }

    async fn read_event(
        &self,
        tree: &TreeId,
        revision: u64,
        index: u32,
    ) -> RevlogResult<Option<ChangeEvent>> {
        let bytes = {
            let inner = self.inner.lock();
            inner.events.get(&(tree.clone(), revision, index)).cloned()
        };
        bytes.map(|b| decode(&b)).transpose()
    }

    async fn read_node(
        &self,
        tree: &TreeId,
        address: &Address,
    ) -> RevlogResult<Option<Versioned<NodeRecord>>> {
        let slot = {
            let inner = self.inner.lock();
            inner.nodes.get(&(tree.clone(), address.clone())).cloned()
        };
        slot.map(|s| Ok(Versioned::new(decode(&s.bytes)?, s.version)))
            .transpose()
    }

    async fn write_node(
        &self,
        tree: &TreeId,
        address: &Address,
        expected: NodeExpectation,
        node: &NodeRecord,
    ) -> RevlogResult<u64> {
        let bytes = encode(node)?;
        let version = self.tick();
        let mut inner = self.inner.lock();
        let key = (tree.clone(), address.clone());
        let current = inner.nodes.get(&key);
        match (expected, current) {
            (NodeExpectation::Absent, Some(_)) => {
                return Err(RevlogError::contention(format!(
                    "node {address} created concurrently"
                )));
            }
            (NodeExpectation::Version(v), Some(slot)) if slot.version != v => {
                return Err(RevlogError::contention(format!(
                    "node {address} rewritten concurrently"
                )));
            }
            (NodeExpectation::Version(_), None) => {
                return Err(RevlogError::contention(format!(
                    "node {address} vanished under conditional write"
                )));
            }
            _ => {}
        }
        inner.nodes.insert(key, Slot { bytes, version });
        Ok(version)
    }
}

/// In-memory [`DistributedCache`]. Conditional semantics match a
/// memcache-style compare-and-set on the raw value bytes.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry, simulating an eviction-prone cache losing its
    /// contents. Counters must survive this by design.
    pub fn flush(&self) {
        self.entries.lock().clear();
    }
}

#[async_trait]
impl DistributedCache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> RevlogResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put_if_absent(&self, key: &CacheKey, value: Vec<u8>) -> RevlogResult<bool> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.clone(), value);
        Ok(true)
    }

    async fn put_if_unchanged(
        &self,
        key: &CacheKey,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> RevlogResult<bool> {
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(Vec::as_slice);
        if current != expected {
            return Ok(false);
        }
        entries.insert(key.clone(), value);
        Ok(true)
    }
}
