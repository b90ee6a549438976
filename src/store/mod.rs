//! Backend seams: the transactional record/node store and the
//! distributed cache. Everything the protocol needs from the outside
//! world is one of these two traits; the in-memory implementations in
//! [`memory`] back the test suite and embedded use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

use crate::address::{Address, TreeId};
use crate::cache::CounterKind;
use crate::error::{RevlogError, RevlogResult};
use crate::event::ChangeEvent;
use crate::record::ChangeRecord;
use crate::tree::NodeRecord;

/// A stored value together with the backend's entity version, the token
/// conditional writes compare against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }
}

/// Precondition of a conditional node write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeExpectation {
    /// No record may exist at the address yet.
    Absent,
    /// The stored record must still carry this entity version.
    Version(u64),
    /// Unconditional overwrite. Used only where a lost race is harmless.
    Any,
}

/// Key of one distributed-cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Counter { tree: TreeId, kind: CounterKind },
    Record { tree: TreeId, revision: u64 },
}

impl fmt::Display for CacheKey {
    /// Stable rendering usable directly as a memcache-style string key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter { tree, kind } => {
                write!(f, "revlog:ctr:{tree}:{}", kind.as_str())
            }
            Self::Record { tree, revision } => {
                write!(f, "revlog:rec:{tree}:{revision}")
            }
        }
    }
}

/// Transactional store holding ChangeRecords, per-event sub-records and
/// tree-node records. All writes are single-key compare-and-swaps; a
/// lost swap surfaces as [`RevlogError::Contention`] and the protocol
/// loops treat it as an ordinary outcome, not a failure.
#[async_trait]
pub trait ChangeStore: Send + Sync + 'static {
    /// Claims the record's revision slot, put-if-absent. Returns the new
    /// entity version; contention when the slot is already taken.
    async fn create_record(&self, tree: &TreeId, record: &ChangeRecord) -> RevlogResult<u64>;

    /// Rewrites an existing record, put-if-unchanged against
    /// `expected_version`. Contention when someone got there first.
    async fn update_record(
        &self,
        tree: &TreeId,
        expected_version: u64,
        record: &ChangeRecord,
    ) -> RevlogResult<u64>;

    async fn read_record(
        &self,
        tree: &TreeId,
        revision: u64,
    ) -> RevlogResult<Option<Versioned<ChangeRecord>>>;

    /// Batched read of revisions `first..=last`; `result[i]` is the
    /// record at `first + i`. Callers bound the window themselves.
    async fn read_record_range(
        &self,
        tree: &TreeId,
        first: u64,
        last: u64,
    ) -> RevlogResult<Vec<Option<Versioned<ChangeRecord>>>>;

    /// Publishes one event under (revision, index) so a single event can
    /// be read without loading the whole record. Duplicate publishes of
    /// the same immutable payload are fine.
    async fn put_event(
        &self,
        tree: &TreeId,
        revision: u64,
        index: u32,
        event: &ChangeEvent,
    ) -> RevlogResult<()>;

    async fn read_event(
        &self,
        tree: &TreeId,
        revision: u64,
        index: u32,
    ) -> RevlogResult<Option<ChangeEvent>>;

    async fn read_node(
        &self,
        tree: &TreeId,
        address: &Address,
    ) -> RevlogResult<Option<Versioned<NodeRecord>>>;

    /// Conditional node write. Removal writes tombstone records rather
    /// than deleting, so every live address keeps a comparable version.
    async fn write_node(
        &self,
        tree: &TreeId,
        address: &Address,
        expected: NodeExpectation,
        node: &NodeRecord,
    ) -> RevlogResult<u64>;
}

/// Distributed cache with the two conditional writes the counter
/// protocol needs. Values are opaque bytes; this crate stores
/// MessagePack payloads in them.
#[async_trait]
pub trait DistributedCache: Send + Sync + 'static {
    async fn get(&self, key: &CacheKey) -> RevlogResult<Option<Vec<u8>>>;

    /// True if the write happened, false if some value was already there.
    async fn put_if_absent(&self, key: &CacheKey, value: Vec<u8>) -> RevlogResult<bool>;

    /// Replaces the entry only while it still holds `expected`
    /// (`None` = entry absent). True if the write happened.
    async fn put_if_unchanged(
        &self,
        key: &CacheKey,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> RevlogResult<bool>;
}

pub fn encode<T: Serialize>(value: &T) -> RevlogResult<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| RevlogError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RevlogResult<T> {
    rmp_serde::from_slice(bytes).map_err(|e| RevlogError::Decode(e.to_string()))
}

mod memory;

pub use memory::{MemoryCache, MemoryStore};
