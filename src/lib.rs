pub mod address;
pub mod cache;
pub mod command;
pub mod commit;
pub mod config;
pub mod error;
pub mod event;
pub mod lock;
pub mod record;
pub mod store;
pub mod tree;

pub use crate::address::{Address, Granularity, TreeId};
pub use crate::cache::{
    CounterKind, DistributedCounters, LocalRevisionCache, RevisionBounds, SharedRevisionCache,
};
pub use crate::command::{ActorId, ChangeOp, Command};
pub use crate::commit::{
    ChangeOrchestrator, CommitOutcome, OrchestratorMetrics, RecoveryOutcome, RevisionEvents,
};
pub use crate::config::RevlogConfig;
pub use crate::error::{RevlogError, RevlogErrorCode, RevlogResult};
pub use crate::event::ChangeEvent;
pub use crate::lock::LockSet;
pub use crate::record::{ChangeRecord, ChangeStatus};
pub use crate::store::{
    CacheKey, ChangeStore, DistributedCache, MemoryCache, MemoryStore, NodeExpectation, Versioned,
};
pub use crate::tree::{FieldSlot, NodeRecord, Value};
