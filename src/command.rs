use crate::address::{Address, TreeId};
use crate::error::{RevlogError, RevlogResult};
use crate::lock::LockSet;
use crate::tree::Value;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Identity of the process or user a change originates from. Recorded on
/// the ChangeRecord so operators can tell whose change timed out.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(CompactString);

impl ActorId {
    pub fn new(id: impl Into<CompactString>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One atomic operation within a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    CreateObject {
        object: CompactString,
    },
    RemoveObject {
        object: CompactString,
    },
    /// `value: None` clears the field.
    SetField {
        object: CompactString,
        field: CompactString,
        value: Option<Value>,
    },
}

impl ChangeOp {
    pub fn create(object: impl Into<CompactString>) -> Self {
        Self::CreateObject {
            object: object.into(),
        }
    }

    pub fn remove(object: impl Into<CompactString>) -> Self {
        Self::RemoveObject {
            object: object.into(),
        }
    }

    pub fn set(
        object: impl Into<CompactString>,
        field: impl Into<CompactString>,
        value: Value,
    ) -> Self {
        Self::SetField {
            object: object.into(),
            field: field.into(),
            value: Some(value),
        }
    }

    pub fn clear(object: impl Into<CompactString>, field: impl Into<CompactString>) -> Self {
        Self::SetField {
            object: object.into(),
            field: field.into(),
            value: None,
        }
    }

    pub fn object(&self) -> &str {
        match self {
            Self::CreateObject { object }
            | Self::RemoveObject { object }
            | Self::SetField { object, .. } => object,
        }
    }

    /// Address the operation writes to, which is also the lock it needs.
    /// Create/remove claim the object subtree, a field write claims only
    /// the field.
    pub fn target_address(&self, tree: &TreeId) -> Address {
        match self {
            Self::CreateObject { object } | Self::RemoveObject { object } => {
                Address::object(tree, object.clone())
            }
            Self::SetField { object, field, .. } => {
                Address::field(tree, object.clone(), field.clone())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateObject { .. } => "create_object",
            Self::RemoveObject { .. } => "remove_object",
            Self::SetField { .. } => "set_field",
        }
    }
}

/// A batch of operations committed atomically under one revision of one
/// tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub tree: TreeId,
    pub ops: SmallVec<[ChangeOp; 4]>,
}

impl Command {
    pub fn new(tree: TreeId, ops: impl IntoIterator<Item = ChangeOp>) -> Self {
        Self {
            tree,
            ops: ops.into_iter().collect(),
        }
    }

    pub fn single(tree: TreeId, op: ChangeOp) -> Self {
        Self::new(tree, [op])
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Shape check before any backend work. An empty batch is rejected
    /// here rather than burning a revision on it.
    pub fn validate_shape(&self) -> RevlogResult<()> {
        if self.ops.is_empty() {
            return Err(RevlogError::InvalidCommand {
                message: "command has no operations".to_string(),
            });
        }
        for op in &self.ops {
            if op.object().is_empty() {
                return Err(RevlogError::InvalidCommand {
                    message: format!("{} with empty object id", op.kind()),
                });
            }
            if let ChangeOp::SetField { field, .. } = op
                && field.is_empty()
            {
                return Err(RevlogError::InvalidCommand {
                    message: "set_field with empty field name".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Minimal lock set covering every operation's target.
    pub fn lock_set(&self) -> LockSet {
        self.ops
            .iter()
            .map(|op| op.target_address(&self.tree))
            .collect()
    }
}
