use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field value in the generic entity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Text(CompactString),
    Integer(i64),
    Boolean(bool),
    Blob(Vec<u8>),
}

impl Value {
    pub fn text(s: impl Into<CompactString>) -> Self {
        Self::Text(s.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Boolean(_) => "boolean",
            Self::Blob(_) => "blob",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Blob(bytes) => write!(f, "blob({} bytes)", bytes.len()),
        }
    }
}

/// One field of a node. `value: None` is a cleared-field tombstone; the
/// entry stays in the map so its revision stamp keeps guarding against
/// stale redo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSlot {
    pub value: Option<Value>,
    pub revision: u64,
}

/// Persisted protocol state of one tree node.
///
/// `revision` stamps the creation or removal of the node itself;
/// `child_revision` is the running max of revisions that changed anything
/// directly beneath it. Both only ever grow. A removed node stays behind
/// as a `live: false` tombstone so that a delayed redo of an older
/// revision cannot resurrect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub revision: u64,
    pub child_revision: u64,
    pub live: bool,
    pub fields: BTreeMap<CompactString, FieldSlot>,
}

impl NodeRecord {
    /// Fresh live incarnation created at `revision`. Fields start empty;
    /// any surviving older slots belong to a dead incarnation.
    pub fn created(revision: u64, child_revision: u64) -> Self {
        Self {
            revision,
            child_revision,
            live: true,
            fields: BTreeMap::new(),
        }
    }

    /// Removal tombstone written at `revision`.
    pub fn removed(revision: u64, child_revision: u64) -> Self {
        Self {
            revision,
            child_revision,
            live: false,
            fields: BTreeMap::new(),
        }
    }

    /// Current value of a field, if the node is live and the field is set.
    pub fn field(&self, name: &str) -> Option<&Value> {
        if !self.live {
            return None;
        }
        self.fields.get(name).and_then(|slot| slot.value.as_ref())
    }

    pub fn field_revision(&self, name: &str) -> Option<u64> {
        self.fields.get(name).map(|slot| slot.revision)
    }

    /// Applies a field write for `revision`, returning false when the
    /// stamp guard says the effect already happened (slot stamp at or past
    /// the revision) or was superseded by a later incarnation.
    pub fn apply_field(
        &mut self,
        name: &str,
        value: Option<Value>,
        revision: u64,
    ) -> bool {
        if self.revision > revision || !self.live {
            return false;
        }
        if let Some(slot) = self.fields.get(name)
            && slot.revision >= revision
        {
            return false;
        }
        self.fields
            .insert(CompactString::from(name), FieldSlot { value, revision });
        self.child_revision = self.child_revision.max(revision);
        true
    }

    /// Records that something directly beneath this node changed at
    /// `revision`. Returns false when the cached stamp already covers it.
    pub fn note_child_change(&mut self, revision: u64) -> bool {
        if self.child_revision >= revision {
            return false;
        }
        self.child_revision = revision;
        true
    }
}
