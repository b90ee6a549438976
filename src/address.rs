use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Identity of one versioned tree. Every revision counter and every
/// ChangeRecord belongs to exactly one tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId {
    pub repository: CompactString,
    pub model: CompactString,
}

impl TreeId {
    pub fn new(repository: impl Into<CompactString>, model: impl Into<CompactString>) -> Self {
        Self {
            repository: repository.into(),
            model: model.into(),
        }
    }

    /// Address of the tree root (model granularity).
    pub fn root(&self) -> Address {
        Address::model(self.repository.clone(), self.model.clone())
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repository, self.model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Granularity {
    Repository,
    Model,
    Object,
    Field,
}

/// Hierarchical address of a node in a versioned tree, at repository,
/// model, object or field granularity. Ancestry is segment-prefix
/// containment: `/r` contains `/r/m` contains `/r/m/o` contains
/// `/r/m/o/f`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    segments: SmallVec<[CompactString; 4]>,
}

impl Address {
    pub fn repository(repository: impl Into<CompactString>) -> Self {
        Self {
            segments: SmallVec::from_iter([repository.into()]),
        }
    }

    pub fn model(repository: impl Into<CompactString>, model: impl Into<CompactString>) -> Self {
        Self {
            segments: SmallVec::from_iter([repository.into(), model.into()]),
        }
    }

    pub fn object(tree: &TreeId, object: impl Into<CompactString>) -> Self {
        Self {
            segments: SmallVec::from_iter([
                tree.repository.clone(),
                tree.model.clone(),
                object.into(),
            ]),
        }
    }

    pub fn field(
        tree: &TreeId,
        object: impl Into<CompactString>,
        field: impl Into<CompactString>,
    ) -> Self {
        Self {
            segments: SmallVec::from_iter([
                tree.repository.clone(),
                tree.model.clone(),
                object.into(),
                field.into(),
            ]),
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self.segments.len() {
            1 => Granularity::Repository,
            2 => Granularity::Model,
            3 => Granularity::Object,
            _ => Granularity::Field,
        }
    }

    /// Tree this address belongs to; None at repository granularity.
    pub fn tree_id(&self) -> Option<TreeId> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(TreeId {
            repository: self.segments[0].clone(),
            model: self.segments[1].clone(),
        })
    }

    pub fn object_id(&self) -> Option<&str> {
        self.segments.get(2).map(CompactString::as_str)
    }

    pub fn field_id(&self) -> Option<&str> {
        self.segments.get(3).map(CompactString::as_str)
    }

    pub fn parent(&self) -> Option<Address> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Address {
            segments: self.segments[..self.segments.len() - 1]
                .iter()
                .cloned()
                .collect(),
        })
    }

    /// Strict ancestry: true iff `self` is a proper prefix of `other`.
    pub fn is_ancestor_of(&self, other: &Address) -> bool {
        self.segments.len() < other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// Reflexive containment: `self` equals `other` or is an ancestor of it.
    /// A lock on `self` covers every address it contains.
    pub fn contains(&self, other: &Address) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(CompactString::as_str)
    }
}

impl fmt::Display for Address {
    /// Renders as a `/`-prefixed path, e.g. `/repo/model/obj/field`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}
