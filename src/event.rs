use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tree::Value;

/// One durable effect of an executed change. Events carry absolute
/// post-state (never deltas), so replaying them during roll-forward is
/// naturally idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    ObjectCreated {
        object: CompactString,
    },
    ObjectRemoved {
        object: CompactString,
    },
    /// `value: None` records that the field was cleared.
    FieldSet {
        object: CompactString,
        field: CompactString,
        value: Option<Value>,
    },
}

impl ChangeEvent {
    pub fn object(&self) -> &str {
        match self {
            Self::ObjectCreated { object }
            | Self::ObjectRemoved { object }
            | Self::FieldSet { object, .. } => object,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ObjectCreated { .. } => "object_created",
            Self::ObjectRemoved { .. } => "object_removed",
            Self::FieldSet { .. } => "field_set",
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjectCreated { object } => write!(f, "created {object}"),
            Self::ObjectRemoved { object } => write!(f, "removed {object}"),
            Self::FieldSet {
                object,
                field,
                value: Some(v),
            } => write!(f, "set {object}.{field} = {v}"),
            Self::FieldSet {
                object,
                field,
                value: None,
            } => write!(f, "cleared {object}.{field}"),
        }
    }
}
