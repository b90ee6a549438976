use crate::address::Address;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Set of subtree locks claimed by one change. Two locks conflict when
/// either address contains the other, so holding `/r/m/o` excludes both
/// `/r/m/o/f` and `/r/m`.
///
/// The set is kept normalized: sorted, deduplicated, and minimal (no
/// member is contained by another member). Normalization never changes
/// the covered region, it only drops redundant entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSet {
    members: SmallVec<[Address; 4]>,
}

impl LockSet {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        let mut members: SmallVec<[Address; 4]> = addresses.into_iter().collect();
        members.sort();
        members.dedup();
        let minimal: SmallVec<[Address; 4]> = members
            .iter()
            .filter(|candidate| {
                !members
                    .iter()
                    .any(|other| *candidate != other && other.is_ancestor_of(candidate))
            })
            .cloned()
            .collect();
        Self { members: minimal }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.members.iter()
    }

    /// True iff some member covers `address` (equal or ancestor).
    pub fn covers(&self, address: &Address) -> bool {
        self.members.iter().any(|m| m.contains(address))
    }

    /// Two sets conflict when any pair of members overlaps in either
    /// direction. Changes with conflicting sets must not run concurrently.
    pub fn conflicts_with(&self, other: &LockSet) -> bool {
        self.members.iter().any(|a| {
            other
                .members
                .iter()
                .any(|b| a.contains(b) || b.contains(a))
        })
    }
}

impl FromIterator<Address> for LockSet {
    fn from_iter<I: IntoIterator<Item = Address>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{member}")?;
        }
        write!(f, "}}")
    }
}
