//! Planning merges of resource collections read from user or system scope
//!
//! Entries are identified by a key plus a stamp (the creation time), so a
//! resource recreated under the same key is treated as a different entry.

use crate::types::Scope;
use std::fmt::Debug;

/// Identity of an entry in a scoped collection
pub trait Identity {
    type Key: PartialEq + Clone + Debug;
    type Stamp: PartialEq;

    /// Natural key
    fn key(&self) -> Self::Key;

    /// Disambiguates reuse of the same key by a recreated resource
    fn stamp(&self) -> Self::Stamp;
}

/// An entry that may have been discovered by the installation itself
pub trait ScopedEntry: Identity {
    fn is_autodetected(&self) -> bool;
}

/// Outcome of [`plan_merge`]
///
/// Indices in `drop`, `preserve` and the first member of `update` refer to
/// the existing collection. Indices in `add` and the second member of
/// `update` refer to the incoming data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub drop: Vec<usize>,
    pub preserve: Vec<usize>,
    pub update: Vec<(usize, usize)>,
    pub add: Vec<usize>,
}

impl MergePlan {
    /// Check if applying the plan would change nothing but field values
    pub fn is_structural_noop(&self) -> bool {
        self.drop.is_empty() && self.add.is_empty()
    }
}

/// Decide what to do with each existing and incoming entry
///
/// - An existing entry missing from `incoming` (by key and stamp) is dropped
///   when reading user scope, or when it is auto-detected and system scope
///   no longer lists it. User-created entries survive a system refresh.
/// - An auto-detected entry still listed by system scope is preserved as is,
///   keeping the user's customizations, and its incoming copy is discarded.
/// - Other existing entries are updated from incoming user data sharing their
///   key. System scope never overrides a user-created entry.
/// - Remaining incoming entries are added.
///
/// Duplicate keys in `incoming` collapse to the last occurrence.
pub fn plan_merge<E, I>(existing: &[E], incoming: &[I], scope: Scope) -> MergePlan
where
    E: ScopedEntry,
    I: Identity<Key = E::Key, Stamp = E::Stamp>,
{
    let mut remaining: Vec<usize> = Vec::new();
    for (j, entry) in incoming.iter().enumerate() {
        let key = entry.key();
        match remaining.iter().position(|&r| incoming[r].key() == key) {
            Some(pos) => remaining[pos] = j,
            None => remaining.push(j),
        }
    }

    let mut plan = MergePlan::default();
    let mut kept: Vec<(usize, E::Key)> = Vec::new();

    for (i, entry) in existing.iter().enumerate() {
        let key = entry.key();
        let matching = remaining.iter().position(|&r| incoming[r].key() == key);
        let in_new = matching.is_some_and(|pos| incoming[remaining[pos]].stamp() == entry.stamp());
        let autodetected = entry.is_autodetected();

        if !in_new && (scope == Scope::User || autodetected) {
            log::debug!("Dropping {key:?}");
            plan.drop.push(i);
        } else if autodetected && scope == Scope::System {
            log::debug!("Preserving user configuration of {key:?}");
            if let Some(pos) = matching {
                remaining.remove(pos);
            }
            plan.preserve.push(i);
        } else {
            kept.push((i, key));
        }
    }

    for j in remaining {
        let key = incoming[j].key();
        match kept.iter().find(|(_, k)| *k == key) {
            Some(_) if scope == Scope::System => {
                log::warn!("Not overriding user-defined {key:?} with system settings");
            }
            Some(&(i, _)) => {
                log::debug!("Updating {key:?}");
                plan.update.push((i, j));
            }
            None => {
                log::debug!("Adding {key:?}");
                plan.add.push(j);
            }
        }
    }

    plan
}
