//! The delta record types for keyed and ordered collections.
//!
//! A [`Change`] describes one mutation of a keyed collection; a [`ListChange`]
//! describes one mutation of an ordered collection. Both are plain data:
//! construction is total, access is read-only, and the payload shape encodes
//! what each reason requires (an `Update` cannot exist without its previous
//! value, a `Moved` cannot exist without both indices).

use serde::{Deserialize, Serialize};

/// The kind of mutation a keyed [`Change`] describes.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ChangeReason {
    /// A key became present.
    Add,
    /// A present key received a new value.
    Update,
    /// A key became absent.
    Remove,
    /// A present value signalled that its observable properties changed.
    Refresh,
    /// A key changed position in a sorted view.
    Moved,
}

/// One delta applied to a keyed collection.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Change<K, V> {
    /// `key` became present with value `current`.
    Add {
        /// The key that became present.
        key: K,
        /// The value now held under `key`.
        current: V,
    },
    /// `key` was present and its value was replaced.
    Update {
        /// The key whose value changed.
        key: K,
        /// The value now held under `key`.
        current: V,
        /// The value previously held under `key`.
        previous: V,
    },
    /// `key` became absent.
    Remove {
        /// The key that became absent.
        key: K,
        /// The value held under `key` before removal.
        previous: V,
    },
    /// The value under `key` signalled a change without being replaced.
    Refresh {
        /// The key whose value signalled.
        key: K,
        /// The (unchanged) value held under `key`.
        current: V,
    },
    /// `key` changed position in a sorted view.
    Moved {
        /// The key that moved.
        key: K,
        /// The value held under `key`.
        current: V,
        /// The position after the move.
        current_index: usize,
        /// The position before the move.
        previous_index: usize,
    },
}

impl<K, V> Change<K, V> {
    /// The kind of mutation this change describes.
    pub fn reason(&self) -> ChangeReason {
        match self {
            Change::Add { .. } => ChangeReason::Add,
            Change::Update { .. } => ChangeReason::Update,
            Change::Remove { .. } => ChangeReason::Remove,
            Change::Refresh { .. } => ChangeReason::Refresh,
            Change::Moved { .. } => ChangeReason::Moved,
        }
    }

    /// The key this change applies to.
    pub fn key(&self) -> &K {
        match self {
            Change::Add { key, .. }
            | Change::Update { key, .. }
            | Change::Remove { key, .. }
            | Change::Refresh { key, .. }
            | Change::Moved { key, .. } => key,
        }
    }

    /// The value now held under the key, absent for removals.
    pub fn current(&self) -> Option<&V> {
        match self {
            Change::Add { current, .. }
            | Change::Update { current, .. }
            | Change::Refresh { current, .. }
            | Change::Moved { current, .. } => Some(current),
            Change::Remove { .. } => None,
        }
    }

    /// The value previously held under the key, where the change records one.
    pub fn previous(&self) -> Option<&V> {
        match self {
            Change::Update { previous, .. } | Change::Remove { previous, .. } => Some(previous),
            _ => None,
        }
    }
}

/// One delta applied to an ordered collection.
///
/// Range variants carry a contiguous block and its starting index; their
/// per-item effect is reflected in the counters of a
/// [`ListChangeSet`](crate::ListChangeSet).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum ListChange<T> {
    /// `item` was inserted at `index`.
    Add {
        /// The inserted item.
        item: T,
        /// The insertion position.
        index: usize,
    },
    /// A contiguous block was inserted starting at `index`.
    AddRange {
        /// The inserted items, in order.
        items: Vec<T>,
        /// The position of the first inserted item.
        index: usize,
    },
    /// The item at `index` was replaced.
    Replace {
        /// The item now at `index`.
        item: T,
        /// The item previously at `index`.
        previous: T,
        /// The replaced position.
        index: usize,
    },
    /// The item at `index` was removed.
    Remove {
        /// The removed item.
        item: T,
        /// The position it was removed from.
        index: usize,
    },
    /// A contiguous block starting at `index` was removed.
    RemoveRange {
        /// The removed items, in order.
        items: Vec<T>,
        /// The position of the first removed item.
        index: usize,
    },
    /// The item at `index` signalled a change without being replaced.
    Refresh {
        /// The (unchanged) item.
        item: T,
        /// Its position.
        index: usize,
    },
    /// The item moved from `previous_index` to `current_index`.
    Moved {
        /// The moved item.
        item: T,
        /// The position after the move.
        current_index: usize,
        /// The position before the move.
        previous_index: usize,
    },
    /// Every item was removed at once.
    Clear {
        /// The items present before the clear, in order.
        items: Vec<T>,
    },
}

impl<T> ListChange<T> {
    /// The number of items this change touches; ranges count per item.
    pub fn unit_count(&self) -> usize {
        match self {
            ListChange::Add { .. }
            | ListChange::Replace { .. }
            | ListChange::Remove { .. }
            | ListChange::Refresh { .. }
            | ListChange::Moved { .. } => 1,
            ListChange::AddRange { items, .. }
            | ListChange::RemoveRange { items, .. }
            | ListChange::Clear { items } => items.len(),
        }
    }
}
