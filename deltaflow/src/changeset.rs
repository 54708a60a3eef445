//! Batched, ordered sequences of deltas with summary counters.
//!
//! A change set is the unit of emission on every stream in this crate. Within
//! one change set the order of changes is significant: replaying them in order
//! against a receiver holding the sender's prior state must reproduce the
//! sender's current state. Change sets are sequences, never sets; two changes
//! touching the same key are both retained, in order.
//!
//! Operators never emit empty change sets. The types here still allow empty
//! values to exist (a [`ChangeAwareCache`](crate::ChangeAwareCache) capture
//! with nothing buffered returns one) so that the suppression decision stays
//! at the emission point.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::change::{Change, ChangeReason, ListChange};

/// A batched, ordered sequence of keyed deltas.
///
/// # Examples
///
/// ```
/// use deltaflow::{Change, ChangeSet};
///
/// let changes: ChangeSet<u32, &str> = [
///     Change::Add { key: 1, current: "a" },
///     Change::Update { key: 1, current: "b", previous: "a" },
/// ]
/// .into_iter()
/// .collect();
///
/// assert_eq!(changes.adds(), 1);
/// assert_eq!(changes.updates(), 1);
/// assert_eq!(changes.total_changes(), 2);
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet<K, V> {
    changes: SmallVec<[Change<K, V>; 4]>,
}

impl<K, V> ChangeSet<K, V> {
    /// An empty change set.
    pub fn new() -> Self {
        ChangeSet { changes: SmallVec::new() }
    }

    /// Appends one change, preserving order.
    pub fn push(&mut self, change: Change<K, V>) {
        self.changes.push(change);
    }

    /// The number of changes in the sequence.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// True when the sequence carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Iterates the changes in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Change<K, V>> {
        self.changes.iter()
    }

    fn count_reason(&self, reason: ChangeReason) -> usize {
        self.changes.iter().filter(|c| c.reason() == reason).count()
    }

    /// The number of `Add` changes.
    pub fn adds(&self) -> usize {
        self.count_reason(ChangeReason::Add)
    }

    /// The number of `Update` changes.
    pub fn updates(&self) -> usize {
        self.count_reason(ChangeReason::Update)
    }

    /// The number of `Remove` changes.
    pub fn removes(&self) -> usize {
        self.count_reason(ChangeReason::Remove)
    }

    /// The number of `Refresh` changes.
    pub fn refreshes(&self) -> usize {
        self.count_reason(ChangeReason::Refresh)
    }

    /// The number of `Moved` changes.
    pub fn moves(&self) -> usize {
        self.count_reason(ChangeReason::Moved)
    }

    /// The total number of changes in the sequence.
    pub fn total_changes(&self) -> usize {
        self.changes.len()
    }
}

impl<K, V> Default for ChangeSet<K, V> {
    fn default() -> Self {
        ChangeSet::new()
    }
}

impl<K, V> FromIterator<Change<K, V>> for ChangeSet<K, V> {
    fn from_iter<I: IntoIterator<Item = Change<K, V>>>(iter: I) -> Self {
        ChangeSet { changes: iter.into_iter().collect() }
    }
}

impl<K, V> IntoIterator for ChangeSet<K, V> {
    type Item = Change<K, V>;
    type IntoIter = smallvec::IntoIter<[Change<K, V>; 4]>;
    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, K, V> IntoIterator for &'a ChangeSet<K, V> {
    type Item = &'a Change<K, V>;
    type IntoIter = std::slice::Iter<'a, Change<K, V>>;
    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// The auxiliary response a paging or virtualization operator attaches to a
/// change set it forwards.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct VirtualResponse {
    /// The first index of the virtualized window.
    pub start_index: usize,
    /// The size of the virtualized window.
    pub size: usize,
}

/// A change set decorated with a [`VirtualResponse`].
///
/// The wrapper forwards counters and iteration verbatim (it dereferences to
/// the wrapped [`ChangeSet`]); only the response record is added.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct VirtualChangeSet<K, V> {
    /// The window this change set was produced for.
    pub response: VirtualResponse,
    changes: ChangeSet<K, V>,
}

impl<K, V> VirtualChangeSet<K, V> {
    /// Decorates `changes` with `response`.
    pub fn new(changes: ChangeSet<K, V>, response: VirtualResponse) -> Self {
        VirtualChangeSet { response, changes }
    }

    /// Unwraps the underlying change set.
    pub fn into_inner(self) -> ChangeSet<K, V> {
        self.changes
    }
}

impl<K, V> std::ops::Deref for VirtualChangeSet<K, V> {
    type Target = ChangeSet<K, V>;
    fn deref(&self) -> &ChangeSet<K, V> {
        &self.changes
    }
}

/// A batched, ordered sequence of ordered-collection deltas.
///
/// Counters count per touched item, so an `AddRange` of three items
/// contributes three to [`adds`](ListChangeSet::adds), while
/// [`total_changes`](ListChangeSet::total_changes) counts change records.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ListChangeSet<T> {
    changes: SmallVec<[ListChange<T>; 4]>,
}

impl<T> ListChangeSet<T> {
    /// An empty change set.
    pub fn new() -> Self {
        ListChangeSet { changes: SmallVec::new() }
    }

    /// Appends one change, preserving order.
    pub fn push(&mut self, change: ListChange<T>) {
        self.changes.push(change);
    }

    /// The total number of change records in the sequence.
    pub fn total_changes(&self) -> usize {
        self.changes.len()
    }

    /// True when the sequence carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Iterates the changes in order.
    pub fn iter(&self) -> std::slice::Iter<'_, ListChange<T>> {
        self.changes.iter()
    }

    /// The number of items made present.
    pub fn adds(&self) -> usize {
        self.changes
            .iter()
            .map(|c| match c {
                ListChange::Add { .. } => 1,
                ListChange::AddRange { items, .. } => items.len(),
                _ => 0,
            })
            .sum()
    }

    /// The number of items made absent, including cleared items.
    pub fn removes(&self) -> usize {
        self.changes
            .iter()
            .map(|c| match c {
                ListChange::Remove { .. } => 1,
                ListChange::RemoveRange { items, .. } | ListChange::Clear { items } => items.len(),
                _ => 0,
            })
            .sum()
    }

    /// The number of in-place replacements.
    pub fn replacements(&self) -> usize {
        self.changes.iter().filter(|c| matches!(c, ListChange::Replace { .. })).count()
    }

    /// The number of moves.
    pub fn moves(&self) -> usize {
        self.changes.iter().filter(|c| matches!(c, ListChange::Moved { .. })).count()
    }

    /// The number of refreshes.
    pub fn refreshes(&self) -> usize {
        self.changes.iter().filter(|c| matches!(c, ListChange::Refresh { .. })).count()
    }
}

impl<T> Default for ListChangeSet<T> {
    fn default() -> Self {
        ListChangeSet::new()
    }
}

impl<T> FromIterator<ListChange<T>> for ListChangeSet<T> {
    fn from_iter<I: IntoIterator<Item = ListChange<T>>>(iter: I) -> Self {
        ListChangeSet { changes: iter.into_iter().collect() }
    }
}

impl<T> IntoIterator for ListChangeSet<T> {
    type Item = ListChange<T>;
    type IntoIter = smallvec::IntoIter<[ListChange<T>; 4]>;
    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a ListChangeSet<T> {
    type Item = &'a ListChange<T>;
    type IntoIter = std::slice::Iter<'a, ListChange<T>>;
    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl<T: Clone> ListChange<T> {
    /// Replays this change against an ordered collection.
    ///
    /// Out-of-range indices are reported as invariant violations rather than
    /// panicking, so a receiver fed by a faulty sender fails fast with a
    /// descriptive reason.
    pub fn apply_to(&self, items: &mut Vec<T>) -> crate::error::Result<()> {
        fn bad(op: &str, index: usize, len: usize) -> crate::error::Error {
            crate::error::Error::invariant(format!(
                "list {op} at index {index} beyond length {len}"
            ))
        }
        match self {
            ListChange::Add { item, index } => {
                if *index > items.len() {
                    return Err(bad("insert", *index, items.len()));
                }
                items.insert(*index, item.clone());
            }
            ListChange::AddRange { items: block, index } => {
                if *index > items.len() {
                    return Err(bad("insert", *index, items.len()));
                }
                items.splice(*index..*index, block.iter().cloned());
            }
            ListChange::Replace { item, index, .. } => {
                let len = items.len();
                let slot = items.get_mut(*index).ok_or_else(|| bad("replace", *index, len))?;
                *slot = item.clone();
            }
            ListChange::Remove { index, .. } => {
                if *index >= items.len() {
                    return Err(bad("remove", *index, items.len()));
                }
                items.remove(*index);
            }
            ListChange::RemoveRange { items: block, index } => {
                let end = index + block.len();
                if end > items.len() {
                    return Err(bad("remove", end, items.len()));
                }
                items.drain(*index..end);
            }
            ListChange::Refresh { .. } => {}
            ListChange::Moved { current_index, previous_index, .. } => {
                if *previous_index >= items.len() {
                    return Err(bad("move", *previous_index, items.len()));
                }
                let item = items.remove(*previous_index);
                if *current_index > items.len() {
                    return Err(bad("move", *current_index, items.len()));
                }
                items.insert(*current_index, item);
            }
            ListChange::Clear { .. } => items.clear(),
        }
        Ok(())
    }
}

impl<T: Clone> ListChangeSet<T> {
    /// Replays every change, in order, against an ordered collection.
    pub fn apply_to(&self, items: &mut Vec<T>) -> crate::error::Result<()> {
        for change in self.iter() {
            change.apply_to(items)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_match_reasons() {
        let changes: ChangeSet<u32, char> = [
            Change::Add { key: 1, current: 'a' },
            Change::Add { key: 2, current: 'b' },
            Change::Update { key: 1, current: 'c', previous: 'a' },
            Change::Remove { key: 2, previous: 'b' },
            Change::Refresh { key: 1, current: 'c' },
        ]
        .into_iter()
        .collect();

        assert_eq!(changes.adds(), 2);
        assert_eq!(changes.updates(), 1);
        assert_eq!(changes.removes(), 1);
        assert_eq!(changes.refreshes(), 1);
        assert_eq!(changes.moves(), 0);
        assert_eq!(changes.total_changes(), 5);
    }

    #[test]
    fn virtual_wrapper_forwards() {
        let changes: ChangeSet<u32, char> =
            [Change::Add { key: 1, current: 'a' }].into_iter().collect();
        let wrapped =
            VirtualChangeSet::new(changes, VirtualResponse { start_index: 10, size: 25 });
        assert_eq!(wrapped.adds(), 1);
        assert_eq!(wrapped.total_changes(), 1);
        assert_eq!(wrapped.iter().count(), 1);
        assert_eq!(wrapped.response.start_index, 10);
    }

    #[test]
    fn list_counters_count_units() {
        let changes: ListChangeSet<i32> = [
            ListChange::AddRange { items: vec![1, 2, 3], index: 0 },
            ListChange::Remove { item: 2, index: 1 },
            ListChange::Clear { items: vec![1, 3] },
        ]
        .into_iter()
        .collect();

        assert_eq!(changes.adds(), 3);
        assert_eq!(changes.removes(), 3);
        assert_eq!(changes.total_changes(), 3);
    }

    #[test]
    fn list_replay_reproduces_sender() {
        let mut items = vec![1, 2, 3];
        let changes: ListChangeSet<i32> = [
            ListChange::Add { item: 0, index: 0 },
            ListChange::Moved { item: 3, current_index: 0, previous_index: 3 },
            ListChange::RemoveRange { items: vec![1, 2], index: 2 },
        ]
        .into_iter()
        .collect();
        changes.apply_to(&mut items).unwrap();
        assert_eq!(items, vec![3, 0]);
    }

    #[test]
    fn list_replay_rejects_bad_index() {
        let mut items = vec![1];
        let change = ListChange::Remove { item: 9, index: 4 };
        assert!(change.apply_to(&mut items).is_err());
    }
}
