//! The ordered source collection.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::change::ListChange;
use crate::changeset::ListChangeSet;
use crate::stream::{Observer, Stream, Subscription};
use crate::Data;

struct ListState<T> {
    items: Vec<T>,
    buffer: Vec<ListChange<T>>,
    subscribers: Vec<(u64, Box<dyn Observer<ListChangeSet<T>>>)>,
    next_id: u64,
}

/// A mutable ordered collection observable as a stream of list change sets.
///
/// Handles are cheap clones of one shared collection; all mutation happens
/// inside [`edit`](SourceList::edit) transactions, each publishing a single
/// change set.
///
/// # Examples
///
/// ```
/// use deltaflow::SourceList;
///
/// let source = SourceList::new();
/// source.edit(|list| {
///     list.push(1);
///     list.push(2);
/// });
///
/// let view = deltaflow::ObservableList::new(&source.connect());
/// assert_eq!(view.items(), vec![1, 2]);
/// ```
pub struct SourceList<T> {
    inner: Arc<Mutex<ListState<T>>>,
}

impl<T> Clone for SourceList<T> {
    fn clone(&self) -> Self {
        SourceList { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Data> SourceList<T> {
    /// An empty source list.
    pub fn new() -> Self {
        SourceList {
            inner: Arc::new(Mutex::new(ListState {
                items: Vec::new(),
                buffer: Vec::new(),
                subscribers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Runs one transactional batch of mutations.
    ///
    /// Observers receive a single change set reflecting the whole batch.
    pub fn edit(&self, batch: impl FnOnce(&mut ListUpdater<'_, T>)) {
        let mut state = self.inner.lock();
        let state = &mut *state;
        batch(&mut ListUpdater { items: &mut state.items, buffer: &mut state.buffer });
        let changes: ListChangeSet<T> = std::mem::take(&mut state.buffer).into_iter().collect();
        if changes.is_empty() {
            return;
        }
        tracing::trace!(changes = changes.total_changes(), "source list publishing edit");
        for (_, subscriber) in state.subscribers.iter_mut() {
            subscriber.on_next(changes.clone());
        }
    }

    /// The change-set stream of this collection.
    ///
    /// A new observer first receives the current items as one range addition
    /// (skipped when the list is empty), then one change set per edit.
    pub fn connect(&self) -> Stream<ListChangeSet<T>> {
        let inner = Arc::clone(&self.inner);
        Stream::new(move |observer| {
            let mut state = inner.lock();
            let state = &mut *state;
            let snapshot = if state.items.is_empty() {
                None
            } else {
                Some(
                    [ListChange::AddRange { items: state.items.clone(), index: 0 }]
                        .into_iter()
                        .collect::<ListChangeSet<T>>(),
                )
            };
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.push((id, observer));
            if let (Some(snapshot), Some((_, subscriber))) =
                (snapshot, state.subscribers.last_mut())
            {
                subscriber.on_next(snapshot);
            }
            let weak = Arc::downgrade(&inner);
            Subscription::new(move || {
                if let Some(strong) = weak.upgrade() {
                    strong.lock().subscribers.retain(|(entry, _)| *entry != id);
                }
            })
        })
    }

    /// The number of items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when no items are present.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// A snapshot of the items in order.
    pub fn items(&self) -> Vec<T> {
        self.inner.lock().items.clone()
    }

    /// Removes every item in one transaction.
    pub fn clear(&self) {
        self.edit(|list| list.clear());
    }
}

impl<T: Data> Default for SourceList<T> {
    fn default() -> Self {
        SourceList::new()
    }
}

/// The mutation surface handed to [`SourceList::edit`] batches.
///
/// Index arguments follow `Vec` conventions and panic when out of range;
/// the updater mutates the caller's own collection, not a replica.
pub struct ListUpdater<'a, T> {
    items: &'a mut Vec<T>,
    buffer: &'a mut Vec<ListChange<T>>,
}

impl<T: Data> ListUpdater<'_, T> {
    /// Appends `item`.
    pub fn push(&mut self, item: T) {
        let index = self.items.len();
        self.items.push(item.clone());
        self.buffer.push(ListChange::Add { item, index });
    }

    /// Inserts `item` at `index`.
    pub fn insert(&mut self, index: usize, item: T) {
        self.items.insert(index, item.clone());
        self.buffer.push(ListChange::Add { item, index });
    }

    /// Appends a block of items.
    pub fn append(&mut self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let index = self.items.len();
        self.items.extend(items.iter().cloned());
        self.buffer.push(ListChange::AddRange { items, index });
    }

    /// Removes and returns the item at `index`.
    pub fn remove_at(&mut self, index: usize) -> T {
        let item = self.items.remove(index);
        self.buffer.push(ListChange::Remove { item: item.clone(), index });
        item
    }

    /// Replaces the item at `index`, returning the previous item.
    pub fn replace(&mut self, index: usize, item: T) -> T {
        let previous = std::mem::replace(&mut self.items[index], item.clone());
        self.buffer.push(ListChange::Replace { item, previous: previous.clone(), index });
        previous
    }

    /// Moves the item at `previous_index` to `current_index`.
    pub fn move_item(&mut self, previous_index: usize, current_index: usize) {
        let item = self.items.remove(previous_index);
        self.items.insert(current_index, item.clone());
        self.buffer.push(ListChange::Moved { item, current_index, previous_index });
    }

    /// Signals that the item at `index` changed observably.
    pub fn refresh(&mut self, index: usize) {
        let item = self.items[index].clone();
        self.buffer.push(ListChange::Refresh { item, index });
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let drained = std::mem::take(self.items);
        self.buffer.push(ListChange::Clear { items: drained });
    }

    /// The number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no items are present.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The current items, in order.
    pub fn items(&self) -> &[T] {
        self.items
    }
}
