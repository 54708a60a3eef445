//! Merge the streams of a changing set of children into one stream.
//!
//! The parent collection carries the children; for each child a selector
//! yields its inner stream, and the merged output is the union of the current
//! children's emissions. When a child leaves the parent, its subscription is
//! disposed **and every item it contributed is withdrawn from the merged
//! view** — a child's contribution lives and dies with its membership.
//!
//! Two shapes are provided. The keyed form merges keyed change sets: children
//! contribute key–value entries, the most recent writer of a key wins, and a
//! withdrawal restores another contributor's value when one exists. The
//! ordered form merges list change sets: each child owns a contiguous segment
//! of the merged list, ordered by parent position, and child-local indices
//! are rebased onto the merged coordinates.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::cache::{Cache, ChangeAwareCache};
use crate::change::{Change, ListChange};
use crate::changeset::{ChangeSet, ListChangeSet};
use crate::error::Error;
use crate::operators::OperatorOutput;
use crate::stream::{Observer, Stream, Subscription};
use crate::{Data, Key};

// ---------- keyed merge ----------

struct MergedChild<KP, K, V> {
    parent_key: KP,
    id: u64,
    mirror: Cache<K, V>,
    subscription: Subscription,
    done: bool,
}

struct KeyedState<KP, K, V> {
    children: Vec<MergedChild<KP, K, V>>,
    next_id: u64,
    result: ChangeAwareCache<K, V>,
    out: OperatorOutput<ChangeSet<K, V>>,
    deferring: bool,
    parent_done: bool,
    stopped: bool,
}

type KeyedShared<KP, K, V> = Arc<ReentrantMutex<RefCell<KeyedState<KP, K, V>>>>;

impl<KP: Key, K: Key, V: Data> KeyedState<KP, K, V> {
    fn child_index(&self, id: u64) -> Option<usize> {
        self.children.iter().position(|child| child.id == id)
    }

    /// Restores the surviving contribution for `key`, or removes it.
    fn settle(&mut self, key: &K) {
        let candidate =
            self.children.iter().find_map(|child| child.mirror.lookup(key)).cloned();
        match candidate {
            Some(value) => self.result.add_or_update(key.clone(), value),
            None => self.result.remove(key),
        }
    }

    fn flush(&mut self) {
        if self.deferring {
            return;
        }
        let changes = self.result.capture();
        if !changes.is_empty() {
            self.out.next(changes);
        }
    }

    fn fail(&mut self, error: Error) -> Vec<Subscription> {
        self.stopped = true;
        let subscriptions = self.children.drain(..).map(|child| child.subscription).collect();
        self.out.error(error);
        subscriptions
    }

    fn check_complete(&mut self) {
        if self.parent_done && !self.stopped && self.children.iter().all(|child| child.done) {
            self.stopped = true;
            self.out.complete();
        }
    }
}

struct KeyedChildObserver<KP, K, V> {
    shared: KeyedShared<KP, K, V>,
    id: u64,
}

impl<KP: Key, K: Key, V: Data> Observer<ChangeSet<K, V>> for KeyedChildObserver<KP, K, V> {
    fn on_next(&mut self, changes: ChangeSet<K, V>) {
        let mut disposals = Vec::new();
        {
            let guard = self.shared.lock();
            let mut state = guard.borrow_mut();
            if state.stopped {
                return;
            }
            let Some(index) = state.child_index(self.id) else {
                return;
            };
            if let Err(error) = state.children[index].mirror.apply(&changes) {
                disposals = state.fail(error);
            } else {
                for change in changes.iter() {
                    match change {
                        Change::Add { key, current } | Change::Update { key, current, .. } => {
                            state.result.add_or_update(key.clone(), current.clone());
                        }
                        Change::Remove { key, .. } => state.settle(key),
                        Change::Refresh { key, .. } => {
                            if state.result.lookup(key).is_some() {
                                state.result.refresh(key);
                            }
                        }
                        Change::Moved { .. } => {}
                    }
                }
                state.flush();
            }
        }
        for mut subscription in disposals {
            subscription.dispose();
        }
    }

    fn on_error(&mut self, error: Error) {
        let mut disposals = Vec::new();
        {
            let guard = self.shared.lock();
            let mut state = guard.borrow_mut();
            if !state.stopped {
                disposals = state.fail(error);
            }
        }
        for mut subscription in disposals {
            subscription.dispose();
        }
    }

    fn on_complete(&mut self) {
        let guard = self.shared.lock();
        let mut state = guard.borrow_mut();
        if let Some(index) = state.child_index(self.id) {
            state.children[index].done = true;
        }
        state.check_complete();
    }
}

struct KeyedParentObserver<KP, P, K, V> {
    shared: KeyedShared<KP, K, V>,
    selector: Arc<dyn Fn(&P) -> Stream<ChangeSet<K, V>> + Send + Sync>,
}

impl<KP: Key, P: Data, K: Key, V: Data> KeyedParentObserver<KP, P, K, V> {
    fn withdraw(
        state: &mut KeyedState<KP, K, V>,
        parent_key: &KP,
        withdrawn: &mut Vec<Cache<K, V>>,
        disposals: &mut Vec<Subscription>,
    ) {
        if let Some(index) =
            state.children.iter().position(|child| &child.parent_key == parent_key)
        {
            let child = state.children.remove(index);
            withdrawn.push(child.mirror);
            disposals.push(child.subscription);
        }
    }

    fn admit(
        state: &mut KeyedState<KP, K, V>,
        pending: &mut Vec<(u64, Stream<ChangeSet<K, V>>)>,
        parent_key: KP,
        source: Stream<ChangeSet<K, V>>,
    ) {
        let id = state.next_id;
        state.next_id += 1;
        state.children.push(MergedChild {
            parent_key,
            id,
            mirror: Cache::new(),
            subscription: Subscription::empty(),
            done: false,
        });
        pending.push((id, source));
    }
}

impl<KP: Key, P: Data, K: Key, V: Data> Observer<ChangeSet<KP, P>>
    for KeyedParentObserver<KP, P, K, V>
{
    fn on_next(&mut self, changes: ChangeSet<KP, P>) {
        let mut pending: Vec<(u64, Stream<ChangeSet<K, V>>)> = Vec::new();
        let mut withdrawn: Vec<Cache<K, V>> = Vec::new();
        let mut disposals: Vec<Subscription> = Vec::new();

        let guard = self.shared.lock();
        {
            let mut state = guard.borrow_mut();
            if state.stopped {
                return;
            }
            state.deferring = true;
            for change in changes.iter() {
                match change {
                    Change::Add { key, current } => {
                        Self::admit(&mut state, &mut pending, key.clone(), (self.selector)(current));
                    }
                    Change::Update { key, current, .. } => {
                        Self::withdraw(&mut state, key, &mut withdrawn, &mut disposals);
                        Self::admit(&mut state, &mut pending, key.clone(), (self.selector)(current));
                    }
                    Change::Remove { key, .. } => {
                        Self::withdraw(&mut state, key, &mut withdrawn, &mut disposals);
                    }
                    Change::Refresh { .. } | Change::Moved { .. } => {}
                }
            }
        }

        // Subscribe new children with the state borrow released; their
        // initial change sets fold in place under the re-entrant lock.
        let mut new_subscriptions: Vec<(u64, Subscription)> = Vec::new();
        for (id, source) in pending {
            let live = {
                let state = guard.borrow();
                !state.stopped && state.child_index(id).is_some()
            };
            if !live {
                continue;
            }
            let subscription =
                source.subscribe(KeyedChildObserver { shared: Arc::clone(&self.shared), id });
            new_subscriptions.push((id, subscription));
        }

        {
            let mut state = guard.borrow_mut();
            if state.stopped {
                disposals.extend(new_subscriptions.into_iter().map(|(_, sub)| sub));
            } else {
                for (id, subscription) in new_subscriptions {
                    match state.child_index(id) {
                        Some(index) => state.children[index].subscription = subscription,
                        None => disposals.push(subscription),
                    }
                }
                for mirror in withdrawn.drain(..) {
                    for (key, _) in mirror.iter() {
                        state.settle(key);
                    }
                }
                state.deferring = false;
                state.flush();
                state.check_complete();
            }
        }

        drop(guard);
        for mut subscription in disposals {
            subscription.dispose();
        }
    }

    fn on_error(&mut self, error: Error) {
        let mut disposals = Vec::new();
        {
            let guard = self.shared.lock();
            let mut state = guard.borrow_mut();
            if !state.stopped {
                disposals = state.fail(error);
            }
        }
        for mut subscription in disposals {
            subscription.dispose();
        }
    }

    fn on_complete(&mut self) {
        let guard = self.shared.lock();
        let mut state = guard.borrow_mut();
        state.parent_done = true;
        state.check_complete();
    }
}

/// Merges the keyed streams selected from a keyed parent.
pub trait MergeMany<KP: Key, P: Data> {
    /// For each parent entry, subscribes `selector`'s stream and merges every
    /// child's change sets into one keyed stream.
    ///
    /// Removing a parent entry disposes its child subscription and withdraws
    /// the child's contribution from the merged view.
    fn merge_many<K: Key, V: Data>(
        &self,
        selector: impl Fn(&P) -> Stream<ChangeSet<K, V>> + Send + Sync + 'static,
    ) -> Stream<ChangeSet<K, V>>;
}

impl<KP: Key, P: Data> MergeMany<KP, P> for Stream<ChangeSet<KP, P>> {
    fn merge_many<K: Key, V: Data>(
        &self,
        selector: impl Fn(&P) -> Stream<ChangeSet<K, V>> + Send + Sync + 'static,
    ) -> Stream<ChangeSet<K, V>> {
        let parent = self.clone();
        let selector: Arc<dyn Fn(&P) -> Stream<ChangeSet<K, V>> + Send + Sync> =
            Arc::new(selector);
        Stream::new(move |observer| {
            let out = OperatorOutput::new(observer);
            let shared: KeyedShared<KP, K, V> =
                Arc::new(ReentrantMutex::new(RefCell::new(KeyedState {
                    children: Vec::new(),
                    next_id: 0,
                    result: ChangeAwareCache::new(),
                    out: out.clone(),
                    deferring: false,
                    parent_done: false,
                    stopped: false,
                })));

            let parent_subscription = parent.subscribe(KeyedParentObserver {
                shared: Arc::clone(&shared),
                selector: Arc::clone(&selector),
            });

            let shared_teardown = Arc::clone(&shared);
            let mut subscription = Subscription::new(move || {
                let disposals = {
                    let guard = shared_teardown.lock();
                    let mut state = guard.borrow_mut();
                    state.stopped = true;
                    state
                        .children
                        .drain(..)
                        .map(|child| child.subscription)
                        .collect::<Vec<_>>()
                };
                for mut inner in disposals {
                    inner.dispose();
                }
            });
            subscription.push(parent_subscription);
            subscription.push(out.disarm_subscription());
            subscription
        })
    }
}

// ---------- ordered merge ----------

struct SegmentedChild<T> {
    id: u64,
    items: Vec<T>,
    subscription: Subscription,
    done: bool,
}

struct OrderedState<T> {
    children: Vec<SegmentedChild<T>>,
    next_id: u64,
    pending: Vec<ListChange<T>>,
    out: OperatorOutput<ListChangeSet<T>>,
    deferring: bool,
    parent_done: bool,
    stopped: bool,
}

type OrderedShared<T> = Arc<ReentrantMutex<RefCell<OrderedState<T>>>>;

impl<T: Data> OrderedState<T> {
    fn child_index(&self, id: u64) -> Option<usize> {
        self.children.iter().position(|child| child.id == id)
    }

    /// The merged-list position where the child at `index` begins.
    fn offset_of(&self, index: usize) -> usize {
        self.children[..index].iter().map(|child| child.items.len()).sum()
    }

    fn flush(&mut self) {
        if self.deferring || self.pending.is_empty() {
            return;
        }
        let changes: ListChangeSet<T> = std::mem::take(&mut self.pending).into_iter().collect();
        self.out.next(changes);
    }

    fn fail(&mut self, error: Error) -> Vec<Subscription> {
        self.stopped = true;
        let subscriptions = self.children.drain(..).map(|child| child.subscription).collect();
        self.out.error(error);
        subscriptions
    }

    fn check_complete(&mut self) {
        if self.parent_done && !self.stopped && self.children.iter().all(|child| child.done) {
            self.stopped = true;
            self.out.complete();
        }
    }
}

/// A child-local change rebased onto merged-list coordinates. A child
/// `Clear` becomes a range removal of its segment, not a merged clear.
fn rebase<T: Clone>(change: &ListChange<T>, offset: usize) -> ListChange<T> {
    match change {
        ListChange::Add { item, index } => {
            ListChange::Add { item: item.clone(), index: offset + index }
        }
        ListChange::AddRange { items, index } => {
            ListChange::AddRange { items: items.clone(), index: offset + index }
        }
        ListChange::Replace { item, previous, index } => ListChange::Replace {
            item: item.clone(),
            previous: previous.clone(),
            index: offset + index,
        },
        ListChange::Remove { item, index } => {
            ListChange::Remove { item: item.clone(), index: offset + index }
        }
        ListChange::RemoveRange { items, index } => {
            ListChange::RemoveRange { items: items.clone(), index: offset + index }
        }
        ListChange::Refresh { item, index } => {
            ListChange::Refresh { item: item.clone(), index: offset + index }
        }
        ListChange::Moved { item, current_index, previous_index } => ListChange::Moved {
            item: item.clone(),
            current_index: offset + current_index,
            previous_index: offset + previous_index,
        },
        ListChange::Clear { items } => {
            ListChange::RemoveRange { items: items.clone(), index: offset }
        }
    }
}

struct OrderedChildObserver<T> {
    shared: OrderedShared<T>,
    id: u64,
}

impl<T: Data> Observer<ListChangeSet<T>> for OrderedChildObserver<T> {
    fn on_next(&mut self, changes: ListChangeSet<T>) {
        let mut disposals = Vec::new();
        {
            let guard = self.shared.lock();
            let mut state = guard.borrow_mut();
            if state.stopped {
                return;
            }
            let Some(index) = state.child_index(self.id) else {
                return;
            };
            // The child's own length changes never move its own offset.
            let offset = state.offset_of(index);
            let mut failure = None;
            for change in changes.iter() {
                let rebased = rebase(change, offset);
                if let Err(error) = change.apply_to(&mut state.children[index].items) {
                    failure = Some(error);
                    break;
                }
                state.pending.push(rebased);
            }
            match failure {
                Some(error) => disposals = state.fail(error),
                None => state.flush(),
            }
        }
        for mut subscription in disposals {
            subscription.dispose();
        }
    }

    fn on_error(&mut self, error: Error) {
        let mut disposals = Vec::new();
        {
            let guard = self.shared.lock();
            let mut state = guard.borrow_mut();
            if !state.stopped {
                disposals = state.fail(error);
            }
        }
        for mut subscription in disposals {
            subscription.dispose();
        }
    }

    fn on_complete(&mut self) {
        let guard = self.shared.lock();
        let mut state = guard.borrow_mut();
        if let Some(index) = state.child_index(self.id) {
            state.children[index].done = true;
        }
        state.check_complete();
    }
}

struct OrderedParentObserver<S, T> {
    shared: OrderedShared<T>,
    selector: Arc<dyn Fn(&S) -> Stream<ListChangeSet<T>> + Send + Sync>,
}

impl<S: Data, T: Data> OrderedParentObserver<S, T> {
    fn admit(
        state: &mut OrderedState<T>,
        pending_subscribe: &mut Vec<(u64, Stream<ListChangeSet<T>>)>,
        source: Stream<ListChangeSet<T>>,
        index: usize,
    ) -> Result<(), Error> {
        if index > state.children.len() {
            return Err(Error::invariant(format!(
                "parent insertion at index {index} beyond {} children",
                state.children.len()
            )));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.children.insert(
            index,
            SegmentedChild { id, items: Vec::new(), subscription: Subscription::empty(), done: false },
        );
        pending_subscribe.push((id, source));
        Ok(())
    }

    fn withdraw(
        state: &mut OrderedState<T>,
        index: usize,
        disposals: &mut Vec<Subscription>,
    ) -> Result<(), Error> {
        if index >= state.children.len() {
            return Err(Error::invariant(format!(
                "parent removal at index {index} beyond {} children",
                state.children.len()
            )));
        }
        let offset = state.offset_of(index);
        let child = state.children.remove(index);
        if !child.items.is_empty() {
            state.pending.push(ListChange::RemoveRange { items: child.items, index: offset });
        }
        disposals.push(child.subscription);
        Ok(())
    }
}

impl<S: Data, T: Data> Observer<ListChangeSet<S>> for OrderedParentObserver<S, T> {
    fn on_next(&mut self, changes: ListChangeSet<S>) {
        let mut pending_subscribe: Vec<(u64, Stream<ListChangeSet<T>>)> = Vec::new();
        let mut disposals: Vec<Subscription> = Vec::new();

        let guard = self.shared.lock();
        {
            let mut state = guard.borrow_mut();
            if state.stopped {
                return;
            }
            state.deferring = true;

            let mut failed = None;
            'changes: for change in changes.iter() {
                let step = match change {
                    ListChange::Add { item, index } => Self::admit(
                        &mut state,
                        &mut pending_subscribe,
                        (self.selector)(item),
                        *index,
                    ),
                    ListChange::AddRange { items, index } => {
                        let mut step = Ok(());
                        for (position, item) in items.iter().enumerate() {
                            step = Self::admit(
                                &mut state,
                                &mut pending_subscribe,
                                (self.selector)(item),
                                index + position,
                            );
                            if step.is_err() {
                                break;
                            }
                        }
                        step
                    }
                    ListChange::Remove { index, .. } => {
                        Self::withdraw(&mut state, *index, &mut disposals)
                    }
                    ListChange::RemoveRange { items, index } => {
                        let mut step = Ok(());
                        for _ in 0..items.len() {
                            step = Self::withdraw(&mut state, *index, &mut disposals);
                            if step.is_err() {
                                break;
                            }
                        }
                        step
                    }
                    ListChange::Replace { item, index, .. } => {
                        Self::withdraw(&mut state, *index, &mut disposals).and_then(|()| {
                            Self::admit(
                                &mut state,
                                &mut pending_subscribe,
                                (self.selector)(item),
                                *index,
                            )
                        })
                    }
                    ListChange::Moved { current_index, previous_index, .. } => {
                        if *previous_index >= state.children.len()
                            || *current_index >= state.children.len()
                        {
                            Err(Error::invariant("parent move beyond bounds"))
                        } else {
                            let old_offset = state.offset_of(*previous_index);
                            let child = state.children.remove(*previous_index);
                            let new_offset = state.offset_of(*current_index);
                            if !child.items.is_empty() {
                                state.pending.push(ListChange::RemoveRange {
                                    items: child.items.clone(),
                                    index: old_offset,
                                });
                                state.pending.push(ListChange::AddRange {
                                    items: child.items.clone(),
                                    index: new_offset,
                                });
                            }
                            state.children.insert(*current_index, child);
                            Ok(())
                        }
                    }
                    ListChange::Clear { .. } => {
                        while !state.children.is_empty() {
                            let _ = Self::withdraw(&mut state, 0, &mut disposals);
                        }
                        Ok(())
                    }
                    ListChange::Refresh { .. } => Ok(()),
                };
                if let Err(error) = step {
                    failed = Some(error);
                    break 'changes;
                }
            }
            if let Some(error) = failed {
                disposals.extend(state.fail(error));
            }
        }

        // Subscribe new children outside the state borrow; the re-entrant
        // lock folds each child's initial range addition in place.
        let mut new_subscriptions: Vec<(u64, Subscription)> = Vec::new();
        for (id, source) in pending_subscribe {
            let live = {
                let state = guard.borrow();
                !state.stopped && state.child_index(id).is_some()
            };
            if !live {
                continue;
            }
            let subscription =
                source.subscribe(OrderedChildObserver { shared: Arc::clone(&self.shared), id });
            new_subscriptions.push((id, subscription));
        }

        {
            let mut state = guard.borrow_mut();
            if state.stopped {
                disposals.extend(new_subscriptions.into_iter().map(|(_, sub)| sub));
            } else {
                for (id, subscription) in new_subscriptions {
                    match state.child_index(id) {
                        Some(index) => state.children[index].subscription = subscription,
                        None => disposals.push(subscription),
                    }
                }
                state.deferring = false;
                state.flush();
                state.check_complete();
            }
        }

        drop(guard);
        for mut subscription in disposals {
            subscription.dispose();
        }
    }

    fn on_error(&mut self, error: Error) {
        let mut disposals = Vec::new();
        {
            let guard = self.shared.lock();
            let mut state = guard.borrow_mut();
            if !state.stopped {
                disposals = state.fail(error);
            }
        }
        for mut subscription in disposals {
            subscription.dispose();
        }
    }

    fn on_complete(&mut self) {
        let guard = self.shared.lock();
        let mut state = guard.borrow_mut();
        state.parent_done = true;
        state.check_complete();
    }
}

/// Merges the list streams selected from an ordered parent.
pub trait MergeManyLists<S: Data> {
    /// For each parent item, subscribes `selector`'s stream and merges every
    /// child's change sets into one ordered stream.
    ///
    /// Each child owns a contiguous segment of the merged list, positioned by
    /// its parent order; removing a child withdraws its whole segment.
    ///
    /// # Examples
    ///
    /// ```
    /// use deltaflow::operators::MergeManyLists;
    /// use deltaflow::{ObservableList, SourceList};
    ///
    /// let a = SourceList::new();
    /// let b = SourceList::new();
    /// let parents: SourceList<SourceList<i32>> = SourceList::new();
    /// parents.edit(|list| {
    ///     list.push(a.clone());
    ///     list.push(b.clone());
    /// });
    ///
    /// let merged = parents.connect().merge_many(|child| child.connect());
    /// let view = ObservableList::new(&merged);
    ///
    /// a.edit(|list| list.push(1));
    /// b.edit(|list| list.push(2));
    /// a.edit(|list| list.push(3)); // lands at the end of a's segment
    /// assert_eq!(view.items(), vec![1, 3, 2]);
    /// ```
    fn merge_many<T: Data>(
        &self,
        selector: impl Fn(&S) -> Stream<ListChangeSet<T>> + Send + Sync + 'static,
    ) -> Stream<ListChangeSet<T>>;
}

impl<S: Data> MergeManyLists<S> for Stream<ListChangeSet<S>> {
    fn merge_many<T: Data>(
        &self,
        selector: impl Fn(&S) -> Stream<ListChangeSet<T>> + Send + Sync + 'static,
    ) -> Stream<ListChangeSet<T>> {
        let parent = self.clone();
        let selector: Arc<dyn Fn(&S) -> Stream<ListChangeSet<T>> + Send + Sync> =
            Arc::new(selector);
        Stream::new(move |observer| {
            let out = OperatorOutput::new(observer);
            let shared: OrderedShared<T> =
                Arc::new(ReentrantMutex::new(RefCell::new(OrderedState {
                    children: Vec::new(),
                    next_id: 0,
                    pending: Vec::new(),
                    out: out.clone(),
                    deferring: false,
                    parent_done: false,
                    stopped: false,
                })));

            let parent_subscription = parent.subscribe(OrderedParentObserver {
                shared: Arc::clone(&shared),
                selector: Arc::clone(&selector),
            });

            let shared_teardown = Arc::clone(&shared);
            let mut subscription = Subscription::new(move || {
                let disposals = {
                    let guard = shared_teardown.lock();
                    let mut state = guard.borrow_mut();
                    state.stopped = true;
                    state
                        .children
                        .drain(..)
                        .map(|child| child.subscription)
                        .collect::<Vec<_>>()
                };
                for mut inner in disposals {
                    inner.dispose();
                }
            });
            subscription.push(parent_subscription);
            subscription.push(out.disarm_subscription());
            subscription
        })
    }
}
