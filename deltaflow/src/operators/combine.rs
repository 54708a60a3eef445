//! Combine a dynamic set of keyed streams with a set operator.
//!
//! The combiner observes an observable *list* of inner sources, each itself a
//! keyed change-set stream, and maintains the membership predicate of the
//! chosen [`CombineOperator`] over every key any source carries. Sources may
//! be added, removed, replaced, or reordered at any time; the result reacts
//! with the minimal delta.
//!
//! Each inner source is tracked by a container holding its subscription and a
//! mirror cache kept in lockstep with the source. All upstreams — the source
//! list and every inner source — are serialized on the operator's one lock,
//! so reactions observe a total order.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, ChangeAwareCache};
use crate::change::{Change, ListChange};
use crate::changeset::{ChangeSet, ListChangeSet};
use crate::error::Error;
use crate::operators::OperatorOutput;
use crate::stream::{Observer, Stream, Subscription};
use crate::{Data, Key};

/// The membership predicate applied across the inner sources.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CombineOperator {
    /// A key is in the result when every inner source contains it.
    And,
    /// A key is in the result when any inner source contains it.
    Or,
    /// A key is in the result when exactly one inner source contains it.
    Xor,
    /// A key is in the result when the first inner source contains it and no
    /// other does.
    Except,
}

type ValueEq<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;
type SharedState<K, V> = Arc<ReentrantMutex<RefCell<CombineState<K, V>>>>;

struct MergeContainer<K, V> {
    id: u64,
    cache: Cache<K, V>,
    subscription: Subscription,
    done: bool,
}

struct CombineState<K, V> {
    operator: CombineOperator,
    eq: ValueEq<V>,
    containers: Vec<MergeContainer<K, V>>,
    next_id: u64,
    result: ChangeAwareCache<K, V>,
    out: OperatorOutput<ChangeSet<K, V>>,
    /// Set while a source-list reaction is in flight so that nested inner
    /// deliveries accumulate into one captured change set.
    deferring: bool,
    parent_done: bool,
    stopped: bool,
}

impl<K: Key, V: Data> CombineState<K, V> {
    fn container_index(&self, id: u64) -> Option<usize> {
        self.containers.iter().position(|container| container.id == id)
    }

    fn matches(&self, key: &K) -> bool {
        if self.containers.is_empty() {
            return false;
        }
        match self.operator {
            CombineOperator::And => {
                self.containers.iter().all(|container| container.cache.contains_key(key))
            }
            CombineOperator::Or => {
                self.containers.iter().any(|container| container.cache.contains_key(key))
            }
            CombineOperator::Xor => {
                self.containers
                    .iter()
                    .filter(|container| container.cache.contains_key(key))
                    .count()
                    == 1
            }
            CombineOperator::Except => {
                self.containers[0].cache.contains_key(key)
                    && self.containers[1..]
                        .iter()
                        .all(|container| !container.cache.contains_key(key))
            }
        }
    }

    /// The value the result should hold for `key`: the incoming change's
    /// value when a delta carries one, otherwise the value of the first
    /// source containing the key.
    fn first_value(&self, key: &K) -> Option<V> {
        self.containers.iter().find_map(|container| container.cache.lookup(key)).cloned()
    }

    fn evaluate(&mut self, key: &K, incoming: Option<&V>) {
        if self.matches(key) {
            let candidate = match incoming {
                Some(value) => value.clone(),
                None => match self.first_value(key) {
                    Some(value) => value,
                    None => return,
                },
            };
            let differs = match self.result.lookup(key) {
                None => true,
                Some(existing) => !(self.eq)(existing, &candidate),
            };
            if differs {
                self.result.add_or_update(key.clone(), candidate);
            }
        } else if self.result.lookup(key).is_some() {
            self.result.remove(key);
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

    /// Terminates the operator, returning the inner subscriptions for the
    /// caller to dispose after releasing the lock.
    fn fail(&mut self, error: Error) -> Vec<Subscription> {
        self.stopped = true;
        let subscriptions =
            self.containers.drain(..).map(|container| container.subscription).collect();
        self.out.error(error);
        subscriptions
    }

    fn check_complete(&mut self) {
        if self.parent_done
            && !self.stopped
            && self.containers.iter().all(|container| container.done)
        {
            self.stopped = true;
            self.out.complete();
        }
    }
}

struct InnerObserver<K, V> {
    shared: SharedState<K, V>,
    id: u64,
}

impl<K: Key, V: Data> Observer<ChangeSet<K, V>> for InnerObserver<K, V> {
    fn on_next(&mut self, changes: ChangeSet<K, V>) {
        let mut disposals = Vec::new();
        {
            let guard = self.shared.lock();
            let mut state = guard.borrow_mut();
            if state.stopped {
                return;
            }
            let Some(index) = state.container_index(self.id) else {
                return;
            };
            if let Err(error) = state.containers[index].cache.apply(&changes) {
                disposals = state.fail(error);
            } else {
                for change in changes.iter() {
                    match change {
                        Change::Add { key, current } | Change::Update { key, current, .. } => {
                            state.evaluate(key, Some(current));
                        }
                        Change::Remove { key, .. } => state.evaluate(key, None),
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
        if let Some(index) = state.container_index(self.id) {
            state.containers[index].done = true;
        }
        state.check_complete();
    }
}

struct SourcesObserver<K, V> {
    shared: SharedState<K, V>,
}

impl<K: Key, V: Data> SourcesObserver<K, V> {
    /// Removes the container at `index`, stashing its mirror for
    /// re-evaluation and its subscription for out-of-lock disposal.
    fn remove_at(
        state: &mut CombineState<K, V>,
        index: usize,
        removed_mirrors: &mut Vec<Cache<K, V>>,
        disposals: &mut Vec<Subscription>,
    ) -> Result<(), Error> {
        if index >= state.containers.len() {
            return Err(Error::invariant(format!(
                "source list removal at index {index} beyond {} sources",
                state.containers.len()
            )));
        }
        let container = state.containers.remove(index);
        removed_mirrors.push(container.cache);
        disposals.push(container.subscription);
        Ok(())
    }

    fn add_at(
        state: &mut CombineState<K, V>,
        pending: &mut Vec<(u64, Stream<ChangeSet<K, V>>)>,
        source: Stream<ChangeSet<K, V>>,
        index: usize,
    ) -> Result<(), Error> {
        if index > state.containers.len() {
            return Err(Error::invariant(format!(
                "source list insertion at index {index} beyond {} sources",
                state.containers.len()
            )));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.containers.insert(
            index,
            MergeContainer {
                id,
                cache: Cache::new(),
                subscription: Subscription::empty(),
                done: false,
            },
        );
        pending.push((id, source));
        Ok(())
    }
}

impl<K: Key, V: Data> Observer<ListChangeSet<Stream<ChangeSet<K, V>>>> for SourcesObserver<K, V> {
    fn on_next(&mut self, changes: ListChangeSet<Stream<ChangeSet<K, V>>>) {
        let mut pending: Vec<(u64, Stream<ChangeSet<K, V>>)> = Vec::new();
        let mut removed_mirrors: Vec<Cache<K, V>> = Vec::new();
        let mut disposals: Vec<Subscription> = Vec::new();

        let guard = self.shared.lock();

        // Phase one: apply the topology changes to the container list.
        let (rescan_result, rescan_all) = {
            let mut state = guard.borrow_mut();
            if state.stopped {
                return;
            }
            state.deferring = true;

            let mut failed = None;
            'changes: for change in changes.iter() {
                let step = match change {
                    ListChange::Add { item, index } => {
                        Self::add_at(&mut state, &mut pending, item.clone(), *index)
                    }
                    ListChange::AddRange { items, index } => {
                        let mut step = Ok(());
                        for (offset, item) in items.iter().enumerate() {
                            step = Self::add_at(
                                &mut state,
                                &mut pending,
                                item.clone(),
                                index + offset,
                            );
                            if step.is_err() {
                                break;
                            }
                        }
                        step
                    }
                    ListChange::Remove { index, .. } => {
                        Self::remove_at(&mut state, *index, &mut removed_mirrors, &mut disposals)
                    }
                    ListChange::RemoveRange { items, index } => {
                        let mut step = Ok(());
                        for _ in 0..items.len() {
                            step = Self::remove_at(
                                &mut state,
                                *index,
                                &mut removed_mirrors,
                                &mut disposals,
                            );
                            if step.is_err() {
                                break;
                            }
                        }
                        step
                    }
                    ListChange::Clear { .. } => {
                        while !state.containers.is_empty() {
                            let _ = Self::remove_at(
                                &mut state,
                                0,
                                &mut removed_mirrors,
                                &mut disposals,
                            );
                        }
                        Ok(())
                    }
                    ListChange::Replace { item, index, .. } => Self::remove_at(
                        &mut state,
                        *index,
                        &mut removed_mirrors,
                        &mut disposals,
                    )
                    .and_then(|()| {
                        Self::add_at(&mut state, &mut pending, item.clone(), *index)
                    }),
                    ListChange::Moved { current_index, previous_index, .. } => {
                        if *previous_index >= state.containers.len()
                            || *current_index >= state.containers.len()
                        {
                            Err(Error::invariant("source list move beyond bounds"))
                        } else {
                            let container = state.containers.remove(*previous_index);
                            state.containers.insert(*current_index, container);
                            Ok(())
                        }
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
                (false, false)
            } else {
                // Adding a source can evict previously matching keys for And
                // and Except; removing one can admit keys held by the
                // remaining sources. Reordering changes which source is
                // "first" for Except.
                let reordering = changes
                    .iter()
                    .any(|change| matches!(change, ListChange::Moved { .. }));
                let additions = !pending.is_empty();
                let removals = !removed_mirrors.is_empty();
                match state.operator {
                    CombineOperator::And => (additions, removals),
                    CombineOperator::Except => (additions, removals || reordering),
                    CombineOperator::Or | CombineOperator::Xor => (false, false),
                }
            }
        };

        // Phase two: subscribe the new sources with the state borrow
        // released, so each source's synchronously delivered initial change
        // set is folded in place (the lock is re-entrant).
        let mut new_subscriptions: Vec<(u64, Subscription)> = Vec::new();
        for (id, source) in pending {
            let live = {
                let state = guard.borrow();
                !state.stopped && state.container_index(id).is_some()
            };
            if !live {
                continue;
            }
            let subscription =
                source.subscribe(InnerObserver { shared: Arc::clone(&self.shared), id });
            new_subscriptions.push((id, subscription));
        }

        // Phase three: re-evaluate, capture once, emit.
        {
            let mut state = guard.borrow_mut();
            if state.stopped {
                disposals.extend(new_subscriptions.into_iter().map(|(_, sub)| sub));
            } else {
                for (id, subscription) in new_subscriptions {
                    match state.container_index(id) {
                        Some(index) => state.containers[index].subscription = subscription,
                        None => disposals.push(subscription),
                    }
                }
                for mirror in removed_mirrors.drain(..) {
                    for (key, _) in mirror.iter() {
                        state.evaluate(key, None);
                    }
                }
                if rescan_all {
                    let keys: Vec<K> = state
                        .containers
                        .iter()
                        .flat_map(|container| container.cache.keys().cloned())
                        .collect();
                    for key in keys {
                        state.evaluate(&key, None);
                    }
                } else if rescan_result {
                    let keys: Vec<K> = state.result.iter().map(|(key, _)| key.clone()).collect();
                    for key in keys {
                        state.evaluate(&key, None);
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

/// Combines a dynamic list of keyed streams under `operator`, comparing
/// values with `PartialEq` to suppress no-op updates.
///
/// # Examples
///
/// ```
/// use deltaflow::operators::{combine, CombineOperator};
/// use deltaflow::{ObservableCache, SourceCache, SourceList};
///
/// let a = SourceCache::new();
/// let b = SourceCache::new();
/// a.edit(|cache| {
///     for k in [1, 2, 3] {
///         cache.add_or_update(k, k);
///     }
/// });
/// b.edit(|cache| {
///     for k in [2, 3, 4] {
///         cache.add_or_update(k, k);
///     }
/// });
///
/// let sources = SourceList::new();
/// sources.edit(|list| {
///     list.push(a.connect());
///     list.push(b.connect());
/// });
///
/// let result = ObservableCache::new(&combine(CombineOperator::And, &sources.connect()));
/// assert_eq!(result.keys(), vec![2, 3]);
/// ```
pub fn combine<K: Key, V: Data + PartialEq>(
    operator: CombineOperator,
    sources: &Stream<ListChangeSet<Stream<ChangeSet<K, V>>>>,
) -> Stream<ChangeSet<K, V>> {
    combine_with(operator, sources, |a, b| a == b)
}

/// Combines a dynamic list of keyed streams under `operator`, with a
/// caller-supplied value equality used to suppress no-op updates.
pub fn combine_with<K: Key, V: Data>(
    operator: CombineOperator,
    sources: &Stream<ListChangeSet<Stream<ChangeSet<K, V>>>>,
    eq: impl Fn(&V, &V) -> bool + Send + Sync + 'static,
) -> Stream<ChangeSet<K, V>> {
    let sources = sources.clone();
    let eq: ValueEq<V> = Arc::new(eq);
    Stream::new(move |observer| {
        let out = OperatorOutput::new(observer);
        let shared: SharedState<K, V> = Arc::new(ReentrantMutex::new(RefCell::new(CombineState {
            operator,
            eq: Arc::clone(&eq),
            containers: Vec::new(),
            next_id: 0,
            result: ChangeAwareCache::new(),
            out: out.clone(),
            deferring: false,
            parent_done: false,
            stopped: false,
        })));
        tracing::debug!(?operator, "combiner subscribed");

        let sources_subscription =
            sources.subscribe(SourcesObserver { shared: Arc::clone(&shared) });

        let shared_teardown = Arc::clone(&shared);
        let mut subscription = Subscription::new(move || {
            let disposals = {
                let guard = shared_teardown.lock();
                let mut state = guard.borrow_mut();
                state.stopped = true;
                state
                    .containers
                    .drain(..)
                    .map(|container| container.subscription)
                    .collect::<Vec<_>>()
            };
            for mut inner in disposals {
                inner.dispose();
            }
        });
        subscription.push(sources_subscription);
        subscription.push(out.disarm_subscription());
        subscription
    })
}

fn fixed_sources<K: Key, V: Data>(
    sources: Vec<Stream<ChangeSet<K, V>>>,
) -> Stream<ListChangeSet<Stream<ChangeSet<K, V>>>> {
    Stream::new(move |mut observer| {
        if !sources.is_empty() {
            observer
                .on_next([ListChange::AddRange { items: sources.clone(), index: 0 }]
                    .into_iter()
                    .collect());
        }
        observer.on_complete();
        Subscription::empty()
    })
}

/// Keys present in every source.
pub fn and<K: Key, V: Data + PartialEq>(
    sources: Vec<Stream<ChangeSet<K, V>>>,
) -> Stream<ChangeSet<K, V>> {
    combine(CombineOperator::And, &fixed_sources(sources))
}

/// Keys present in any source.
pub fn or<K: Key, V: Data + PartialEq>(
    sources: Vec<Stream<ChangeSet<K, V>>>,
) -> Stream<ChangeSet<K, V>> {
    combine(CombineOperator::Or, &fixed_sources(sources))
}

/// Keys present in exactly one source.
pub fn xor<K: Key, V: Data + PartialEq>(
    sources: Vec<Stream<ChangeSet<K, V>>>,
) -> Stream<ChangeSet<K, V>> {
    combine(CombineOperator::Xor, &fixed_sources(sources))
}

/// Keys present in the first source and in no other.
pub fn except<K: Key, V: Data + PartialEq>(
    sources: Vec<Stream<ChangeSet<K, V>>>,
) -> Stream<ChangeSet<K, V>> {
    combine(CombineOperator::Except, &fixed_sources(sources))
}
