//! Match keyed streams on a shared key.
//!
//! Joins maintain two mirror caches — the left stream as-is, the right stream
//! re-keyed through its key selector — and recompute the result entry for
//! every key a change touches. The four variants differ only in which sides
//! are mandatory: `left_join` keeps exactly the left's keys, `right_join` the
//! right's, `inner_join` the intersection, `full_join` the union.
//!
//! `full_join_many` composes a grouping stage with `full_join` so that each
//! left key is matched against the whole set of right values sharing it,
//! delivered as an immutable [`Grouping`] snapshot.

use std::sync::Arc;

use fnv::FnvBuildHasher;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use crate::cache::{Cache, ChangeAwareCache};
use crate::change::Change;
use crate::changeset::ChangeSet;
use crate::error::Error;
use crate::operators::OperatorOutput;
use crate::stream::{Observer, Stream, Subscription};
use crate::{Data, Key};

type RightKey<KL, R> = Arc<dyn Fn(&R) -> KL + Send + Sync>;
type Recompute<KL, L, R, D> =
    Arc<dyn Fn(&KL, Option<&L>, Option<&R>) -> Option<D> + Send + Sync>;

struct JoinState<KL, L, R, D> {
    left: Cache<KL, L>,
    right: Cache<KL, R>,
    result: ChangeAwareCache<KL, D>,
    recompute: Recompute<KL, L, R, D>,
    out: OperatorOutput<ChangeSet<KL, D>>,
    left_done: bool,
    right_done: bool,
    stopped: bool,
}

impl<KL: Key, L: Data, R: Data, D: Data> JoinState<KL, L, R, D> {
    /// Recomputes the result entry for `key` from the current mirrors.
    fn react(&mut self, key: &KL) {
        let desired = (self.recompute)(key, self.left.lookup(key), self.right.lookup(key));
        match desired {
            Some(value) => self.result.add_or_update(key.clone(), value),
            None => self.result.remove(key),
        }
    }

    fn flush(&mut self) {
        let changes = self.result.capture();
        if !changes.is_empty() {
            self.out.next(changes);
        }
    }

    fn fail(&mut self, error: Error) {
        self.stopped = true;
        self.left.clear();
        self.right.clear();
        self.out.error(error);
    }

    fn check_complete(&mut self) {
        if self.left_done && self.right_done && !self.stopped {
            self.stopped = true;
            self.out.complete();
        }
    }
}

struct LeftObserver<KL, L, R, D> {
    state: Arc<Mutex<JoinState<KL, L, R, D>>>,
}

impl<KL: Key, L: Data, R: Data, D: Data> Observer<ChangeSet<KL, L>>
    for LeftObserver<KL, L, R, D>
{
    fn on_next(&mut self, changes: ChangeSet<KL, L>) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        if let Err(error) = state.left.apply(&changes) {
            state.fail(error);
            return;
        }
        for change in changes.iter() {
            match change {
                Change::Add { key, .. }
                | Change::Update { key, .. }
                | Change::Remove { key, .. } => state.react(key),
                Change::Refresh { key, .. } => state.result.refresh(key),
                Change::Moved { .. } => {}
            }
        }
        state.flush();
    }

    fn on_error(&mut self, error: Error) {
        let mut state = self.state.lock();
        if !state.stopped {
            state.fail(error);
        }
    }

    fn on_complete(&mut self) {
        let mut state = self.state.lock();
        state.left_done = true;
        state.check_complete();
    }
}

struct RightObserver<KL, KR, L, R, D> {
    state: Arc<Mutex<JoinState<KL, L, R, D>>>,
    right_key: RightKey<KL, R>,
    _marker: std::marker::PhantomData<fn(KR)>,
}

impl<KL: Key, KR: Key, L: Data, R: Data, D: Data> Observer<ChangeSet<KR, R>>
    for RightObserver<KL, KR, L, R, D>
{
    fn on_next(&mut self, changes: ChangeSet<KR, R>) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        for change in changes.iter() {
            match change {
                Change::Add { current, .. } => {
                    let key = (self.right_key)(current);
                    state.right.insert(key.clone(), current.clone());
                    state.react(&key);
                }
                Change::Update { current, previous, .. } => {
                    // A value whose selector re-keys it migrates between
                    // join keys: retire the old entry, then install the new.
                    let old_key = (self.right_key)(previous);
                    let new_key = (self.right_key)(current);
                    if old_key != new_key {
                        state.right.remove(&old_key);
                        state.react(&old_key);
                    }
                    state.right.insert(new_key.clone(), current.clone());
                    state.react(&new_key);
                }
                Change::Remove { previous, .. } => {
                    let key = (self.right_key)(previous);
                    state.right.remove(&key);
                    state.react(&key);
                }
                Change::Refresh { current, .. } => {
                    let key = (self.right_key)(current);
                    state.result.refresh(&key);
                }
                Change::Moved { .. } => {}
            }
        }
        state.flush();
    }

    fn on_error(&mut self, error: Error) {
        let mut state = self.state.lock();
        if !state.stopped {
            state.fail(error);
        }
    }

    fn on_complete(&mut self) {
        let mut state = self.state.lock();
        state.right_done = true;
        state.check_complete();
    }
}

fn join_core<KL: Key, KR: Key, L: Data, R: Data, D: Data>(
    left: &Stream<ChangeSet<KL, L>>,
    right: &Stream<ChangeSet<KR, R>>,
    right_key: RightKey<KL, R>,
    recompute: Recompute<KL, L, R, D>,
) -> Stream<ChangeSet<KL, D>> {
    let left = left.clone();
    let right = right.clone();
    Stream::new(move |observer| {
        let out = OperatorOutput::new(observer);
        let state = Arc::new(Mutex::new(JoinState {
            left: Cache::new(),
            right: Cache::new(),
            result: ChangeAwareCache::new(),
            recompute: Arc::clone(&recompute),
            out: out.clone(),
            left_done: false,
            right_done: false,
            stopped: false,
        }));

        let left_subscription = left.subscribe(LeftObserver { state: Arc::clone(&state) });
        let right_subscription = right.subscribe(RightObserver {
            state: Arc::clone(&state),
            right_key: Arc::clone(&right_key),
            _marker: std::marker::PhantomData,
        });

        let mut subscription = Subscription::bundle([left_subscription, right_subscription]);
        subscription.push(out.disarm_subscription());
        subscription
    })
}

/// Join operators on keyed change-set streams.
pub trait Join<KL: Key, L: Data> {
    /// Matches every left entry against the right entry sharing its key.
    ///
    /// The result holds exactly the left's keys; the right side is optional.
    ///
    /// # Examples
    ///
    /// ```
    /// use deltaflow::operators::Join;
    /// use deltaflow::{ObservableCache, SourceCache};
    ///
    /// let people = SourceCache::new();
    /// let addresses = SourceCache::new();
    /// people.edit(|cache| cache.add_or_update(1u32, "ada"));
    /// addresses.edit(|cache| cache.add_or_update("a-1", (1u32, "17 Church St")));
    ///
    /// let joined = people.connect().left_join(
    ///     &addresses.connect(),
    ///     |address: &(u32, &str)| address.0,
    ///     |_, name, address| (*name, address.map(|a| a.1)),
    /// );
    /// let view = ObservableCache::new(&joined);
    /// assert_eq!(view.lookup(&1), Some(("ada", Some("17 Church St"))));
    /// ```
    fn left_join<KR: Key, R: Data, D: Data>(
        &self,
        right: &Stream<ChangeSet<KR, R>>,
        right_key: impl Fn(&R) -> KL + Send + Sync + 'static,
        selector: impl Fn(&KL, &L, Option<&R>) -> D + Send + Sync + 'static,
    ) -> Stream<ChangeSet<KL, D>>;

    /// Matches every right entry against the left entry sharing its key.
    ///
    /// The result holds exactly the right's (re-keyed) keys; the left side is
    /// optional.
    fn right_join<KR: Key, R: Data, D: Data>(
        &self,
        right: &Stream<ChangeSet<KR, R>>,
        right_key: impl Fn(&R) -> KL + Send + Sync + 'static,
        selector: impl Fn(&KL, Option<&L>, &R) -> D + Send + Sync + 'static,
    ) -> Stream<ChangeSet<KL, D>>;

    /// Matches only keys present on both sides.
    fn inner_join<KR: Key, R: Data, D: Data>(
        &self,
        right: &Stream<ChangeSet<KR, R>>,
        right_key: impl Fn(&R) -> KL + Send + Sync + 'static,
        selector: impl Fn(&KL, &L, &R) -> D + Send + Sync + 'static,
    ) -> Stream<ChangeSet<KL, D>>;

    /// Matches keys present on either side; both sides are optional.
    fn full_join<KR: Key, R: Data, D: Data>(
        &self,
        right: &Stream<ChangeSet<KR, R>>,
        right_key: impl Fn(&R) -> KL + Send + Sync + 'static,
        selector: impl Fn(&KL, Option<&L>, Option<&R>) -> D + Send + Sync + 'static,
    ) -> Stream<ChangeSet<KL, D>>;

    /// Matches keys present on either side against the whole *group* of right
    /// values sharing the key.
    ///
    /// The right stream is grouped by `group_key`; the selector receives an
    /// immutable [`Grouping`] snapshot, empty when the right side has no
    /// values for the key.
    fn full_join_many<KR: Key, R: Data, D: Data>(
        &self,
        right: &Stream<ChangeSet<KR, R>>,
        group_key: impl Fn(&R) -> KL + Send + Sync + 'static,
        selector: impl Fn(&KL, Option<&L>, &Grouping<KL, KR, R>) -> D + Send + Sync + 'static,
    ) -> Stream<ChangeSet<KL, D>>;
}

impl<KL: Key, L: Data> Join<KL, L> for Stream<ChangeSet<KL, L>> {
    fn left_join<KR: Key, R: Data, D: Data>(
        &self,
        right: &Stream<ChangeSet<KR, R>>,
        right_key: impl Fn(&R) -> KL + Send + Sync + 'static,
        selector: impl Fn(&KL, &L, Option<&R>) -> D + Send + Sync + 'static,
    ) -> Stream<ChangeSet<KL, D>> {
        join_core(
            self,
            right,
            Arc::new(right_key),
            Arc::new(move |key: &KL, l: Option<&L>, r: Option<&R>| {
                l.map(|left_value| selector(key, left_value, r))
            }),
        )
    }

    fn right_join<KR: Key, R: Data, D: Data>(
        &self,
        right: &Stream<ChangeSet<KR, R>>,
        right_key: impl Fn(&R) -> KL + Send + Sync + 'static,
        selector: impl Fn(&KL, Option<&L>, &R) -> D + Send + Sync + 'static,
    ) -> Stream<ChangeSet<KL, D>> {
        join_core(
            self,
            right,
            Arc::new(right_key),
            Arc::new(move |key: &KL, l: Option<&L>, r: Option<&R>| {
                r.map(|right_value| selector(key, l, right_value))
            }),
        )
    }

    fn inner_join<KR: Key, R: Data, D: Data>(
        &self,
        right: &Stream<ChangeSet<KR, R>>,
        right_key: impl Fn(&R) -> KL + Send + Sync + 'static,
        selector: impl Fn(&KL, &L, &R) -> D + Send + Sync + 'static,
    ) -> Stream<ChangeSet<KL, D>> {
        join_core(
            self,
            right,
            Arc::new(right_key),
            Arc::new(move |key: &KL, l: Option<&L>, r: Option<&R>| match (l, r) {
                (Some(left_value), Some(right_value)) => {
                    Some(selector(key, left_value, right_value))
                }
                _ => None,
            }),
        )
    }

    fn full_join<KR: Key, R: Data, D: Data>(
        &self,
        right: &Stream<ChangeSet<KR, R>>,
        right_key: impl Fn(&R) -> KL + Send + Sync + 'static,
        selector: impl Fn(&KL, Option<&L>, Option<&R>) -> D + Send + Sync + 'static,
    ) -> Stream<ChangeSet<KL, D>> {
        join_core(
            self,
            right,
            Arc::new(right_key),
            Arc::new(move |key: &KL, l: Option<&L>, r: Option<&R>| {
                if l.is_none() && r.is_none() {
                    None
                } else {
                    Some(selector(key, l, r))
                }
            }),
        )
    }

    fn full_join_many<KR: Key, R: Data, D: Data>(
        &self,
        right: &Stream<ChangeSet<KR, R>>,
        group_key: impl Fn(&R) -> KL + Send + Sync + 'static,
        selector: impl Fn(&KL, Option<&L>, &Grouping<KL, KR, R>) -> D + Send + Sync + 'static,
    ) -> Stream<ChangeSet<KL, D>> {
        let grouped = group_by_key(right, group_key);
        join_core(
            self,
            &grouped,
            Arc::new(|group: &Grouping<KL, KR, R>| group.key().clone()),
            Arc::new(
                move |key: &KL, l: Option<&L>, group: Option<&Grouping<KL, KR, R>>| {
                    if l.is_none() && group.is_none() {
                        return None;
                    }
                    match group {
                        Some(group) => Some(selector(key, l, group)),
                        None => Some(selector(key, l, &Grouping::empty(key.clone()))),
                    }
                },
            ),
        )
    }
}

type GroupEntries<K, V> = IndexMap<K, V, FnvBuildHasher>;

/// An immutable snapshot of the keyed values sharing one group key.
///
/// Cloning shares the snapshot storage; a grouping never changes after it is
/// emitted.
#[derive(Debug)]
pub struct Grouping<G, K, V> {
    key: G,
    entries: Arc<GroupEntries<K, V>>,
}

impl<G: Clone, K, V> Clone for Grouping<G, K, V> {
    fn clone(&self) -> Self {
        Grouping { key: self.key.clone(), entries: Arc::clone(&self.entries) }
    }
}

impl<G, K, V> Grouping<G, K, V>
where
    K: Eq + std::hash::Hash,
{
    /// A grouping with no entries.
    pub fn empty(key: G) -> Self {
        Grouping { key, entries: Arc::new(GroupEntries::default()) }
    }

    /// The group key.
    pub fn key(&self) -> &G {
        &self.key
    }

    /// The number of entries in the group.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the group has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The value under `key` within the group, if present.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Iterates the group's entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    /// Iterates the group's values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }
}

struct GroupState<G, K, V> {
    groups: IndexMap<G, GroupEntries<K, V>, FnvBuildHasher>,
    result: ChangeAwareCache<G, Grouping<G, K, V>>,
    out: OperatorOutput<ChangeSet<G, Grouping<G, K, V>>>,
    stopped: bool,
}

struct GroupObserver<G, K, V> {
    state: Arc<Mutex<GroupState<G, K, V>>>,
    group_key: Arc<dyn Fn(&V) -> G + Send + Sync>,
}

impl<G: Key, K: Key, V: Data> Observer<ChangeSet<K, V>> for GroupObserver<G, K, V> {
    fn on_next(&mut self, changes: ChangeSet<K, V>) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        let mut touched: IndexSet<G, FnvBuildHasher> = IndexSet::default();
        for change in changes.iter() {
            match change {
                Change::Add { key, current } => {
                    let group = (self.group_key)(current);
                    state
                        .groups
                        .entry(group.clone())
                        .or_default()
                        .insert(key.clone(), current.clone());
                    touched.insert(group);
                }
                Change::Update { key, current, previous } => {
                    let old_group = (self.group_key)(previous);
                    let new_group = (self.group_key)(current);
                    if old_group != new_group {
                        if let Some(entries) = state.groups.get_mut(&old_group) {
                            entries.shift_remove(key);
                        }
                        touched.insert(old_group);
                    }
                    state
                        .groups
                        .entry(new_group.clone())
                        .or_default()
                        .insert(key.clone(), current.clone());
                    touched.insert(new_group);
                }
                Change::Remove { key, previous } => {
                    let group = (self.group_key)(previous);
                    if let Some(entries) = state.groups.get_mut(&group) {
                        entries.shift_remove(key);
                    }
                    touched.insert(group);
                }
                Change::Refresh { current, .. } => {
                    let group = (self.group_key)(current);
                    state.result.refresh(&group);
                }
                Change::Moved { .. } => {}
            }
        }
        for group in touched {
            let snapshot = match state.groups.get(&group) {
                Some(entries) if !entries.is_empty() => Some(entries.clone()),
                _ => None,
            };
            match snapshot {
                Some(entries) => {
                    let grouping = Grouping { key: group.clone(), entries: Arc::new(entries) };
                    state.result.add_or_update(group, grouping);
                }
                None => {
                    state.groups.shift_remove(&group);
                    state.result.remove(&group);
                }
            }
        }
        let captured = state.result.capture();
        if !captured.is_empty() {
            state.out.next(captured);
        }
    }

    fn on_error(&mut self, error: Error) {
        let mut state = self.state.lock();
        if !state.stopped {
            state.stopped = true;
            state.groups.clear();
            state.out.error(error);
        }
    }

    fn on_complete(&mut self) {
        let mut state = self.state.lock();
        if !state.stopped {
            state.stopped = true;
            state.out.complete();
        }
    }
}

/// Groups a keyed stream by a key derived from each value, emitting immutable
/// group snapshots. Internal building block of `full_join_many`.
fn group_by_key<G: Key, K: Key, V: Data>(
    source: &Stream<ChangeSet<K, V>>,
    group_key: impl Fn(&V) -> G + Send + Sync + 'static,
) -> Stream<ChangeSet<G, Grouping<G, K, V>>> {
    let source = source.clone();
    let group_key: Arc<dyn Fn(&V) -> G + Send + Sync> = Arc::new(group_key);
    Stream::new(move |observer| {
        let out = OperatorOutput::new(observer);
        let state = Arc::new(Mutex::new(GroupState {
            groups: IndexMap::default(),
            result: ChangeAwareCache::new(),
            out: out.clone(),
            stopped: false,
        }));
        let upstream = source.subscribe(GroupObserver {
            state: Arc::clone(&state),
            group_key: Arc::clone(&group_key),
        });
        let mut subscription = Subscription::bundle([upstream]);
        subscription.push(out.disarm_subscription());
        subscription
    })
}
