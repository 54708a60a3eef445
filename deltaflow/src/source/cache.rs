//! The keyed source collection.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::ChangeAwareCache;
use crate::change::Change;
use crate::changeset::ChangeSet;
use crate::stream::{Observer, Stream, Subscription};
use crate::{Data, Key};

struct SourceState<K, V> {
    cache: ChangeAwareCache<K, V>,
    subscribers: Vec<(u64, Box<dyn Observer<ChangeSet<K, V>>>)>,
    next_id: u64,
}

impl<K: Key, V: Data> SourceState<K, V> {
    fn publish_captured(&mut self) {
        let changes = self.cache.capture();
        if changes.is_empty() {
            return;
        }
        tracing::trace!(changes = changes.total_changes(), "source cache publishing edit");
        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber.on_next(changes.clone());
        }
    }
}

/// A mutable keyed collection observable as a stream of change sets.
///
/// Handles are cheap clones of one shared collection. All mutation happens
/// inside [`edit`](SourceCache::edit) (or [`edit_diff`](SourceCache::edit_diff)),
/// which publishes a single change set per transaction; transactions that
/// net out to nothing publish nothing.
///
/// # Examples
///
/// ```
/// use deltaflow::SourceCache;
///
/// let source = SourceCache::new();
/// let view = deltaflow::ObservableCache::new(&source.connect());
///
/// source.edit(|cache| {
///     cache.add_or_update(1, "a");
///     cache.add_or_update(2, "b");
/// });
///
/// assert_eq!(view.len(), 2);
/// assert_eq!(view.lookup(&2), Some("b"));
/// ```
pub struct SourceCache<K, V> {
    inner: Arc<Mutex<SourceState<K, V>>>,
}

impl<K, V> Clone for SourceCache<K, V> {
    fn clone(&self) -> Self {
        SourceCache { inner: Arc::clone(&self.inner) }
    }
}

impl<K: Key, V: Data> SourceCache<K, V> {
    /// An empty source cache.
    pub fn new() -> Self {
        SourceCache {
            inner: Arc::new(Mutex::new(SourceState {
                cache: ChangeAwareCache::new(),
                subscribers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Runs one transactional batch of mutations.
    ///
    /// Observers receive a single change set reflecting the whole batch.
    pub fn edit(&self, batch: impl FnOnce(&mut CacheUpdater<'_, K, V>)) {
        let mut state = self.inner.lock();
        let state = &mut *state;
        batch(&mut CacheUpdater { cache: &mut state.cache });
        state.publish_captured();
    }

    /// Replaces the collection's contents with `items`, emitting the minimal
    /// difference as one transaction.
    ///
    /// Key-set differencing uses key equality; a retained key only records an
    /// update when `eq` judges its old and new values different. Removals are
    /// applied before upserts. When `items` repeats a key, the last pair wins.
    ///
    /// # Examples
    ///
    /// ```
    /// use deltaflow::SourceCache;
    ///
    /// let source = SourceCache::new();
    /// source.edit(|cache| {
    ///     cache.add_or_update(1, "a");
    ///     cache.add_or_update(2, "b");
    /// });
    ///
    /// let stream = source.connect();
    /// let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    /// let sink = std::sync::Arc::clone(&seen);
    /// let _sub = stream.subscribe_next(move |changes| sink.lock().push(changes));
    ///
    /// source.edit_diff(vec![(1, "a"), (2, "B"), (3, "c")], |old, new| old == new);
    ///
    /// let seen = seen.lock();
    /// // one change set: the initial snapshot, then the diff
    /// assert_eq!(seen.len(), 2);
    /// assert_eq!(seen[1].updates(), 1);
    /// assert_eq!(seen[1].adds(), 1);
    /// assert_eq!(seen[1].removes(), 0);
    /// ```
    pub fn edit_diff(
        &self,
        items: impl IntoIterator<Item = (K, V)>,
        eq: impl Fn(&V, &V) -> bool,
    ) {
        let mut state = self.inner.lock();
        let state = &mut *state;

        let mut incoming: indexmap::IndexMap<K, V, fnv::FnvBuildHasher> =
            indexmap::IndexMap::default();
        for (key, value) in items {
            incoming.insert(key, value);
        }

        let removals: Vec<K> = state
            .cache
            .iter()
            .map(|(key, _)| key.clone())
            .filter(|key| !incoming.contains_key(key))
            .collect();
        for key in &removals {
            state.cache.remove(key);
        }

        for (key, value) in incoming {
            match state.cache.lookup(&key) {
                Some(existing) if eq(existing, &value) => {}
                _ => state.cache.add_or_update(key, value),
            }
        }

        state.publish_captured();
    }

    /// The change-set stream of this collection.
    ///
    /// A new observer first receives the current state as a batch of adds
    /// (skipped when the collection is empty), then one change set per edit.
    pub fn connect(&self) -> Stream<ChangeSet<K, V>> {
        let inner = Arc::clone(&self.inner);
        Stream::new(move |observer| {
            let mut state = inner.lock();
            let state = &mut *state;
            let snapshot: ChangeSet<K, V> = state
                .cache
                .iter()
                .map(|(key, value)| Change::Add { key: key.clone(), current: value.clone() })
                .collect();
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.push((id, observer));
            if !snapshot.is_empty() {
                if let Some((_, subscriber)) = state.subscribers.last_mut() {
                    subscriber.on_next(snapshot);
                }
            }
            tracing::debug!(subscriber = id, "source cache connected");
            let weak = Arc::downgrade(&inner);
            Subscription::new(move || {
                if let Some(strong) = weak.upgrade() {
                    strong.lock().subscribers.retain(|(entry, _)| *entry != id);
                }
            })
        })
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().cache.is_empty()
    }

    /// The value under `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.inner.lock().cache.lookup(key).cloned()
    }

    /// A snapshot of the entries in insertion order.
    pub fn items(&self) -> Vec<(K, V)> {
        self.inner.lock().cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl<K: Key, V: Data> Default for SourceCache<K, V> {
    fn default() -> Self {
        SourceCache::new()
    }
}

/// The mutation surface handed to [`SourceCache::edit`] batches.
pub struct CacheUpdater<'a, K, V> {
    cache: &'a mut ChangeAwareCache<K, V>,
}

impl<K: Key, V: Data> CacheUpdater<'_, K, V> {
    /// Writes the mapping; records an add or an update accordingly.
    pub fn add_or_update(&mut self, key: K, value: V) {
        self.cache.add_or_update(key, value);
    }

    /// Removes the mapping; absent keys are a no-op.
    pub fn remove(&mut self, key: &K) {
        self.cache.remove(key);
    }

    /// Signals that the value under `key` changed observably.
    pub fn refresh(&mut self, key: &K) {
        self.cache.refresh(key);
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// The value under `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.cache.lookup(key)
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
