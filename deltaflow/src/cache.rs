//! Keyed stores with insertion-ordered iteration.
//!
//! [`Cache`] is the plain mapping: unique keys, iteration order equal to the
//! insertion order of the keys still present. [`ChangeAwareCache`] layers a
//! buffered delta log on top: every mutating operation records the
//! corresponding [`Change`], and [`capture`](ChangeAwareCache::capture)
//! atomically drains the buffer into a [`ChangeSet`]. Operators hold a
//! `ChangeAwareCache` as their result store so that whatever sequence of
//! mutations a reaction performs, the emitted change set is exactly the
//! minimal delta the downstream needs.

use fnv::FnvBuildHasher;
use indexmap::IndexMap;

use crate::change::Change;
use crate::changeset::ChangeSet;
use crate::error::{Error, Result};

type Map<K, V> = IndexMap<K, V, FnvBuildHasher>;

/// A keyed in-memory store.
///
/// Keys are unique; iteration yields entries in the insertion order of the
/// keys currently present. Updating a present key does not change its
/// position; removing a key does not reorder the survivors.
#[derive(Debug, Clone)]
pub struct Cache<K, V> {
    data: Map<K, V>,
}

impl<K, V> Cache<K, V>
where
    K: Clone + Eq + std::hash::Hash,
    V: Clone,
{
    /// An empty cache.
    pub fn new() -> Self {
        Cache { data: Map::default() }
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The value under `key`, if present. Never mutates.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.data.get(key)
    }

    /// True when `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    /// Writes the mapping, returning the displaced value if the key was present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.data.insert(key, value)
    }

    /// Removes the mapping, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.data.shift_remove(key)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.data.iter()
    }

    /// Iterates keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.data.keys()
    }

    /// Iterates values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.data.values()
    }

    /// Replays an external change set against this cache.
    ///
    /// Used by receivers mirroring a sender: applying every change set a
    /// sender emits, in order, keeps the mirror equal to the sender's state.
    /// An `Update` for an absent key cannot be replayed and is reported as an
    /// invariant violation. `Refresh` and `Moved` do not touch storage, and a
    /// `Remove` of an absent key is a no-op, mirroring the recording rules of
    /// [`ChangeAwareCache`].
    pub fn apply(&mut self, changes: &ChangeSet<K, V>) -> Result<()> {
        for change in changes.iter() {
            match change {
                Change::Add { key, current } => {
                    self.data.insert(key.clone(), current.clone());
                }
                Change::Update { key, current, .. } => {
                    match self.data.get_mut(key) {
                        Some(slot) => *slot = current.clone(),
                        None => {
                            return Err(Error::invariant(
                                "replayed an Update for a key that is not present",
                            ));
                        }
                    }
                }
                Change::Remove { key, .. } => {
                    self.data.shift_remove(key);
                }
                Change::Refresh { .. } | Change::Moved { .. } => {}
            }
        }
        Ok(())
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: Clone + Eq + std::hash::Hash,
    V: Clone,
{
    fn default() -> Self {
        Cache::new()
    }
}

/// A [`Cache`] that records the deltas applied to it.
///
/// # Examples
///
/// ```
/// use deltaflow::ChangeAwareCache;
///
/// let mut cache = ChangeAwareCache::new();
/// cache.add_or_update(1, "a");
/// cache.add_or_update(1, "b");
/// cache.remove(&2); // absent: records nothing
///
/// let changes = cache.capture();
/// assert_eq!(changes.adds(), 1);
/// assert_eq!(changes.updates(), 1);
/// assert_eq!(changes.removes(), 0);
///
/// // the buffer is drained by capture
/// assert!(cache.capture().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct ChangeAwareCache<K, V> {
    data: Cache<K, V>,
    changes: Vec<Change<K, V>>,
}

impl<K, V> ChangeAwareCache<K, V>
where
    K: Clone + Eq + std::hash::Hash,
    V: Clone,
{
    /// An empty cache with an empty delta buffer.
    pub fn new() -> Self {
        ChangeAwareCache { data: Cache::new(), changes: Vec::new() }
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The value under `key`, if present. Never mutates.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.data.lookup(key)
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.data.iter()
    }

    /// Writes the mapping and records `Add` for a previously absent key, or
    /// `Update` carrying the displaced value for a present one.
    pub fn add_or_update(&mut self, key: K, value: V) {
        match self.data.insert(key.clone(), value.clone()) {
            None => self.changes.push(Change::Add { key, current: value }),
            Some(previous) => {
                self.changes.push(Change::Update { key, current: value, previous });
            }
        }
    }

    /// Removes the mapping and records `Remove`; absent keys record nothing.
    pub fn remove(&mut self, key: &K) {
        if let Some(previous) = self.data.remove(key) {
            self.changes.push(Change::Remove { key: key.clone(), previous });
        }
    }

    /// Records `Refresh` for a present key without touching storage; absent
    /// keys record nothing.
    pub fn refresh(&mut self, key: &K) {
        if let Some(current) = self.data.lookup(key) {
            self.changes.push(Change::Refresh { key: key.clone(), current: current.clone() });
        }
    }

    /// Removes every entry, recording a `Remove` per entry in iteration order.
    pub fn clear(&mut self) {
        let drained: Vec<(K, V)> =
            self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.data.clear();
        for (key, previous) in drained {
            self.changes.push(Change::Remove { key, previous });
        }
    }

    /// Replays an external change set against internal state WITHOUT recording.
    ///
    /// Used when mirroring an upstream source: the upstream's deltas are
    /// already the change set the holder will forward, so re-recording them
    /// would double them up.
    pub fn apply(&mut self, changes: &ChangeSet<K, V>) -> Result<()> {
        self.data.apply(changes)
    }

    /// Atomically drains the buffered deltas.
    ///
    /// The returned change set preserves record order. When nothing was
    /// buffered the result is an empty set; callers must not forward empty
    /// sets downstream.
    pub fn capture(&mut self) -> ChangeSet<K, V> {
        std::mem::take(&mut self.changes).into_iter().collect()
    }
}

impl<K, V> Default for ChangeAwareCache<K, V>
where
    K: Clone + Eq + std::hash::Hash,
    V: Clone,
{
    fn default() -> Self {
        ChangeAwareCache::new()
    }
}
