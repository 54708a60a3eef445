//! Materialized views over change-set streams.
//!
//! A sink subscribes to a stream and folds every change set into a queryable
//! snapshot. Replay failures do not panic: the first invariant violation is
//! recorded, logged, and the view stops folding (fail-fast, §7 semantics).
//! Dropping the sink unsubscribes it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::Cache;
use crate::changeset::{ChangeSet, ListChangeSet};
use crate::error::Error;
use crate::stream::{Observer, Stream, Subscription};
use crate::{Data, Key};

struct CacheView<K, V> {
    cache: Cache<K, V>,
    error: Option<Error>,
    completed: bool,
}

struct CacheViewObserver<K, V> {
    view: Arc<Mutex<CacheView<K, V>>>,
}

impl<K: Key, V: Data> Observer<ChangeSet<K, V>> for CacheViewObserver<K, V> {
    fn on_next(&mut self, changes: ChangeSet<K, V>) {
        let mut view = self.view.lock();
        if view.error.is_some() {
            return;
        }
        if let Err(error) = view.cache.apply(&changes) {
            tracing::warn!(%error, "cache view stopped on replay failure");
            view.error = Some(error);
        }
    }

    fn on_error(&mut self, error: Error) {
        self.view.lock().error = Some(error);
    }

    fn on_complete(&mut self) {
        self.view.lock().completed = true;
    }
}

/// A keyed view maintained from a change-set stream.
pub struct ObservableCache<K, V> {
    view: Arc<Mutex<CacheView<K, V>>>,
    subscription: Subscription,
}

impl<K: Key, V: Data> ObservableCache<K, V> {
    /// Materializes `stream` into a queryable keyed snapshot.
    pub fn new(stream: &Stream<ChangeSet<K, V>>) -> Self {
        let view = Arc::new(Mutex::new(CacheView {
            cache: Cache::new(),
            error: None,
            completed: false,
        }));
        let subscription = stream.subscribe(CacheViewObserver { view: Arc::clone(&view) });
        ObservableCache { view, subscription }
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.view.lock().cache.len()
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.view.lock().cache.is_empty()
    }

    /// The value under `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.view.lock().cache.lookup(key).cloned()
    }

    /// A snapshot of the entries in insertion order.
    pub fn items(&self) -> Vec<(K, V)> {
        self.view.lock().cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// A snapshot of the keys in insertion order.
    pub fn keys(&self) -> Vec<K> {
        self.view.lock().cache.keys().cloned().collect()
    }

    /// The terminal error, if the stream failed or replay broke an invariant.
    pub fn error(&self) -> Option<Error> {
        self.view.lock().error.clone()
    }

    /// True once the stream completed.
    pub fn is_completed(&self) -> bool {
        self.view.lock().completed
    }

    /// Detaches the view from its stream; the snapshot stays queryable.
    pub fn disconnect(&mut self) {
        self.subscription.dispose();
    }
}

struct ListView<T> {
    items: Vec<T>,
    error: Option<Error>,
    completed: bool,
}

struct ListViewObserver<T> {
    view: Arc<Mutex<ListView<T>>>,
}

impl<T: Data> Observer<ListChangeSet<T>> for ListViewObserver<T> {
    fn on_next(&mut self, changes: ListChangeSet<T>) {
        let mut view = self.view.lock();
        if view.error.is_some() {
            return;
        }
        let view = &mut *view;
        if let Err(error) = changes.apply_to(&mut view.items) {
            tracing::warn!(%error, "list view stopped on replay failure");
            view.error = Some(error);
        }
    }

    fn on_error(&mut self, error: Error) {
        self.view.lock().error = Some(error);
    }

    fn on_complete(&mut self) {
        self.view.lock().completed = true;
    }
}

/// An ordered view maintained from a list change-set stream.
pub struct ObservableList<T> {
    view: Arc<Mutex<ListView<T>>>,
    subscription: Subscription,
}

impl<T: Data> ObservableList<T> {
    /// Materializes `stream` into a queryable ordered snapshot.
    pub fn new(stream: &Stream<ListChangeSet<T>>) -> Self {
        let view =
            Arc::new(Mutex::new(ListView { items: Vec::new(), error: None, completed: false }));
        let subscription = stream.subscribe(ListViewObserver { view: Arc::clone(&view) });
        ObservableList { view, subscription }
    }

    /// The number of items.
    pub fn len(&self) -> usize {
        self.view.lock().items.len()
    }

    /// True when no items are present.
    pub fn is_empty(&self) -> bool {
        self.view.lock().items.is_empty()
    }

    /// A snapshot of the items in order.
    pub fn items(&self) -> Vec<T> {
        self.view.lock().items.clone()
    }

    /// The terminal error, if the stream failed or replay broke an invariant.
    pub fn error(&self) -> Option<Error> {
        self.view.lock().error.clone()
    }

    /// True once the stream completed.
    pub fn is_completed(&self) -> bool {
        self.view.lock().completed
    }

    /// Detaches the view from its stream; the snapshot stays queryable.
    pub fn disconnect(&mut self) {
        self.subscription.dispose();
    }
}
