//! Deltaflow turns mutable keyed and ordered collections into observable
//! streams of incremental changes.
//!
//! Sources ([`SourceCache`], [`SourceList`]) are edited in transactional
//! batches; each batch is published as a single [`ChangeSet`] describing
//! exactly what changed. Operators subscribe to those streams, fold the
//! deltas into operator-owned caches, and publish derived change sets of
//! their own, so downstream consumers maintain filtered, joined, combined, or
//! aggregated views without ever re-evaluating from scratch. Sinks
//! ([`ObservableCache`], [`ObservableList`]) materialize a stream back into a
//! queryable snapshot.
//!
//! The change-set protocol is small and strict: change sets are ordered
//! sequences whose in-order replay reproduces the sender's state, summary
//! counters always equal the counted reasons, and empty change sets are never
//! emitted. Every operator preserves these invariants, which is what makes
//! operators freely composable.
//!
//! # Examples
//!
//! ```
//! use deltaflow::operators::Join;
//! use deltaflow::{ObservableCache, SourceCache};
//!
//! let left = SourceCache::new();
//! let right = SourceCache::new();
//!
//! let joined = left.connect().left_join(
//!     &right.connect(),
//!     |value: &(u32, char)| value.0,
//!     |key, left_value, right_value| (*key, *left_value, right_value.map(|r| r.1)),
//! );
//! let view = ObservableCache::new(&joined);
//!
//! left.edit(|cache| {
//!     cache.add_or_update(1, "one");
//!     cache.add_or_update(2, "two");
//! });
//! right.edit(|cache| cache.add_or_update(10, (1, 'a')));
//!
//! assert_eq!(view.lookup(&1), Some((1, "one", Some('a'))));
//! assert_eq!(view.lookup(&2), Some((2, "two", None)));
//! ```

#![forbid(unsafe_code)]

pub mod cache;
pub mod change;
pub mod changeset;
pub mod error;
pub mod operators;
pub mod sink;
pub mod source;
pub mod stream;
pub mod sync;

pub use cache::{Cache, ChangeAwareCache};
pub use change::{Change, ChangeReason, ListChange};
pub use changeset::{ChangeSet, ListChangeSet, VirtualChangeSet, VirtualResponse};
pub use error::{Error, ErrorKind};
pub use sink::{ObservableCache, ObservableList};
pub use source::{CacheUpdater, ListUpdater, SourceCache, SourceList};
pub use stream::{CallbackObserver, Observer, Stream, Subscription};
pub use sync::{gate, Connectable, Gate};

/// Values carried through change streams.
///
/// A blanket implementation covers every eligible type; the alias exists so
/// operator signatures stay readable.
pub trait Data: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> Data for T {}

/// Keys of keyed collections and change sets.
pub trait Key: Clone + Eq + std::hash::Hash + Send + Sync + 'static {}
impl<T: Clone + Eq + std::hash::Hash + Send + Sync + 'static> Key for T {}
