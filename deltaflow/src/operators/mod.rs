//! Operators over change-set streams.
//!
//! Every operator follows the same skeleton: on subscribe it creates a lock,
//! its internal mirror caches, and a result
//! [`ChangeAwareCache`](crate::ChangeAwareCache); it subscribes each upstream
//! so that delivery is serialized on the one lock; each upstream change set
//! mutates internal state and the result cache, whose captured delta — if
//! non-empty — is forwarded downstream. Upstream errors propagate once and
//! stop the operator; when every upstream completes, the operator completes.
//! Disposing the returned subscription detaches upstreams and releases owned
//! caches in LIFO order.

pub mod combine;
pub mod count;
pub mod join;
pub mod max;
pub mod merge;
pub mod monitor;

pub use combine::{and, combine, combine_with, except, or, xor, CombineOperator};
pub use count::Count;
pub use join::{Grouping, Join};
pub use max::Aggregate;
pub use merge::{MergeMany, MergeManyLists};
pub use monitor::{ConnectionStatus, Monitor};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::stream::{Observer, Subscription};

/// The guarded downstream handle operators emit through.
///
/// Forwards at most one terminal event and nothing after it; disarming drops
/// the observer without an event, which is how disposal stops future
/// emissions.
pub(crate) struct OperatorOutput<T> {
    observer: Arc<Mutex<Option<Box<dyn Observer<T>>>>>,
}

impl<T> Clone for OperatorOutput<T> {
    fn clone(&self) -> Self {
        OperatorOutput { observer: Arc::clone(&self.observer) }
    }
}

impl<T: 'static> OperatorOutput<T> {
    pub(crate) fn new(observer: Box<dyn Observer<T>>) -> Self {
        OperatorOutput { observer: Arc::new(Mutex::new(Some(observer))) }
    }

    pub(crate) fn next(&self, value: T) {
        if let Some(observer) = self.observer.lock().as_mut() {
            observer.on_next(value);
        }
    }

    pub(crate) fn error(&self, error: Error) {
        if let Some(mut observer) = self.observer.lock().take() {
            tracing::warn!(%error, "operator terminating on error");
            observer.on_error(error);
        }
    }

    pub(crate) fn complete(&self) {
        if let Some(mut observer) = self.observer.lock().take() {
            observer.on_complete();
        }
    }

    /// A subscription that silently drops the downstream observer.
    pub(crate) fn disarm_subscription(&self) -> Subscription {
        let observer = Arc::clone(&self.observer);
        Subscription::new(move || {
            observer.lock().take();
        })
    }
}
