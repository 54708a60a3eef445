//! The push-based stream primitive operators are built on.
//!
//! A [`Stream`] is a cloneable handle around a subscribe function: each call
//! to [`subscribe`](Stream::subscribe) runs the factory, which wires an
//! [`Observer`] to a source and returns the [`Subscription`] that undoes the
//! wiring. Factories create fresh state per subscription; nothing is shared
//! between two subscriptions to the same stream unless a
//! [`Connectable`](crate::sync::Connectable) makes the sharing explicit.
//!
//! Delivery guarantees, stated once here and relied on everywhere:
//! an observer receives any number of `on_next` calls followed by at most one
//! terminal `on_error` or `on_complete`, with no overlapping calls into one
//! observer. Multi-source operators obtain a total order across their
//! upstreams by funneling every upstream through one lock (see
//! [`synchronize`](Stream::synchronize) and the operator modules).

use std::sync::Arc;

use crate::error::Error;

/// The receiving side of a stream.
///
/// At most one of `on_error` / `on_complete` is delivered, and nothing after.
pub trait Observer<T>: Send {
    /// A value was emitted.
    fn on_next(&mut self, value: T);
    /// The stream terminated with a failure.
    fn on_error(&mut self, error: Error);
    /// The stream terminated normally.
    fn on_complete(&mut self);
}

/// An [`Observer`] assembled from closures.
///
/// Omitted callbacks default to no-ops, except that an unhandled error is
/// logged at debug level before being dropped.
pub struct CallbackObserver<T> {
    next: Box<dyn FnMut(T) + Send>,
    error: Option<Box<dyn FnMut(Error) + Send>>,
    complete: Option<Box<dyn FnMut() + Send>>,
}

impl<T> CallbackObserver<T> {
    /// An observer forwarding values to `next`.
    pub fn next(next: impl FnMut(T) + Send + 'static) -> Self {
        CallbackObserver { next: Box::new(next), error: None, complete: None }
    }

    /// Adds an error callback.
    pub fn with_error(mut self, error: impl FnMut(Error) + Send + 'static) -> Self {
        self.error = Some(Box::new(error));
        self
    }

    /// Adds a completion callback.
    pub fn with_complete(mut self, complete: impl FnMut() + Send + 'static) -> Self {
        self.complete = Some(Box::new(complete));
        self
    }
}

impl<T> Observer<T> for CallbackObserver<T> {
    fn on_next(&mut self, value: T) {
        (self.next)(value);
    }

    fn on_error(&mut self, error: Error) {
        match self.error.as_mut() {
            Some(callback) => callback(error),
            None => tracing::debug!(%error, "stream error reached an observer without an error callback"),
        }
    }

    fn on_complete(&mut self) {
        if let Some(callback) = self.complete.as_mut() {
            callback();
        }
    }
}

impl<T> Observer<T> for Box<dyn Observer<T>> {
    fn on_next(&mut self, value: T) {
        (**self).on_next(value);
    }

    fn on_error(&mut self, error: Error) {
        (**self).on_error(error);
    }

    fn on_complete(&mut self) {
        (**self).on_complete();
    }
}

type SubscribeFn<T> = dyn Fn(Box<dyn Observer<T>>) -> Subscription + Send + Sync;

/// A push-based stream of values.
///
/// Cloning the handle clones the subscribe function, not any state: each
/// subscription is independent.
pub struct Stream<T> {
    subscribe_fn: Arc<SubscribeFn<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Stream { subscribe_fn: Arc::clone(&self.subscribe_fn) }
    }
}

impl<T: 'static> Stream<T> {
    /// A stream from a subscribe function.
    ///
    /// The function is invoked once per [`subscribe`](Stream::subscribe) call
    /// and must return the subscription that tears down everything it set up.
    pub fn new(
        subscribe_fn: impl Fn(Box<dyn Observer<T>>) -> Subscription + Send + Sync + 'static,
    ) -> Self {
        Stream { subscribe_fn: Arc::new(subscribe_fn) }
    }

    /// Attaches an observer, returning the subscription that detaches it.
    pub fn subscribe(&self, observer: impl Observer<T> + 'static) -> Subscription {
        (self.subscribe_fn)(Box::new(observer))
    }

    /// Attaches a value-only observer.
    pub fn subscribe_next(&self, next: impl FnMut(T) + Send + 'static) -> Subscription {
        self.subscribe(CallbackObserver::next(next))
    }

    /// A stream that emits each value in order, then completes.
    ///
    /// # Examples
    ///
    /// ```
    /// use deltaflow::Stream;
    ///
    /// let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    /// let sink = std::sync::Arc::clone(&seen);
    /// let _sub = Stream::from_values(vec![1, 2, 3])
    ///     .subscribe_next(move |v| sink.lock().unwrap().push(v));
    /// assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    /// ```
    pub fn from_values(values: Vec<T>) -> Self
    where
        T: Clone + Send + Sync,
    {
        Stream::new(move |mut observer| {
            for value in values.iter().cloned() {
                observer.on_next(value);
            }
            observer.on_complete();
            Subscription::empty()
        })
    }

    /// A stream that terminates every subscriber immediately with `error`.
    pub fn failed(error: Error) -> Self {
        Stream::new(move |mut observer| {
            observer.on_error(error.clone());
            Subscription::empty()
        })
    }

    /// A stream that never emits and never terminates.
    pub fn never() -> Self {
        Stream::new(|_observer| Subscription::empty())
    }
}

type Teardown = Box<dyn FnOnce() + Send>;

/// A composite disposable.
///
/// Disposal runs the collected teardown actions in LIFO order, is idempotent,
/// and also happens on drop, so holding a subscription in a scope pins the
/// wiring to that scope.
///
/// # Examples
///
/// ```
/// use deltaflow::Subscription;
///
/// let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
/// let mut sub = Subscription::new({
///     let log = std::sync::Arc::clone(&log);
///     move || log.lock().unwrap().push("first registered")
/// });
/// sub.push(Subscription::new({
///     let log = std::sync::Arc::clone(&log);
///     move || log.lock().unwrap().push("second registered")
/// }));
/// sub.dispose();
/// sub.dispose(); // idempotent
/// assert_eq!(*log.lock().unwrap(), vec!["second registered", "first registered"]);
/// ```
#[must_use = "dropping a subscription disposes it"]
pub struct Subscription {
    teardown: Vec<Teardown>,
    disposed: bool,
}

impl Subscription {
    /// A subscription with nothing to tear down.
    pub fn empty() -> Self {
        Subscription { teardown: Vec::new(), disposed: false }
    }

    /// A subscription running `action` on disposal.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Subscription { teardown: vec![Box::new(action)], disposed: false }
    }

    /// Bundles several subscriptions; disposal runs them in LIFO order.
    pub fn bundle(parts: impl IntoIterator<Item = Subscription>) -> Self {
        let mut bundled = Subscription::empty();
        for part in parts {
            bundled.push(part);
        }
        bundled
    }

    /// Appends another subscription's teardown; it will run before the
    /// actions already held (LIFO).
    pub fn push(&mut self, mut other: Subscription) {
        if self.disposed {
            other.dispose();
        } else {
            self.teardown.append(&mut other.teardown);
            other.disposed = true;
        }
    }

    /// Runs the teardown actions in LIFO order. Subsequent calls do nothing.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for action in self.teardown.drain(..).rev() {
            action();
        }
    }

    /// True once [`dispose`](Subscription::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}
