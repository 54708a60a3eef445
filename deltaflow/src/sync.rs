//! Synchronization primitives: serialized delivery and shared publication.
//!
//! Two concerns live here. [`Stream::synchronize`] funnels a stream's
//! emissions through a caller-supplied mutex so that several upstreams
//! observed by one consumer form a total order. [`Connectable`] provides
//! shared publication: one upstream subscription multiplexed to any number of
//! inner consumers, established by [`connect`](Connectable::connect) and
//! released exactly once when the connection is disposed.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::stream::{Observer, Stream, Subscription};

/// A shareable lock used to serialize delivery from several streams.
pub type Gate = Arc<Mutex<()>>;

/// A fresh [`Gate`].
pub fn gate() -> Gate {
    Arc::new(Mutex::new(()))
}

struct SynchronizedObserver<T> {
    gate: Gate,
    inner: Box<dyn Observer<T>>,
}

impl<T> Observer<T> for SynchronizedObserver<T> {
    fn on_next(&mut self, value: T) {
        let _guard = self.gate.lock();
        self.inner.on_next(value);
    }

    fn on_error(&mut self, error: Error) {
        let _guard = self.gate.lock();
        self.inner.on_error(error);
    }

    fn on_complete(&mut self) {
        let _guard = self.gate.lock();
        self.inner.on_complete();
    }
}

impl<T: 'static> Stream<T> {
    /// Serializes this stream's emissions under `gate`.
    ///
    /// Subscribing several streams synchronized on the same gate guarantees
    /// their combined deliveries are totally ordered, which is how every
    /// multi-source operator in this crate observes its upstreams.
    pub fn synchronize(&self, gate: Gate) -> Stream<T> {
        let source = self.clone();
        Stream::new(move |observer| {
            source.subscribe(SynchronizedObserver { gate: Arc::clone(&gate), inner: observer })
        })
    }
}

struct Hub<T> {
    subscribers: Vec<(u64, Box<dyn Observer<T>>)>,
    next_id: u64,
    connected: bool,
}

struct HubObserver<T> {
    hub: Arc<Mutex<Hub<T>>>,
}

impl<T: Clone + Send> Observer<T> for HubObserver<T> {
    fn on_next(&mut self, value: T) {
        let mut hub = self.hub.lock();
        for (_, subscriber) in hub.subscribers.iter_mut() {
            subscriber.on_next(value.clone());
        }
    }

    fn on_error(&mut self, error: Error) {
        let mut drained = {
            let mut hub = self.hub.lock();
            std::mem::take(&mut hub.subscribers)
        };
        for (_, subscriber) in drained.iter_mut() {
            subscriber.on_error(error.clone());
        }
    }

    fn on_complete(&mut self) {
        let mut drained = {
            let mut hub = self.hub.lock();
            std::mem::take(&mut hub.subscribers)
        };
        for (_, subscriber) in drained.iter_mut() {
            subscriber.on_complete();
        }
    }
}

/// A stream published through a single shared upstream subscription.
///
/// Inner consumers obtained from [`stream`](Connectable::stream) receive
/// nothing until [`connect`](Connectable::connect) establishes the upstream
/// subscription; from that moment every consumer sees the same sequence.
/// Disposing the connection releases the upstream subscription exactly once.
///
/// # Examples
///
/// ```
/// use deltaflow::Stream;
/// use std::sync::{Arc, Mutex};
///
/// let published = Stream::from_values(vec![1, 2]).publish();
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
/// let _inner = published.stream().subscribe_next(move |v| sink.lock().unwrap().push(v));
///
/// // nothing yet: not connected
/// assert!(seen.lock().unwrap().is_empty());
///
/// let _connection = published.connect();
/// assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
/// ```
pub struct Connectable<T> {
    source: Stream<T>,
    hub: Arc<Mutex<Hub<T>>>,
}

impl<T> Clone for Connectable<T> {
    fn clone(&self) -> Self {
        Connectable { source: self.source.clone(), hub: Arc::clone(&self.hub) }
    }
}

impl<T: Clone + Send + 'static> Connectable<T> {
    /// The multiplexed stream. Subscribing registers an inner consumer; it
    /// receives emissions only while a connection is established.
    pub fn stream(&self) -> Stream<T> {
        let hub = Arc::clone(&self.hub);
        Stream::new(move |observer| {
            let id = {
                let mut locked = hub.lock();
                let id = locked.next_id;
                locked.next_id += 1;
                locked.subscribers.push((id, observer));
                id
            };
            let hub_handle = Arc::clone(&hub);
            Subscription::new(move || {
                hub_handle.lock().subscribers.retain(|(entry, _)| *entry != id);
            })
        })
    }

    /// Establishes the single upstream subscription.
    ///
    /// While a connection is already established, further calls return an
    /// inert subscription rather than subscribing the upstream again.
    pub fn connect(&self) -> Subscription {
        {
            let mut hub = self.hub.lock();
            if hub.connected {
                return Subscription::empty();
            }
            hub.connected = true;
        }
        let upstream = self.source.subscribe(HubObserver { hub: Arc::clone(&self.hub) });
        let hub_handle = Arc::clone(&self.hub);
        let mut connection = Subscription::new(move || {
            hub_handle.lock().connected = false;
        });
        connection.push(upstream);
        connection
    }

    /// Derives a stream that connects on the first subscriber and releases
    /// the connection when the last subscriber unsubscribes.
    pub fn ref_count(self) -> Stream<T> {
        struct RefCount {
            connection: Option<Subscription>,
            subscribers: usize,
        }
        let state = Arc::new(Mutex::new(RefCount { connection: None, subscribers: 0 }));
        Stream::new(move |observer| {
            // Register before connecting so the first subscriber observes any
            // synchronous emissions the connection produces.
            let mut inner = self.stream().subscribe(observer);
            let needs_connect = {
                let mut locked = state.lock();
                locked.subscribers += 1;
                locked.subscribers == 1
            };
            if needs_connect {
                let connection = self.connect();
                state.lock().connection = Some(connection);
            }
            let state_handle = Arc::clone(&state);
            let mut subscription = Subscription::new(move || {
                let dropped = {
                    let mut locked = state_handle.lock();
                    locked.subscribers -= 1;
                    if locked.subscribers == 0 { locked.connection.take() } else { None }
                };
                drop(dropped);
            });
            subscription.push(Subscription::new(move || inner.dispose()));
            subscription
        })
    }
}

impl<T: Clone + Send + 'static> Stream<T> {
    /// Publishes this stream behind a single shared upstream subscription.
    pub fn publish(&self) -> Connectable<T> {
        Connectable {
            source: self.clone(),
            hub: Arc::new(Mutex::new(Hub { subscribers: Vec::new(), next_id: 0, connected: false })),
        }
    }
}
