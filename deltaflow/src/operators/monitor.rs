//! Surface the connection status of any stream.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::operators::OperatorOutput;
use crate::stream::{Observer, Stream, Subscription};

/// The lifecycle state of a monitored stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Subscribed, nothing received yet.
    Pending,
    /// At least one value has been received.
    Loaded,
    /// The stream terminated with an error.
    Errored,
    /// The stream completed normally.
    Completed,
}

struct MonitorState {
    status: ConnectionStatus,
    out: OperatorOutput<ConnectionStatus>,
}

struct MonitorObserver<T> {
    state: Arc<Mutex<MonitorState>>,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> Observer<T> for MonitorObserver<T> {
    fn on_next(&mut self, _value: T) {
        let mut state = self.state.lock();
        if state.status == ConnectionStatus::Pending {
            state.status = ConnectionStatus::Loaded;
            state.out.next(ConnectionStatus::Loaded);
        }
    }

    fn on_error(&mut self, error: Error) {
        let mut state = self.state.lock();
        if state.status != ConnectionStatus::Errored {
            state.status = ConnectionStatus::Errored;
            state.out.next(ConnectionStatus::Errored);
        }
        state.out.error(error);
    }

    fn on_complete(&mut self) {
        let mut state = self.state.lock();
        if state.status != ConnectionStatus::Errored {
            state.status = ConnectionStatus::Completed;
            state.out.next(ConnectionStatus::Completed);
            state.out.complete();
        }
    }
}

/// Status monitoring for any stream.
pub trait Monitor<T> {
    /// Emits the stream's [`ConnectionStatus`], starting with the current
    /// state on subscription and then on every transition; consecutive
    /// duplicates are suppressed. An upstream error is propagated after the
    /// `Errored` status is emitted.
    ///
    /// # Examples
    ///
    /// ```
    /// use deltaflow::operators::{ConnectionStatus, Monitor};
    /// use deltaflow::Stream;
    /// use std::sync::{Arc, Mutex};
    ///
    /// let seen = Arc::new(Mutex::new(Vec::new()));
    /// let sink = Arc::clone(&seen);
    /// let _sub = Stream::from_values(vec![1, 2, 3])
    ///     .monitor_status()
    ///     .subscribe_next(move |status| sink.lock().unwrap().push(status));
    ///
    /// use ConnectionStatus::*;
    /// assert_eq!(*seen.lock().unwrap(), vec![Pending, Loaded, Completed]);
    /// ```
    fn monitor_status(&self) -> Stream<ConnectionStatus>;
}

impl<T: Send + 'static> Monitor<T> for Stream<T> {
    fn monitor_status(&self) -> Stream<ConnectionStatus> {
        let source = self.clone();
        Stream::new(move |observer| {
            let out = OperatorOutput::new(observer);
            out.next(ConnectionStatus::Pending);
            let state = Arc::new(Mutex::new(MonitorState {
                status: ConnectionStatus::Pending,
                out: out.clone(),
            }));
            let upstream = source.subscribe(MonitorObserver {
                state: Arc::clone(&state),
                _marker: std::marker::PhantomData,
            });
            let mut subscription = Subscription::bundle([upstream]);
            subscription.push(out.disarm_subscription());
            subscription
        })
    }
}
