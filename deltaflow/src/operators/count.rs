//! Running entry count of a keyed stream.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::Cache;
use crate::changeset::ChangeSet;
use crate::error::Error;
use crate::operators::OperatorOutput;
use crate::stream::{Observer, Stream, Subscription};
use crate::{Data, Key};

struct CountState<K, V> {
    mirror: Cache<K, V>,
    last_emitted: Option<usize>,
    out: OperatorOutput<usize>,
    stopped: bool,
}

struct CountObserver<K, V> {
    state: Arc<Mutex<CountState<K, V>>>,
}

impl<K: Key, V: Data> Observer<ChangeSet<K, V>> for CountObserver<K, V> {
    fn on_next(&mut self, changes: ChangeSet<K, V>) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        if let Err(error) = state.mirror.apply(&changes) {
            state.stopped = true;
            state.mirror.clear();
            state.out.error(error);
            return;
        }
        let count = state.mirror.len();
        if state.last_emitted != Some(count) {
            state.last_emitted = Some(count);
            state.out.next(count);
        }
    }

    fn on_error(&mut self, error: Error) {
        let mut state = self.state.lock();
        if !state.stopped {
            state.stopped = true;
            state.mirror.clear();
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

/// The running entry count of a keyed stream.
pub trait Count<K: Key, V: Data> {
    /// Emits the number of entries after each change set, suppressing
    /// consecutive duplicates.
    fn count(&self) -> Stream<usize>;
}

impl<K: Key, V: Data> Count<K, V> for Stream<ChangeSet<K, V>> {
    fn count(&self) -> Stream<usize> {
        let source = self.clone();
        Stream::new(move |observer| {
            let out = OperatorOutput::new(observer);
            let state = Arc::new(Mutex::new(CountState {
                mirror: Cache::new(),
                last_emitted: None,
                out: out.clone(),
                stopped: false,
            }));
            let upstream = source.subscribe(CountObserver { state: Arc::clone(&state) });
            let mut subscription = Subscription::bundle([upstream]);
            subscription.push(out.disarm_subscription());
            subscription
        })
    }
}
