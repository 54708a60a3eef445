//! Running extremum over a keyed stream.
//!
//! The operator folds every change set into a running maximum or minimum of
//! the selected values. Adds compete with the current extremum directly;
//! removing the extremum forces a rescan of the maintained collection mirror
//! (updates count as a removal followed by an addition; refreshes and moves
//! do not participate). Consecutive duplicate emissions are suppressed, so
//! downstream observers only hear the extremum when it actually changes.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::Cache;
use crate::change::Change;
use crate::changeset::ChangeSet;
use crate::error::Error;
use crate::operators::OperatorOutput;
use crate::stream::{Observer, Stream, Subscription};
use crate::{Data, Key};

#[derive(Clone, Copy)]
enum Extreme {
    Max,
    Min,
}

impl Extreme {
    fn prefers<R: Ord>(self, challenger: &R, incumbent: &R) -> bool {
        match self {
            Extreme::Max => challenger > incumbent,
            Extreme::Min => challenger < incumbent,
        }
    }
}

struct ExtremumState<K, V, R> {
    mirror: Cache<K, V>,
    current: Option<R>,
    last_emitted: Option<R>,
    out: OperatorOutput<R>,
    stopped: bool,
}

struct ExtremumObserver<K, V, R> {
    state: Arc<Mutex<ExtremumState<K, V, R>>>,
    selector: Arc<dyn Fn(&V) -> R + Send + Sync>,
    empty_value: R,
    mode: Extreme,
}

impl<K: Key, V: Data, R: Ord + Data> Observer<ChangeSet<K, V>> for ExtremumObserver<K, V, R> {
    fn on_next(&mut self, changes: ChangeSet<K, V>) {
        let mut state = self.state.lock();
        let state = &mut *state;
        if state.stopped {
            return;
        }
        if let Err(error) = state.mirror.apply(&changes) {
            state.stopped = true;
            state.mirror.clear();
            state.out.error(error);
            return;
        }

        let mut needs_reset = false;
        for change in changes.iter() {
            match change {
                Change::Add { current, .. } => {
                    let value = (self.selector)(current);
                    consider(&mut state.current, value, self.mode);
                }
                Change::Update { current, previous, .. } => {
                    if state.current.as_ref() == Some(&(self.selector)(previous)) {
                        needs_reset = true;
                        break;
                    }
                    let value = (self.selector)(current);
                    consider(&mut state.current, value, self.mode);
                }
                Change::Remove { previous, .. } => {
                    if state.current.as_ref() == Some(&(self.selector)(previous)) {
                        needs_reset = true;
                        break;
                    }
                }
                Change::Refresh { .. } | Change::Moved { .. } => {}
            }
        }

        if needs_reset {
            // The extremum left the collection; rescan what remains.
            let values = state.mirror.values().map(|value| (self.selector)(value));
            state.current = match self.mode {
                Extreme::Max => values.max(),
                Extreme::Min => values.min(),
            };
        }

        let value = state.current.clone().unwrap_or_else(|| self.empty_value.clone());
        if state.last_emitted.as_ref() != Some(&value) {
            state.last_emitted = Some(value.clone());
            state.out.next(value);
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

fn consider<R: Ord>(current: &mut Option<R>, challenger: R, mode: Extreme) {
    match current {
        None => *current = Some(challenger),
        Some(incumbent) => {
            if mode.prefers(&challenger, incumbent) {
                *current = Some(challenger);
            }
        }
    }
}

fn extremum<K: Key, V: Data, R: Ord + Data>(
    source: &Stream<ChangeSet<K, V>>,
    selector: Arc<dyn Fn(&V) -> R + Send + Sync>,
    empty_value: R,
    mode: Extreme,
) -> Stream<R> {
    let source = source.clone();
    Stream::new(move |observer| {
        let out = OperatorOutput::new(observer);
        let state = Arc::new(Mutex::new(ExtremumState {
            mirror: Cache::new(),
            current: None,
            last_emitted: None,
            out: out.clone(),
            stopped: false,
        }));
        let upstream = source.subscribe(ExtremumObserver {
            state: Arc::clone(&state),
            selector: Arc::clone(&selector),
            empty_value: empty_value.clone(),
            mode,
        });
        let mut subscription = Subscription::bundle([upstream]);
        subscription.push(out.disarm_subscription());
        subscription
    })
}

/// Running aggregates over keyed change-set streams.
pub trait Aggregate<K: Key, V: Data> {
    /// The running maximum of the selected values, or `empty_value` while the
    /// collection is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use deltaflow::operators::Aggregate;
    /// use deltaflow::SourceCache;
    /// use std::sync::{Arc, Mutex};
    ///
    /// let source = SourceCache::new();
    /// let seen = Arc::new(Mutex::new(Vec::new()));
    /// let sink = Arc::clone(&seen);
    /// let _sub = source
    ///     .connect()
    ///     .maximum(|value: &i32| *value, 0)
    ///     .subscribe_next(move |max| sink.lock().unwrap().push(max));
    ///
    /// source.edit(|cache| cache.add_or_update(1, 3));
    /// source.edit(|cache| cache.add_or_update(2, 7));
    /// source.edit(|cache| cache.add_or_update(3, 5)); // no emission: max unchanged
    /// source.edit(|cache| cache.remove(&2));
    /// assert_eq!(*seen.lock().unwrap(), vec![3, 7, 5]);
    /// ```
    fn maximum<R: Ord + Data>(
        &self,
        selector: impl Fn(&V) -> R + Send + Sync + 'static,
        empty_value: R,
    ) -> Stream<R>;

    /// The running minimum of the selected values, or `empty_value` while the
    /// collection is empty.
    fn minimum<R: Ord + Data>(
        &self,
        selector: impl Fn(&V) -> R + Send + Sync + 'static,
        empty_value: R,
    ) -> Stream<R>;
}

impl<K: Key, V: Data> Aggregate<K, V> for Stream<ChangeSet<K, V>> {
    fn maximum<R: Ord + Data>(
        &self,
        selector: impl Fn(&V) -> R + Send + Sync + 'static,
        empty_value: R,
    ) -> Stream<R> {
        extremum(self, Arc::new(selector), empty_value, Extreme::Max)
    }

    fn minimum<R: Ord + Data>(
        &self,
        selector: impl Fn(&V) -> R + Send + Sync + 'static,
        empty_value: R,
    ) -> Stream<R> {
        extremum(self, Arc::new(selector), empty_value, Extreme::Min)
    }
}
