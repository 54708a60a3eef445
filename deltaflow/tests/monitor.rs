use std::sync::Arc;

use parking_lot::Mutex;

use deltaflow::operators::{ConnectionStatus, Monitor};
use deltaflow::{CallbackObserver, Error, SourceCache, Stream, Subscription};

use ConnectionStatus::*;

#[test]
fn value_then_error_walks_pending_loaded_errored() {
    // a stream that emits one value and then fails
    let stream: Stream<i32> = Stream::new(|mut observer| {
        observer.on_next(1);
        observer.on_error(Error::source_failure("wire dropped"));
        Subscription::empty()
    });

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let status_sink = Arc::clone(&statuses);
    let error_sink = Arc::clone(&errors);

    let observer = CallbackObserver::next(move |status| status_sink.lock().push(status))
        .with_error(move |error: Error| error_sink.lock().push(error.to_string()));
    let _sub = stream.monitor_status().subscribe(observer);

    assert_eq!(*statuses.lock(), vec![Pending, Loaded, Errored]);
    // the status comes first, then the error itself propagates
    assert_eq!(errors.lock().len(), 1);
    assert!(errors.lock()[0].contains("wire dropped"));
}

#[test]
fn completion_walks_pending_loaded_completed() {
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let _sub = Stream::from_values(vec![1, 2, 3])
        .monitor_status()
        .subscribe_next(move |status| sink.lock().push(status));

    // repeated values collapse into one Loaded
    assert_eq!(*statuses.lock(), vec![Pending, Loaded, Completed]);
}

#[test]
fn empty_completion_skips_loaded() {
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let _sub = Stream::from_values(Vec::<i32>::new())
        .monitor_status()
        .subscribe_next(move |status| sink.lock().push(status));

    assert_eq!(*statuses.lock(), vec![Pending, Completed]);
}

#[test]
fn quiet_source_stays_pending() {
    let source: SourceCache<u32, i32> = SourceCache::new();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let _sub = source
        .connect()
        .monitor_status()
        .subscribe_next(move |status| sink.lock().push(status));

    assert_eq!(*statuses.lock(), vec![Pending]);

    source.edit(|cache| cache.add_or_update(1, 1));
    assert_eq!(*statuses.lock(), vec![Pending, Loaded]);

    // further values change nothing
    source.edit(|cache| cache.add_or_update(2, 2));
    assert_eq!(*statuses.lock(), vec![Pending, Loaded]);
}
