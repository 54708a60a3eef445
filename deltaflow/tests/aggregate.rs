use std::sync::Arc;

use parking_lot::Mutex;

use deltaflow::operators::{Aggregate, Count};
use deltaflow::SourceCache;

fn collect<T: Clone + Send + Sync + 'static>(
    stream: &deltaflow::Stream<T>,
) -> (Arc<Mutex<Vec<T>>>, deltaflow::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = stream.subscribe_next(move |value| sink.lock().push(value));
    (seen, subscription)
}

#[test]
fn maximum_follows_adds_and_removes() {
    let source: SourceCache<u32, i32> = SourceCache::new();
    let (seen, _sub) = collect(&source.connect().maximum(|value| *value, 0));

    source.edit(|cache| cache.add_or_update(1, 3));
    source.edit(|cache| cache.add_or_update(2, 7));
    source.edit(|cache| cache.add_or_update(3, 5)); // below the max: no emission
    assert_eq!(*seen.lock(), vec![3, 7]);

    // removing the max rescans the survivors
    source.edit(|cache| cache.remove(&2));
    assert_eq!(*seen.lock(), vec![3, 7, 5]);

    // emptying the collection falls back to the empty value
    source.edit(|cache| {
        cache.remove(&1);
        cache.remove(&3);
    });
    assert_eq!(*seen.lock(), vec![3, 7, 5, 0]);
}

#[test]
fn minimum_follows_updates() {
    let source: SourceCache<u32, i32> = SourceCache::new();
    let (seen, _sub) = collect(&source.connect().minimum(|value| *value, i32::MAX));

    source.edit(|cache| {
        cache.add_or_update(1, 5);
        cache.add_or_update(2, 9);
    });
    assert_eq!(*seen.lock(), vec![5]);

    // raising the current minimum forces a rescan
    source.edit(|cache| cache.add_or_update(1, 20));
    assert_eq!(*seen.lock(), vec![5, 9]);

    source.edit(|cache| cache.add_or_update(2, 2));
    assert_eq!(*seen.lock(), vec![5, 9, 2]);
}

#[test]
fn aggregates_never_repeat_consecutive_values() {
    let source: SourceCache<u32, i32> = SourceCache::new();
    let (seen, _sub) = collect(&source.connect().maximum(|value| *value, 0));

    source.edit(|cache| cache.add_or_update(1, 4));
    source.edit(|cache| cache.add_or_update(2, 4));
    source.edit(|cache| cache.add_or_update(3, 1));
    source.edit(|cache| cache.remove(&2)); // a 4 remains, so the max holds

    let seen = seen.lock();
    assert_eq!(*seen, vec![4]);
    for window in seen.windows(2) {
        assert_ne!(window[0], window[1]);
    }
}

#[test]
fn count_tracks_entries_not_updates() {
    let source: SourceCache<u32, &'static str> = SourceCache::new();
    let (seen, _sub) = collect(&source.connect().count());

    source.edit(|cache| {
        cache.add_or_update(1, "a");
        cache.add_or_update(2, "b");
    });
    assert_eq!(*seen.lock(), vec![2]);

    // updating a value leaves the count unchanged: no emission
    source.edit(|cache| cache.add_or_update(1, "A"));
    assert_eq!(*seen.lock(), vec![2]);

    source.edit(|cache| cache.remove(&2));
    assert_eq!(*seen.lock(), vec![2, 1]);
}

#[test]
fn refreshes_do_not_disturb_aggregates() {
    let source: SourceCache<u32, i32> = SourceCache::new();
    let (seen, _sub) = collect(&source.connect().maximum(|value| *value, 0));

    source.edit(|cache| cache.add_or_update(1, 6));
    source.edit(|cache| cache.refresh(&1));
    assert_eq!(*seen.lock(), vec![6]);
}
