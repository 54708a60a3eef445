use std::sync::Arc;

use parking_lot::Mutex;

use deltaflow::{ChangeReason, ChangeSet, ObservableCache, SourceCache};

fn collect(
    source: &SourceCache<u32, String>,
) -> (Arc<Mutex<Vec<ChangeSet<u32, String>>>>, deltaflow::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = source.connect().subscribe_next(move |changes| sink.lock().push(changes));
    (seen, subscription)
}

#[test]
fn connect_delivers_the_current_state_first() {
    let source: SourceCache<u32, String> = SourceCache::new();
    source.edit(|cache| {
        cache.add_or_update(1, "a".into());
        cache.add_or_update(2, "b".into());
    });

    let (seen, _sub) = collect(&source);
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].adds(), 2);
    assert_eq!(seen[0].total_changes(), 2);
}

#[test]
fn edits_are_transactional() {
    let source: SourceCache<u32, String> = SourceCache::new();
    let (seen, _sub) = collect(&source);

    source.edit(|cache| {
        cache.add_or_update(1, "a".into());
        cache.add_or_update(1, "b".into());
        cache.remove(&1);
        cache.add_or_update(2, "c".into());
    });

    // one change set for the whole batch, in record order
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    let reasons: Vec<_> = seen[0].iter().map(|change| change.reason()).collect();
    use ChangeReason::*;
    assert_eq!(reasons, vec![Add, Update, Remove, Add]);
}

#[test]
fn empty_edits_publish_nothing() {
    let source: SourceCache<u32, String> = SourceCache::new();
    let (seen, _sub) = collect(&source);

    source.edit(|_cache| {});
    source.edit(|cache| cache.remove(&42)); // absent: records nothing
    source.edit(|cache| cache.refresh(&42)); // absent: records nothing

    assert!(seen.lock().is_empty());
}

#[test]
fn edit_diff_emits_the_minimal_difference() {
    let source: SourceCache<u32, String> = SourceCache::new();
    source.edit(|cache| {
        cache.add_or_update(1, "a".into());
        cache.add_or_update(2, "b".into());
    });

    let (seen, _sub) = collect(&source);

    source.edit_diff(
        vec![(1, "a".into()), (2, "B".into()), (3, "c".into())],
        |old, new| old == new,
    );

    let seen = seen.lock();
    // [0] is the connect snapshot; [1] is the diff
    assert_eq!(seen.len(), 2);
    let diff = &seen[1];
    assert_eq!(diff.removes(), 0);
    assert_eq!(diff.updates(), 1);
    assert_eq!(diff.adds(), 1);
    assert_eq!(diff.total_changes(), 2);

    let reasons: Vec<_> = diff.iter().map(|change| change.reason()).collect();
    assert_eq!(reasons, vec![ChangeReason::Update, ChangeReason::Add]);

    // the update carries the displaced value
    let update = diff.iter().find(|change| change.reason() == ChangeReason::Update).unwrap();
    assert_eq!(update.previous().map(String::as_str), Some("b"));
    assert_eq!(update.current().map(String::as_str), Some("B"));

    assert_eq!(source.lookup(&2).as_deref(), Some("B"));
    assert_eq!(source.len(), 3);
}

#[test]
fn edit_diff_removes_keys_missing_from_the_replacement() {
    let source: SourceCache<u32, String> = SourceCache::new();
    source.edit(|cache| {
        cache.add_or_update(1, "a".into());
        cache.add_or_update(2, "b".into());
    });
    let (seen, _sub) = collect(&source);

    source.edit_diff(vec![(2, "b".into())], |old, new| old == new);

    let seen = seen.lock();
    let diff = &seen[1];
    assert_eq!(diff.removes(), 1);
    assert_eq!(diff.total_changes(), 1);
    assert_eq!(source.len(), 1);
}

#[test]
fn edit_diff_with_equal_contents_publishes_nothing() {
    let source: SourceCache<u32, String> = SourceCache::new();
    source.edit(|cache| cache.add_or_update(1, "a".into()));
    let (seen, _sub) = collect(&source);

    source.edit_diff(vec![(1, "a".into())], |old, new| old == new);
    assert_eq!(seen.lock().len(), 1); // only the connect snapshot
}

#[test]
fn counters_always_match_the_sequence() {
    let source: SourceCache<u32, String> = SourceCache::new();
    let (seen, _sub) = collect(&source);

    source.edit(|cache| {
        cache.add_or_update(1, "a".into());
        cache.add_or_update(2, "b".into());
        cache.add_or_update(1, "c".into());
        cache.refresh(&2);
        cache.remove(&2);
    });

    for changes in seen.lock().iter() {
        use ChangeReason::*;
        let count = |reason: ChangeReason| {
            changes.iter().filter(|change| change.reason() == reason).count()
        };
        assert_eq!(changes.adds(), count(Add));
        assert_eq!(changes.updates(), count(Update));
        assert_eq!(changes.removes(), count(Remove));
        assert_eq!(changes.refreshes(), count(Refresh));
        assert_eq!(changes.moves(), count(Moved));
        assert_eq!(changes.total_changes(), changes.iter().count());
    }
}

#[test]
fn a_materialized_view_mirrors_the_source() {
    let source: SourceCache<u32, String> = SourceCache::new();
    let view = ObservableCache::new(&source.connect());

    source.edit(|cache| {
        cache.add_or_update(1, "a".into());
        cache.add_or_update(2, "b".into());
    });
    source.edit(|cache| {
        cache.remove(&1);
        cache.add_or_update(3, "c".into());
    });

    assert_eq!(view.items(), source.items());
    assert!(view.error().is_none());
}
