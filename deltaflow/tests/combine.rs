use std::sync::Arc;

use parking_lot::Mutex;

use deltaflow::operators::{combine, CombineOperator};
use deltaflow::{ChangeSet, ObservableCache, SourceCache, SourceList, Stream};

fn cache_of(keys: &[i32]) -> SourceCache<i32, i32> {
    let source = SourceCache::new();
    source.edit(|cache| {
        for &key in keys {
            cache.add_or_update(key, key);
        }
    });
    source
}

fn sorted_keys(view: &ObservableCache<i32, i32>) -> Vec<i32> {
    let mut keys = view.keys();
    keys.sort_unstable();
    keys
}

#[test]
fn and_tracks_dynamic_sources() {
    let a = cache_of(&[1, 2, 3]);
    let b = cache_of(&[2, 3, 4]);
    let c = cache_of(&[3, 4]);

    let sources: SourceList<Stream<ChangeSet<i32, i32>>> = SourceList::new();
    sources.edit(|list| {
        list.push(a.connect());
        list.push(b.connect());
    });

    let view = ObservableCache::new(&combine(CombineOperator::And, &sources.connect()));
    assert_eq!(sorted_keys(&view), vec![2, 3]);

    // a third source evicts keys it does not carry
    sources.edit(|list| list.push(c.connect()));
    assert_eq!(sorted_keys(&view), vec![3]);

    // removing it readmits them
    sources.edit(|list| {
        list.remove_at(2);
    });
    assert_eq!(sorted_keys(&view), vec![2, 3]);
}

#[test]
fn and_reacts_to_source_edits() {
    let a = cache_of(&[1, 2]);
    let b = cache_of(&[2]);

    let sources: SourceList<Stream<ChangeSet<i32, i32>>> = SourceList::new();
    sources.edit(|list| {
        list.push(a.connect());
        list.push(b.connect());
    });

    let view = ObservableCache::new(&combine(CombineOperator::And, &sources.connect()));
    assert_eq!(sorted_keys(&view), vec![2]);

    b.edit(|cache| cache.add_or_update(1, 1));
    assert_eq!(sorted_keys(&view), vec![1, 2]);

    a.edit(|cache| cache.remove(&2));
    assert_eq!(sorted_keys(&view), vec![1]);
}

#[test]
fn or_unions_sources() {
    let a = cache_of(&[1, 2]);
    let b = cache_of(&[2, 3]);

    let sources: SourceList<Stream<ChangeSet<i32, i32>>> = SourceList::new();
    sources.edit(|list| {
        list.push(a.connect());
        list.push(b.connect());
    });

    let view = ObservableCache::new(&combine(CombineOperator::Or, &sources.connect()));
    assert_eq!(sorted_keys(&view), vec![1, 2, 3]);

    // present in both: removing from one source keeps the key
    a.edit(|cache| cache.remove(&2));
    assert_eq!(sorted_keys(&view), vec![1, 2, 3]);

    b.edit(|cache| cache.remove(&2));
    assert_eq!(sorted_keys(&view), vec![1, 3]);
}

#[test]
fn xor_keeps_keys_in_exactly_one_source() {
    let a = cache_of(&[1, 2]);
    let b = cache_of(&[2, 3]);

    let sources: SourceList<Stream<ChangeSet<i32, i32>>> = SourceList::new();
    sources.edit(|list| {
        list.push(a.connect());
        list.push(b.connect());
    });

    let view = ObservableCache::new(&combine(CombineOperator::Xor, &sources.connect()));
    assert_eq!(sorted_keys(&view), vec![1, 3]);

    // key 2 becomes exclusive to b
    a.edit(|cache| cache.remove(&2));
    assert_eq!(sorted_keys(&view), vec![1, 2, 3]);
}

#[test]
fn except_subtracts_later_sources_from_the_first() {
    let a = cache_of(&[1, 2, 3]);
    let b = cache_of(&[2]);

    let sources: SourceList<Stream<ChangeSet<i32, i32>>> = SourceList::new();
    sources.edit(|list| {
        list.push(a.connect());
        list.push(b.connect());
    });

    let view = ObservableCache::new(&combine(CombineOperator::Except, &sources.connect()));
    assert_eq!(sorted_keys(&view), vec![1, 3]);

    b.edit(|cache| cache.add_or_update(3, 3));
    assert_eq!(sorted_keys(&view), vec![1]);

    b.edit(|cache| cache.remove(&2));
    assert_eq!(sorted_keys(&view), vec![1, 2]);
}

#[test]
fn except_follows_reordering() {
    let a = cache_of(&[1, 2]);
    let b = cache_of(&[2, 3]);

    let sources: SourceList<Stream<ChangeSet<i32, i32>>> = SourceList::new();
    sources.edit(|list| {
        list.push(a.connect());
        list.push(b.connect());
    });

    let view = ObservableCache::new(&combine(CombineOperator::Except, &sources.connect()));
    assert_eq!(sorted_keys(&view), vec![1]);

    // b becomes the first source, so the result is b \ a
    sources.edit(|list| list.move_item(1, 0));
    assert_eq!(sorted_keys(&view), vec![3]);
}

#[test]
fn equal_values_do_not_emit_updates() {
    let a = cache_of(&[1]);
    let b: SourceCache<i32, i32> = SourceCache::new();

    let sources: SourceList<Stream<ChangeSet<i32, i32>>> = SourceList::new();
    sources.edit(|list| {
        list.push(a.connect());
        list.push(b.connect());
    });

    let emissions: Arc<Mutex<Vec<ChangeSet<i32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&emissions);
    let _sub = combine(CombineOperator::Or, &sources.connect())
        .subscribe_next(move |changes| sink.lock().push(changes));
    assert_eq!(emissions.lock().len(), 1);

    // the same key/value arriving from another source changes nothing
    b.edit(|cache| cache.add_or_update(1, 1));
    assert_eq!(emissions.lock().len(), 1);

    // a genuinely different value does
    b.edit(|cache| cache.add_or_update(1, 10));
    let seen = emissions.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].updates(), 1);
}

#[test]
fn refreshes_propagate_for_result_keys() {
    let a = cache_of(&[1, 2]);

    let sources: SourceList<Stream<ChangeSet<i32, i32>>> = SourceList::new();
    sources.edit(|list| list.push(a.connect()));

    let emissions: Arc<Mutex<Vec<ChangeSet<i32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&emissions);
    let _sub = combine(CombineOperator::Or, &sources.connect())
        .subscribe_next(move |changes| sink.lock().push(changes));

    a.edit(|cache| cache.refresh(&1));
    let seen = emissions.lock();
    assert_eq!(seen.last().unwrap().refreshes(), 1);
    assert_eq!(seen.last().unwrap().total_changes(), 1);
}

#[test]
fn fixed_source_helpers_combine_without_a_source_list() {
    let a = cache_of(&[1, 2]);
    let b = cache_of(&[2, 3]);

    let view = ObservableCache::new(&deltaflow::operators::xor(vec![a.connect(), b.connect()]));
    assert_eq!(sorted_keys(&view), vec![1, 3]);

    // the fixed set still reacts to source edits
    b.edit(|cache| cache.remove(&3));
    assert_eq!(sorted_keys(&view), vec![1]);
}

#[test]
fn no_emission_is_empty() {
    let a = cache_of(&[1, 2, 3]);
    let b = cache_of(&[3]);

    let sources: SourceList<Stream<ChangeSet<i32, i32>>> = SourceList::new();
    sources.edit(|list| {
        list.push(a.connect());
        list.push(b.connect());
    });

    let emissions: Arc<Mutex<Vec<ChangeSet<i32, i32>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&emissions);
    let _sub = combine(CombineOperator::And, &sources.connect())
        .subscribe_next(move |changes| sink.lock().push(changes));

    // edits that cannot affect the intersection produce no change sets
    a.edit(|cache| cache.add_or_update(9, 9));
    for changes in emissions.lock().iter() {
        assert!(changes.total_changes() >= 1);
    }
}
