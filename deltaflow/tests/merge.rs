use std::sync::Arc;

use parking_lot::Mutex;

use deltaflow::operators::{MergeMany, MergeManyLists};
use deltaflow::{ListChange, ListChangeSet, ObservableCache, ObservableList, SourceCache, SourceList};

#[test]
fn merged_lists_union_their_children() {
    let a: SourceList<i32> = SourceList::new();
    let b: SourceList<i32> = SourceList::new();
    let c: SourceList<i32> = SourceList::new();

    let parents: SourceList<SourceList<i32>> = SourceList::new();
    parents.edit(|list| {
        list.push(a.clone());
        list.push(b.clone());
        list.push(c.clone());
    });

    let merged = parents.connect().merge_many(|child| child.connect());
    let view = ObservableList::new(&merged);

    a.edit(|list| {
        list.push(1);
        list.push(2);
    });
    b.edit(|list| {
        list.push(3);
        list.push(5);
    });

    assert_eq!(view.items(), vec![1, 2, 3, 5]);
    assert_eq!(view.len(), 4);

    // clearing a child withdraws its segment only
    b.clear();
    assert_eq!(view.items(), vec![1, 2]);
    assert_eq!(view.len(), 2);
}

#[test]
fn removing_a_child_withdraws_its_contribution() {
    let a: SourceList<i32> = SourceList::new();
    let b: SourceList<i32> = SourceList::new();
    a.edit(|list| list.append(vec![1, 2]));
    b.edit(|list| list.append(vec![10, 20]));

    let parents: SourceList<SourceList<i32>> = SourceList::new();
    parents.edit(|list| {
        list.push(a.clone());
        list.push(b.clone());
    });

    let merged = parents.connect().merge_many(|child| child.connect());
    let view = ObservableList::new(&merged);
    assert_eq!(view.items(), vec![1, 2, 10, 20]);

    parents.edit(|list| {
        list.remove_at(0);
    });
    assert_eq!(view.items(), vec![10, 20]);

    // the removed child keeps mutating, but nothing reaches the merged view
    a.edit(|list| list.push(3));
    assert_eq!(view.items(), vec![10, 20]);
}

#[test]
fn children_joining_later_land_after_existing_segments() {
    let a: SourceList<i32> = SourceList::new();
    let b: SourceList<i32> = SourceList::new();
    a.edit(|list| list.append(vec![1, 2]));
    b.edit(|list| list.append(vec![7]));

    let parents: SourceList<SourceList<i32>> = SourceList::new();
    parents.edit(|list| list.push(a.clone()));

    let merged = parents.connect().merge_many(|child| child.connect());
    let view = ObservableList::new(&merged);
    assert_eq!(view.items(), vec![1, 2]);

    // inserted before a: its segment comes first
    parents.edit(|list| list.insert(0, b.clone()));
    assert_eq!(view.items(), vec![7, 1, 2]);

    b.edit(|list| list.push(8));
    assert_eq!(view.items(), vec![7, 8, 1, 2]);
}

#[test]
fn child_edits_are_rebased_onto_merged_coordinates() {
    let a: SourceList<char> = SourceList::new();
    let b: SourceList<char> = SourceList::new();
    a.edit(|list| list.append(vec!['a', 'b']));
    b.edit(|list| list.append(vec!['x', 'y']));

    let parents: SourceList<SourceList<char>> = SourceList::new();
    parents.edit(|list| {
        list.push(a.clone());
        list.push(b.clone());
    });

    let merged = parents.connect().merge_many(|child| child.connect());
    let view = ObservableList::new(&merged);
    assert_eq!(view.items(), vec!['a', 'b', 'x', 'y']);

    b.edit(|list| {
        list.insert(1, 'z');
        list.replace(0, 'X');
        list.remove_at(2);
    });
    assert_eq!(view.items(), vec!['a', 'b', 'X', 'z']);

    b.edit(|list| list.move_item(1, 0));
    assert_eq!(view.items(), vec!['a', 'b', 'z', 'X']);
}

#[test]
fn child_moves_are_rebased_and_stay_inside_their_segment() {
    let a: SourceList<i32> = SourceList::new();
    let b: SourceList<i32> = SourceList::new();
    a.edit(|list| list.append(vec![1, 2]));
    b.edit(|list| list.append(vec![10, 20, 30]));

    let parents: SourceList<SourceList<i32>> = SourceList::new();
    parents.edit(|list| {
        list.push(a.clone());
        list.push(b.clone());
    });

    let merged = parents.connect().merge_many(|child| child.connect());
    let emissions: Arc<Mutex<Vec<ListChangeSet<i32>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&emissions);
    let _sub = merged.subscribe_next(move |changes| sink.lock().push(changes));

    // a move inside b is shifted by b's segment offset of two
    b.edit(|list| list.move_item(2, 0));
    {
        let seen = emissions.lock();
        let last = seen.last().unwrap();
        assert_eq!(last.total_changes(), 1);
        assert_eq!(
            last.iter().next().unwrap(),
            &ListChange::Moved { item: 30, current_index: 2, previous_index: 4 },
        );
    }

    // a move inside a leaves b's segment untouched
    a.edit(|list| list.move_item(0, 1));

    // replaying everything emitted reproduces the merged order
    let mut replica = Vec::new();
    for changes in emissions.lock().iter() {
        changes.apply_to(&mut replica).unwrap();
    }
    assert_eq!(replica, vec![2, 1, 30, 10, 20]);
}

#[test]
fn merged_caches_union_their_children() {
    let a: SourceCache<i32, &'static str> = SourceCache::new();
    let b: SourceCache<i32, &'static str> = SourceCache::new();
    a.edit(|cache| {
        cache.add_or_update(1, "a1");
        cache.add_or_update(2, "a2");
    });
    b.edit(|cache| cache.add_or_update(3, "b3"));

    let parents: SourceCache<u32, SourceCache<i32, &'static str>> = SourceCache::new();
    parents.edit(|cache| {
        cache.add_or_update(10, a.clone());
        cache.add_or_update(20, b.clone());
    });

    let merged = parents.connect().merge_many(|child| child.connect());
    let view = ObservableCache::new(&merged);

    let mut keys = view.keys();
    keys.sort_unstable();
    assert_eq!(keys, vec![1, 2, 3]);

    // removing a parent entry withdraws every key it contributed
    parents.edit(|cache| cache.remove(&10));
    let mut keys = view.keys();
    keys.sort_unstable();
    assert_eq!(keys, vec![3]);

    // and its later edits no longer reach the merged view
    a.edit(|cache| cache.add_or_update(4, "a4"));
    assert_eq!(view.len(), 1);
}

#[test]
fn withdrawing_a_shared_key_restores_the_other_contributor() {
    let a: SourceCache<i32, &'static str> = SourceCache::new();
    let b: SourceCache<i32, &'static str> = SourceCache::new();
    a.edit(|cache| cache.add_or_update(1, "from a"));
    b.edit(|cache| cache.add_or_update(1, "from b"));

    let parents: SourceCache<u32, SourceCache<i32, &'static str>> = SourceCache::new();
    parents.edit(|cache| cache.add_or_update(10, a.clone()));
    parents.edit(|cache| cache.add_or_update(20, b.clone()));

    let merged = parents.connect().merge_many(|child| child.connect());
    let view = ObservableCache::new(&merged);

    // the most recent writer wins
    assert_eq!(view.lookup(&1), Some("from b"));

    // withdrawing it restores the surviving contributor's value
    parents.edit(|cache| cache.remove(&20));
    assert_eq!(view.lookup(&1), Some("from a"));

    parents.edit(|cache| cache.remove(&10));
    assert_eq!(view.lookup(&1), None);
}

#[test]
fn child_removals_respect_other_contributors() {
    let a: SourceCache<i32, &'static str> = SourceCache::new();
    let b: SourceCache<i32, &'static str> = SourceCache::new();
    a.edit(|cache| cache.add_or_update(1, "from a"));
    b.edit(|cache| cache.add_or_update(1, "from b"));

    let parents: SourceCache<u32, SourceCache<i32, &'static str>> = SourceCache::new();
    parents.edit(|cache| {
        cache.add_or_update(10, a.clone());
        cache.add_or_update(20, b.clone());
    });

    let merged = parents.connect().merge_many(|child| child.connect());
    let view = ObservableCache::new(&merged);

    // b removes its entry; a's survives
    b.edit(|cache| cache.remove(&1));
    assert_eq!(view.lookup(&1), Some("from a"));

    a.edit(|cache| cache.remove(&1));
    assert_eq!(view.lookup(&1), None);
}
