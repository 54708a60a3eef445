//! Replay equivalence: applying every emitted change set, in order, to an
//! empty receiver must reproduce the state the operator holds at the end.

use std::sync::Arc;

use itertools::Itertools;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use deltaflow::operators::{combine, CombineOperator, Join};
use deltaflow::{Cache, ChangeSet, SourceCache, SourceList, Stream};

const KEY_SPACE: u32 = 8;

fn random_edit(rng: &mut StdRng, source: &SourceCache<u32, i32>) {
    let key = rng.gen_range(0..KEY_SPACE);
    match rng.gen_range(0..4) {
        0 | 1 => {
            let value = rng.gen_range(-100..100);
            source.edit(|cache| cache.add_or_update(key, value));
        }
        2 => source.edit(|cache| cache.remove(&key)),
        _ => source.edit(|cache| cache.refresh(&key)),
    }
}

fn collect<K: Clone + Eq + std::hash::Hash + Send + Sync + 'static, V: Clone + Send + Sync + 'static>(
    stream: &Stream<ChangeSet<K, V>>,
) -> (Arc<Mutex<Vec<ChangeSet<K, V>>>>, deltaflow::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = stream.subscribe_next(move |changes| sink.lock().push(changes));
    (seen, subscription)
}

#[test]
fn left_join_replay_matches_a_from_scratch_computation() {
    let mut rng = StdRng::seed_from_u64(0x0d15_ea5e);

    for _ in 0..20 {
        let left: SourceCache<u32, i32> = SourceCache::new();
        // right rows carry their join key as their first component, one row per key
        let right: SourceCache<u32, (u32, i32)> = SourceCache::new();

        let joined = left.connect().left_join(
            &right.connect(),
            |row: &(u32, i32)| row.0,
            |_, l, r| (*l, r.map(|row| row.1)),
        );
        let (emissions, _sub) = collect(&joined);

        for _ in 0..60 {
            if rng.gen_bool(0.5) {
                random_edit(&mut rng, &left);
            } else {
                let key = rng.gen_range(0..KEY_SPACE);
                if rng.gen_bool(0.7) {
                    let value = rng.gen_range(-100..100);
                    right.edit(|cache| cache.add_or_update(key, (key, value)));
                } else {
                    right.edit(|cache| cache.remove(&key));
                }
            }
        }

        // replay everything emitted into an empty receiver
        let mut replica: Cache<u32, (i32, Option<i32>)> = Cache::new();
        for changes in emissions.lock().iter() {
            assert!(changes.total_changes() >= 1, "operators must not emit empty change sets");
            replica.apply(changes).unwrap();
        }

        // and compare with computing the join from the final source states
        let expected: Vec<(u32, (i32, Option<i32>))> = left
            .items()
            .into_iter()
            .map(|(key, l)| (key, (l, right.lookup(&key).map(|row| row.1))))
            .sorted_by_key(|(key, _)| *key)
            .collect();
        let actual: Vec<(u32, (i32, Option<i32>))> = replica
            .iter()
            .map(|(key, value)| (*key, value.clone()))
            .sorted_by_key(|(key, _)| *key)
            .collect();
        assert_eq!(actual, expected);
    }
}

#[test]
fn combiner_replay_respects_the_membership_predicate() {
    let mut rng = StdRng::seed_from_u64(0xfeed_beef);

    for &operator in &[
        CombineOperator::And,
        CombineOperator::Or,
        CombineOperator::Xor,
        CombineOperator::Except,
    ] {
        let a: SourceCache<u32, i32> = SourceCache::new();
        let b: SourceCache<u32, i32> = SourceCache::new();

        let sources: SourceList<Stream<ChangeSet<u32, i32>>> = SourceList::new();
        sources.edit(|list| {
            list.push(a.connect());
            list.push(b.connect());
        });

        let (emissions, _sub) = collect(&combine(operator, &sources.connect()));

        for _ in 0..80 {
            let source = if rng.gen_bool(0.5) { &a } else { &b };
            random_edit(&mut rng, source);
        }

        let mut replica: Cache<u32, i32> = Cache::new();
        for changes in emissions.lock().iter() {
            assert!(changes.total_changes() >= 1);
            replica.apply(changes).unwrap();
        }

        for key in 0..KEY_SPACE {
            let in_a = a.lookup(&key).is_some();
            let in_b = b.lookup(&key).is_some();
            let expected = match operator {
                CombineOperator::And => in_a && in_b,
                CombineOperator::Or => in_a || in_b,
                CombineOperator::Xor => in_a != in_b,
                CombineOperator::Except => in_a && !in_b,
            };
            assert_eq!(
                replica.contains_key(&key),
                expected,
                "operator {operator:?}, key {key}",
            );
            // the materialized value always comes from a contributing source
            if let Some(value) = replica.lookup(&key) {
                assert!(a.lookup(&key).as_ref() == Some(value) || b.lookup(&key).as_ref() == Some(value));
            }
        }
    }
}
