use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};

use super::*;
use crate::opclass::{INT8_EQUAL, INT8_GREATER, INT8_GREATER_EQUAL, INT8_LESS, INT8_LESS_EQUAL};

#[derive(Debug, Clone, Copy)]
enum Operation {
    Insert,
    Select,
    Delete,
    Vacuum,
}

const INIT_ROWS: u32 = 5_000;
const KEY_RANGE: i64 = 40;
const FUZZ_ITERATIONS: u32 = 300;
const FUZZ_OPERATIONS: [Operation; 4] = [
    Operation::Insert,
    Operation::Select,
    Operation::Delete,
    Operation::Vacuum,
];

/// Skewed keys so that a few of them grow posting trees.
fn random_key(rng: &mut StdRng) -> i64 {
    if rng.random_bool(0.5) {
        rng.random_range(0..3)
    } else {
        rng.random_range(0..KEY_RANGE)
    }
}

fn matches(strategy: u16, value: i64, query: i64) -> bool {
    match strategy {
        INT8_LESS => value < query,
        INT8_LESS_EQUAL => value <= query,
        INT8_EQUAL => value == query,
        INT8_GREATER_EQUAL => value >= query,
        INT8_GREATER => value > query,
        _ => unreachable!(),
    }
}

#[test]
fn test_random_operations() {
    let seed = rand::rng().random_range(0..u64::MAX);
    let mut rng = StdRng::seed_from_u64(seed);
    println!("Seed: {}", seed); // for reproducibility

    let index = int8_index("fuzz");
    let mut model: BTreeMap<ItemPointer, i64> = BTreeMap::new();
    let mut next_row = 0u32;

    let initial: Vec<_> = (0..INIT_ROWS)
        .map(|n| (nth_tid(n), random_key(&mut rng)))
        .collect();
    index.build(&ints(&initial)).unwrap();
    model.extend(initial.iter().copied());
    next_row += INIT_ROWS;

    for _ in 0..FUZZ_ITERATIONS {
        let operation = *FUZZ_OPERATIONS.choose(&mut rng).unwrap();
        match operation {
            Operation::Insert => {
                for _ in 0..rng.random_range(1..200) {
                    let (t, key) = (nth_tid(next_row), random_key(&mut rng));
                    next_row += 1;
                    index.insert(&[Some(Datum::Int(key))], t).unwrap();
                    model.insert(t, key);
                }
            }
            Operation::Select => {
                let strategy = *[INT8_LESS, INT8_LESS_EQUAL, INT8_EQUAL, INT8_GREATER_EQUAL, INT8_GREATER]
                    .choose(&mut rng)
                    .unwrap();
                let query = rng.random_range(-1..=KEY_RANGE);
                let expected: Vec<ItemPointer> = model
                    .iter()
                    .filter(|(_, &v)| matches(strategy, v, query))
                    .map(|(&t, _)| t)
                    .collect();
                let key = || vec![ScanKeyData::new(1, strategy, Datum::Int(query))];
                assert_eq!(scan_tids(&index, key()), expected, "strategy {} query {}", strategy, query);
                let bitmap = bitmap_tids(&index, key());
                assert_eq!(bitmap, expected.into_iter().collect::<BTreeSet<_>>());
            }
            Operation::Delete => {
                let (lo, hi) = (rng.random_range(0..next_row), rng.random_range(0..next_row));
                let (lo, hi) = (nth_tid(lo.min(hi)), nth_tid(lo.max(hi)));
                let sparse = rng.random_bool(0.5);
                let dead = |t: ItemPointer| t >= lo && t <= hi && (!sparse || t.offset % 3 == 0);
                let expected = model.keys().filter(|&&t| dead(t)).count();
                let stats = index.bulk_delete(None, dead).unwrap();
                assert_eq!(stats.tuples_removed as usize, expected);
                model.retain(|&t, _| !dead(t));
            }
            Operation::Vacuum => {
                index.vacuum_cleanup(None).unwrap();
                check_meta_counts(&index);
                check_right_bounds(&index, 1);
            }
        }
    }

    let all = scan_tids(&index, vec![]);
    assert_eq!(all, model.keys().copied().collect::<Vec<_>>());
}
