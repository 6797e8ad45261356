use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::*;
use crate::opclass::{INT8_EQUAL, TEXT_AND};

/// Rows come back in item pointer order without repeats.
fn assert_strictly_sorted(found: &[ItemPointer]) {
    for pair in found.windows(2) {
        assert!(pair[0] < pair[1], "{} returned before {}", pair[0], pair[1]);
    }
}

#[test]
fn test_scan_during_insert() {
    let seed = rand::rng().random_range(0..u64::MAX);
    let mut rng = StdRng::seed_from_u64(seed);
    println!("Seed: {}", seed);

    let index = text_index("concurrent_insert");
    index.build_empty().unwrap();
    let mut order: Vec<u32> = (0..10_000).collect();
    order.shuffle(&mut rng);
    let universe: BTreeSet<ItemPointer> = order.iter().map(|&n| nth_tid(n)).collect();

    let committed = AtomicUsize::new(0);
    let done = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            for &n in &order {
                index.insert(&[Some(Datum::text("a"))], nth_tid(n)).unwrap();
                committed.fetch_add(1, Ordering::AcqRel);
            }
            done.store(true, Ordering::Release);
        });

        let mut scans = 0;
        while !done.load(Ordering::Acquire) || scans == 0 {
            let before = committed.load(Ordering::Acquire);
            let found = scan_tids(&index, vec![ScanKeyData::new(1, TEXT_AND, Datum::text("a"))]);
            assert_strictly_sorted(&found);
            assert!(found.iter().all(|t| universe.contains(t)));
            let found: BTreeSet<_> = found.into_iter().collect();
            for &n in &order[..before] {
                assert!(found.contains(&nth_tid(n)), "row {} inserted before the scan is missing", n);
            }
            scans += 1;
        }
        println!("{} scans ran during the inserts", scans);
    });

    let found = scan_tids(&index, vec![ScanKeyData::new(1, TEXT_AND, Datum::text("a"))]);
    assert_eq!(found, universe.into_iter().collect::<Vec<_>>());
    index.vacuum_cleanup(None).unwrap();
    check_meta_counts(&index);
    check_right_bounds(&index, 1);
}

#[test]
fn test_scan_during_vacuum() {
    let index = int8_index("concurrent_vacuum");
    let rows: Vec<_> = (0..40_000).map(|n| (nth_tid(n), 3)).collect();
    index.build(&ints(&rows)).unwrap();
    // rows 5000..25000 go away together so whole leaves empty out
    let dead = |t: ItemPointer| (50..250).contains(&t.block) || t.offset % 2 == 0;
    let survivors: Vec<ItemPointer> = rows.iter().map(|&(t, _)| t).filter(|&t| !dead(t)).collect();

    let done = AtomicBool::new(false);
    let deleted = thread::scope(|s| {
        let vacuum = s.spawn(|| {
            let stats = index.bulk_delete(None, dead).unwrap();
            done.store(true, Ordering::Release);
            stats
        });

        let mut scans = 0;
        while !done.load(Ordering::Acquire) || scans == 0 {
            let found = scan_tids(&index, vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(3))]);
            assert_strictly_sorted(&found);
            let found: BTreeSet<_> = found.into_iter().collect();
            assert!(found.len() <= rows.len());
            for t in &survivors {
                assert!(found.contains(t), "surviving row {} is missing", t);
            }
            scans += 1;
        }
        vacuum.join().unwrap()
    });

    assert_eq!(deleted.tuples_removed as usize, rows.len() - survivors.len());
    let stats = index.vacuum_cleanup(Some(deleted)).unwrap();
    assert!(stats.pages_free >= deleted.pages_deleted);
    assert_eq!(
        scan_tids(&index, vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(3))]),
        survivors
    );
    check_meta_counts(&index);
    check_right_bounds(&index, 1);
}
