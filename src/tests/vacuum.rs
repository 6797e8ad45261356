use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use super::*;
use crate::guc::RumGucs;
use crate::opclass::INT8_EQUAL;
use crate::page::{Relation, ROOT_BLKNO};
use crate::tree::posting::posting_items;

const ROWS: u32 = 40_000;

fn posting_index(name: &str, gucs: RumGucs) -> RumIndex {
    let index = RumIndex::create_with_gucs(
        name,
        vec![IndexColumn::new("a", TypeInfo::Int(8), int8_ops())],
        &RumOptions::default(),
        gucs,
    )
    .unwrap();
    let rows: Vec<_> = (0..ROWS).map(|n| (nth_tid(n), 7)).collect();
    index.build(&ints(&rows)).unwrap();
    index
}

/// Data leaves of the only posting tree, left to right.
fn leaf_chain(rel: &Relation) -> Vec<u32> {
    let first = (ROOT_BLKNO + 1..rel.nblocks())
        .find(|&blkno| {
            let page = page_read(rel, blkno).unwrap();
            page.is_data() && page.is_leaf() && !page.is_deleted() && page.is_leftmost()
        })
        .unwrap();
    let mut chain = vec![first];
    loop {
        let next = page_read(rel, *chain.last().unwrap()).unwrap().opaque.rightlink;
        if next == INVALID_BLOCK_NUMBER {
            return chain;
        }
        chain.push(next);
    }
}

fn leaf_tids(index: &RumIndex, blkno: u32) -> BTreeSet<ItemPointer> {
    let layout = index.state().column(1).layout;
    let page = page_read(index.relation(), blkno).unwrap();
    read_leaf(&layout, &page).unwrap().iter().map(|item| item.iptr).collect()
}

fn survivors(dead: &BTreeSet<ItemPointer>) -> Vec<ItemPointer> {
    (0..ROWS).map(nth_tid).filter(|t| !dead.contains(t)).collect()
}

fn check_after_delete(index: &RumIndex, dead: &BTreeSet<ItemPointer>) {
    assert_eq!(
        scan_tids(index, vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(7))]),
        survivors(dead)
    );
    check_right_bounds(index, 1);
}

#[test]
fn test_empty_leaf_deleted_once_pin_goes_away() {
    let index = posting_index("vacuum_pinned_leaf", RumGucs::default());
    let chain = leaf_chain(index.relation());
    assert!(chain.len() > 3);
    let victim = chain[chain.len() / 2];
    let dead = leaf_tids(&index, victim);

    let barrier = Barrier::new(2);
    let stats = thread::scope(|s| {
        s.spawn(|| {
            let pin = index.relation().read_buffer(victim).unwrap();
            barrier.wait();
            thread::sleep(Duration::from_millis(30));
            drop(pin);
        });
        barrier.wait();
        index.bulk_delete(None, |t| dead.contains(&t)).unwrap()
    });

    assert_eq!(stats.tuples_removed as usize, dead.len());
    assert_eq!(stats.pages_deleted, 1);
    assert!(page_read(index.relation(), victim).unwrap().is_deleted());
    check_after_delete(&index, &dead);
}

#[test]
fn test_bounded_retries_give_up_on_pinned_leaf() {
    let index = posting_index("vacuum_bounded_retry", RumGucs::default());
    let chain = leaf_chain(index.relation());
    let victim = chain[chain.len() / 2];
    let dead = leaf_tids(&index, victim);

    let pin = index.relation().read_buffer(victim).unwrap();
    let stats = index.bulk_delete(None, |t| dead.contains(&t)).unwrap();
    assert_eq!(stats.tuples_removed as usize, dead.len());
    assert_eq!(stats.pages_deleted, 0);
    assert!(!page_read(index.relation(), victim).unwrap().is_deleted());
    drop(pin);

    // the leaf is still empty, so the next pass unlinks it
    let stats = index.bulk_delete(None, |t| dead.contains(&t)).unwrap();
    assert_eq!(stats.tuples_removed, 0);
    assert_eq!(stats.pages_deleted, 1);
    check_after_delete(&index, &dead);
}

#[test]
fn test_unbounded_retries_outlast_the_pin() {
    let gucs = RumGucs {
        skip_retry_on_delete_page: false,
        ..RumGucs::default()
    };
    let index = posting_index("vacuum_unbounded_retry", gucs);
    let chain = leaf_chain(index.relation());
    let victim = chain[chain.len() / 2];
    let dead = leaf_tids(&index, victim);

    // held well past what ten bounded retries would wait
    let barrier = Barrier::new(2);
    let stats = thread::scope(|s| {
        s.spawn(|| {
            let pin = index.relation().read_buffer(victim).unwrap();
            barrier.wait();
            thread::sleep(Duration::from_millis(800));
            drop(pin);
        });
        barrier.wait();
        index.bulk_delete(None, |t| dead.contains(&t)).unwrap()
    });

    assert_eq!(stats.pages_deleted, 1);
    assert!(page_read(index.relation(), victim).unwrap().is_deleted());
    check_after_delete(&index, &dead);
}

#[test]
fn test_leaf_behind_last_downlink_is_deleted() {
    let gucs = RumGucs {
        data_page_intermediate_split_size: 3,
        ..RumGucs::default()
    };
    let index = posting_index("vacuum_last_downlink", gucs);
    let rel = index.relation();
    let layout = index.state().column(1).layout;

    // an internal page over leaves whose last child is not the rightmost leaf
    let (parent, victim) = (ROOT_BLKNO + 1..rel.nblocks())
        .find_map(|blkno| {
            let page = page_read(rel, blkno).unwrap();
            if !page.is_data() || page.is_leaf() || page.is_deleted() || page.is_rightmost() {
                return None;
            }
            let items = posting_items(&page);
            let last = items.last()?.child();
            let child = page_read(rel, last).unwrap();
            (items.len() >= 2 && child.is_leaf() && !child.is_rightmost()).then_some((blkno, last))
        })
        .unwrap();
    let left = page_read(rel, victim).unwrap().opaque.leftlink;
    let bound = right_bound(&page_read(rel, victim).unwrap());
    let downlinks = posting_items(&page_read(rel, parent).unwrap()).len();
    let dead = leaf_tids(&index, victim);

    let stats = index.bulk_delete(None, |t| dead.contains(&t)).unwrap();
    assert_eq!(stats.pages_deleted, 1);
    assert!(page_read(rel, victim).unwrap().is_deleted());

    let parent_page = page_read(rel, parent).unwrap();
    let items = posting_items(&parent_page);
    assert_eq!(items.len(), downlinks - 1);
    let last = items.last().unwrap();
    assert_eq!(last.child(), left);
    assert_eq!(layout.compare(&last.item(), &bound), std::cmp::Ordering::Equal);
    drop(parent_page);
    let left_bound = right_bound(&page_read(rel, left).unwrap());
    assert_eq!(layout.compare(&left_bound, &bound), std::cmp::Ordering::Equal);
    check_after_delete(&index, &dead);

    // the rows come back through the widened left sibling
    for &t in &dead {
        index.insert(&[Some(Datum::Int(7))], t).unwrap();
    }
    assert_eq!(
        scan_tids(&index, vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(7))]),
        (0..ROWS).map(nth_tid).collect::<Vec<_>>()
    );
    check_right_bounds(&index, 1);
}
