//! Scenario, property and randomized tests running the index against the
//! in-memory relation.

mod codec;
mod concurrent;
mod fuzz;
mod inspect;
mod scan;
mod scenario;
mod vacuum;

use std::collections::BTreeSet;

use crate::datatype::{Datum, TypeInfo};
use crate::error::RumResult;
use crate::index::{HeapTuple, IndexColumn, RumIndex, RumOptions, ScanKeyData, ScanResult};
use crate::opclass::{int8_ops, text_ops};
use crate::page::{page_read, INVALID_BLOCK_NUMBER, METAPAGE_BLKNO};
use crate::tree::posting::{read_leaf, right_bound};
use crate::tree::{ItemPointer, ScanDirection};

pub fn tid(block: u32, offset: u16) -> ItemPointer {
    ItemPointer::new(block, offset)
}

/// Item pointer of the `n`-th heap row, 100 rows per block.
pub fn nth_tid(n: u32) -> ItemPointer {
    ItemPointer::new(n / 100, (n % 100) as u16 + 1)
}

pub fn int8_index(name: &str) -> RumIndex {
    RumIndex::create(
        name,
        vec![IndexColumn::new("a", TypeInfo::Int(8), int8_ops())],
        &RumOptions::default(),
    )
    .unwrap()
}

pub fn text_index(name: &str) -> RumIndex {
    RumIndex::create(
        name,
        vec![IndexColumn::new("body", TypeInfo::Varlena, text_ops())],
        &RumOptions::default(),
    )
    .unwrap()
}

/// `(docid bigint, score bigint)` with the score attached to the docid
/// postings.
pub fn attached_index(name: &str, order_by_attach: bool) -> RumIndex {
    RumIndex::create(
        name,
        vec![
            IndexColumn::new("docid", TypeInfo::Int(8), int8_ops()),
            IndexColumn::new("score", TypeInfo::Int(8), int8_ops()),
        ],
        &RumOptions::attach("score", "docid", order_by_attach),
    )
    .unwrap()
}

pub fn ints(values: &[(ItemPointer, i64)]) -> Vec<HeapTuple> {
    values
        .iter()
        .map(|&(tid, v)| HeapTuple::new(tid, vec![Some(Datum::Int(v))]))
        .collect()
}

/// Every row a tuple scan returns.
pub fn scan_all(
    index: &RumIndex,
    keys: Vec<ScanKeyData>,
    orderbys: Vec<ScanKeyData>,
) -> RumResult<Vec<ScanResult>> {
    let mut scan = index.begin_scan(keys, orderbys);
    let mut out = Vec::new();
    while let Some(row) = scan.get_tuple(ScanDirection::Forward)? {
        out.push(row);
    }
    scan.end_scan();
    Ok(out)
}

pub fn scan_tids(index: &RumIndex, keys: Vec<ScanKeyData>) -> Vec<ItemPointer> {
    scan_all(index, keys, Vec::new())
        .unwrap()
        .into_iter()
        .map(|row| row.tid)
        .collect()
}

pub fn bitmap_tids(index: &RumIndex, keys: Vec<ScanKeyData>) -> BTreeSet<ItemPointer> {
    let mut bitmap = Default::default();
    index.begin_scan(keys, Vec::new()).get_bitmap(&mut bitmap).unwrap();
    bitmap.into_keys().collect()
}

/// Every live data leaf keeps its items at or below its right bound and
/// below the first item of its right sibling.
pub fn check_right_bounds(index: &RumIndex, attnum: u16) {
    let rel = index.relation();
    let layout = index.state().column(attnum).layout;
    for blkno in (METAPAGE_BLKNO + 1)..rel.nblocks() {
        let page = page_read(rel, blkno).unwrap();
        if page.is_new() || !page.is_data() || !page.is_leaf() || page.is_deleted() {
            continue;
        }
        if page.opaque.rightlink == INVALID_BLOCK_NUMBER {
            continue;
        }
        let bound = right_bound(&page);
        let items = read_leaf(&layout, &page).unwrap();
        if let Some(last) = items.last() {
            assert!(
                layout.compare(last, &bound).is_le(),
                "block {}: last item {:?} above right bound {:?}",
                blkno,
                last,
                bound
            );
        }
        let right = page.opaque.rightlink;
        drop(page);
        let sibling = page_read(rel, right).unwrap();
        if sibling.is_deleted() {
            continue;
        }
        if let Some(first) = read_leaf(&layout, &sibling).unwrap().first() {
            assert!(
                layout.compare(&bound, first).is_lt(),
                "block {}: right bound {:?} not below first item {:?} of block {}",
                blkno,
                bound,
                first,
                right
            );
        }
    }
}

/// Page class counts of the relation agree with the meta page.
pub fn check_meta_counts(index: &RumIndex) {
    let rel = index.relation();
    let meta = index.meta().unwrap();
    let (mut data, mut entry, mut entries) = (0u32, 0u32, 0i64);
    for blkno in (METAPAGE_BLKNO + 1)..rel.nblocks() {
        let page = page_read(rel, blkno).unwrap();
        if page.is_new() || page.is_deleted() {
            continue;
        }
        if page.is_data() {
            data += 1;
        } else {
            entry += 1;
            if page.is_leaf() {
                entries += page.max_offset_number() as i64;
            }
        }
    }
    assert_eq!(meta.n_total_pages, rel.nblocks());
    assert_eq!(meta.n_data_pages, data);
    assert_eq!(meta.n_entry_pages, entry);
    assert_eq!(meta.n_entries, entries);
}
