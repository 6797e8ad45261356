use super::*;
use crate::datatype::bson::BsonDocument;
use crate::datatype::term::{compare_terms, serialize_term, IndexTerm, TermCreateMetadata};
use crate::datatype::BsonValue;
use crate::opclass::{INT8_EQUAL, INT8_LEFT_DISTANCE, INT8_RIGHT_DISTANCE, TEXT_AND};
use crate::page::{page_get_entries, page_get_stats, ROOT_BLKNO};

#[test]
fn test_single_key_returns_rows_in_tid_order() {
    let index = text_index("single_key");
    index.build_empty().unwrap();
    index.insert(&[Some(Datum::text("a"))], tid(1, 2)).unwrap();
    index.insert(&[Some(Datum::text("a"))], tid(1, 1)).unwrap();

    let rows = scan_all(
        &index,
        vec![ScanKeyData::new(1, TEXT_AND, Datum::text("a"))],
        vec![],
    )
    .unwrap();
    let tids: Vec<_> = rows.iter().map(|row| row.tid).collect();
    assert_eq!(tids, vec![tid(1, 1), tid(1, 2)]);
    assert!(rows.iter().all(|row| !row.recheck));
}

#[test]
fn test_posting_list_moves_to_posting_tree() {
    let index = text_index("migration");
    index.build_empty().unwrap();
    for n in 0..10 {
        index.insert(&[Some(Datum::text("a"))], nth_tid(n)).unwrap();
    }
    let raw = index.relation().get_raw_page(ROOT_BLKNO).unwrap();
    let entries = page_get_entries(&raw, index.state()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["entryType"], "postingList");
    assert_eq!(entries[0]["numPostings"], 10);
    assert_eq!(entries[0]["firstEntry"], "a");

    for n in 10..1000 {
        index.insert(&[Some(Datum::text("a"))], nth_tid(n)).unwrap();
    }
    let raw = index.relation().get_raw_page(ROOT_BLKNO).unwrap();
    let entries = page_get_entries(&raw, index.state()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["entryType"], "postingTree");
    assert_eq!(entries[0]["numPostings"], -1);

    let found = scan_tids(&index, vec![ScanKeyData::new(1, TEXT_AND, Datum::text("a"))]);
    let expected: Vec<_> = (0..1000).map(nth_tid).collect();
    assert_eq!(found, expected);
}

#[test]
fn test_vacuum_deletes_empty_posting_leaf() {
    let index = int8_index("vacuum_leaf");
    let rows: Vec<_> = (0..30_000).map(|n| (nth_tid(n), 7)).collect();
    index.build(&ints(&rows)).unwrap();
    let baseline = index.vacuum_cleanup(None).unwrap();
    let data_pages = index.meta().unwrap().n_data_pages;
    assert!(data_pages > 3, "expected a multi-leaf posting tree, got {} pages", data_pages);

    let rel = index.relation();
    let layout = index.state().column(1).layout;
    let (victim, victim_items) = ((ROOT_BLKNO + 1)..rel.nblocks())
        .find_map(|blkno| {
            let page = page_read(rel, blkno).unwrap();
            let inner_leaf = page.is_data()
                && page.is_leaf()
                && page.opaque.leftlink != INVALID_BLOCK_NUMBER
                && page.opaque.rightlink != INVALID_BLOCK_NUMBER;
            inner_leaf.then(|| (blkno, read_leaf(&layout, &page).unwrap()))
        })
        .unwrap();
    let lo = victim_items.first().unwrap().iptr;
    let hi = victim_items.last().unwrap().iptr;

    let stats = index.bulk_delete(None, |t| t >= lo && t <= hi).unwrap();
    assert_eq!(stats.tuples_removed, victim_items.len() as u64);
    assert_eq!(stats.pages_deleted, 1);
    let stats = index.vacuum_cleanup(Some(stats)).unwrap();

    assert_eq!(index.meta().unwrap().n_data_pages, data_pages - 1);
    assert!(stats.pages_free > baseline.pages_free);
    assert!(rel.free_pages().contains(&victim));
    let page_stats = page_get_stats(&rel.get_raw_page(victim).unwrap()).unwrap();
    assert!(page_stats["flagsStr"].as_str().unwrap().contains("DELETED"));
    check_meta_counts(&index);
    check_right_bounds(&index, 1);

    let found = scan_tids(&index, vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(7))]);
    assert_eq!(found.len(), 30_000 - victim_items.len());
    assert!(found.iter().all(|&t| t < lo || t > hi));
}

#[test]
fn test_truncated_document_term() {
    let meta = TermCreateMetadata {
        size_limit: 200,
        ..Default::default()
    };
    let long = BsonValue::Document(
        BsonDocument::new().with("b", BsonValue::Utf8(vec![b'x'; 250])),
    );
    let term = serialize_term(b"a", &long, &meta).unwrap();
    assert!(term.truncated);
    assert!(term.bytes.len() <= 200);

    let decoded = IndexTerm::parse(&term.bytes).unwrap();
    assert!(decoded.is_truncated());
    assert_eq!(decoded.path, b"a");
    let BsonValue::Document(doc) = &decoded.value else {
        panic!("expected a document, got {:?}", decoded.value);
    };
    assert_eq!(doc.get("b"), Some(&BsonValue::MaxKey));

    // any string under b sorts first, however long
    for filler in [b'x', b'~'] {
        let string = BsonValue::Document(BsonDocument::new().with("b", BsonValue::Utf8(vec![filler; 200])));
        let other = serialize_term(b"a", &string, &TermCreateMetadata::default()).unwrap();
        assert!(compare_terms(&other.bytes, &term.bytes).unwrap().is_lt());
    }

    // a field that fits keeps its value
    let short = BsonValue::Document(BsonDocument::new().with("b", BsonValue::Utf8(vec![b'x'; 20])));
    let kept = serialize_term(b"a", &short, &meta).unwrap();
    assert!(!kept.truncated);
    assert_eq!(
        compare_terms(
            &kept.bytes,
            &serialize_term(b"a", &short, &TermCreateMetadata::default()).unwrap().bytes
        )
        .unwrap(),
        std::cmp::Ordering::Equal
    );
}

fn scores(rows: &[ScanResult]) -> Vec<i64> {
    rows.iter()
        .map(|row| {
            row.order_by_values[0]
                .as_ref()
                .and_then(Datum::as_float)
                .unwrap() as i64
        })
        .collect()
}

fn insert_scored(index: &RumIndex, rows: &[(ItemPointer, i64, i64)]) {
    index.build_empty().unwrap();
    for &(t, docid, score) in rows {
        index
            .insert(&[Some(Datum::Int(docid)), Some(Datum::Int(score))], t)
            .unwrap();
    }
}

#[test]
fn test_order_by_attached_value_forward() {
    let index = attached_index("order_forward", true);
    insert_scored(&index, &[(tid(1, 1), 1, 10), (tid(1, 2), 1, 30), (tid(1, 3), 1, 20)]);

    let rows = scan_all(
        &index,
        vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(1))],
        vec![ScanKeyData::new(2, INT8_RIGHT_DISTANCE, Datum::Int(0))],
    )
    .unwrap();
    let tids: Vec<_> = rows.iter().map(|row| row.tid).collect();
    assert_eq!(tids, vec![tid(1, 1), tid(1, 3), tid(1, 2)]);
    assert_eq!(scores(&rows), vec![10, 20, 30]);
}

#[test]
fn test_order_by_attached_value_backward() {
    let index = attached_index("order_backward", true);
    insert_scored(&index, &[(tid(1, 1), 1, 10), (tid(1, 2), 1, 30), (tid(1, 3), 1, 20)]);

    let rows = scan_all(
        &index,
        vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(1))],
        vec![ScanKeyData::new(2, INT8_LEFT_DISTANCE, Datum::Int(100))],
    )
    .unwrap();
    let tids: Vec<_> = rows.iter().map(|row| row.tid).collect();
    assert_eq!(tids, vec![tid(1, 2), tid(1, 3), tid(1, 1)]);
    assert_eq!(scores(&rows), vec![70, 80, 90]);
}

#[test]
fn test_order_by_attached_value_without_alternative_order() {
    let index = attached_index("order_sorted", false);
    insert_scored(
        &index,
        &[
            (tid(1, 1), 1, 10),
            (tid(1, 2), 1, 30),
            (tid(1, 3), 1, 20),
            (tid(1, 4), 2, 15),
        ],
    );

    let rows = scan_all(
        &index,
        vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(1))],
        vec![ScanKeyData::new(2, INT8_RIGHT_DISTANCE, Datum::Int(0))],
    )
    .unwrap();
    let tids: Vec<_> = rows.iter().map(|row| row.tid).collect();
    assert_eq!(tids, vec![tid(1, 1), tid(1, 3), tid(1, 2)]);
}

#[test]
fn test_ordered_scan_over_many_data_pages() {
    const ROWS: u32 = 5_000;
    let index = attached_index("order_many_pages", true);
    // a permutation of 0..ROWS so that tid order and score order disagree
    let score = |n: u32| (n as i64 * 7_919) % ROWS as i64;
    let heap: Vec<_> = (0..ROWS)
        .map(|n| HeapTuple::new(nth_tid(n), vec![Some(Datum::Int(1)), Some(Datum::Int(score(n)))]))
        .collect();
    index.build(&heap).unwrap();
    let data_leaves = (ROOT_BLKNO + 1..index.relation().nblocks())
        .filter(|&blkno| {
            let page = page_read(index.relation(), blkno).unwrap();
            page.is_data() && page.is_leaf()
        })
        .count();
    assert!(data_leaves > 1, "postings fit on {} data page", data_leaves);

    let mut by_score: Vec<(i64, ItemPointer)> = (0..ROWS).map(|n| (score(n), nth_tid(n))).collect();
    by_score.sort();

    let ordered = |strategy: u16, from: i64| {
        let rows = scan_all(
            &index,
            vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(1))],
            vec![ScanKeyData::new(2, strategy, Datum::Int(from))],
        )
        .unwrap();
        let finite: Vec<_> = rows
            .iter()
            .filter(|row| row.order_by_values[0].as_ref().and_then(Datum::as_float).unwrap().is_finite())
            .map(|row| row.tid)
            .collect();
        let unique: BTreeSet<_> = rows.iter().map(|row| row.tid).collect();
        assert_eq!(unique.len(), rows.len(), "a row came back twice");
        let distances = scores(&rows[..finite.len()]);
        assert!(distances.windows(2).all(|w| w[0] <= w[1]), "distances out of order");
        finite
    };

    let forward: Vec<_> = by_score.iter().map(|&(_, t)| t).collect();
    assert_eq!(ordered(INT8_RIGHT_DISTANCE, 0), forward);
    let backward: Vec<_> = by_score.iter().rev().map(|&(_, t)| t).collect();
    assert_eq!(ordered(INT8_LEFT_DISTANCE, ROWS as i64), backward);

    let middle = ROWS as i64 / 2;
    let upper: Vec<_> = by_score.iter().filter(|&&(s, _)| s >= middle).map(|&(_, t)| t).collect();
    assert_eq!(ordered(INT8_RIGHT_DISTANCE, middle), upper);
    let lower: Vec<_> = by_score.iter().rev().filter(|&&(s, _)| s <= middle).map(|&(_, t)| t).collect();
    assert_eq!(ordered(INT8_LEFT_DISTANCE, middle), lower);
}
