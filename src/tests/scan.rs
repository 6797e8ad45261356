use std::collections::BTreeSet;

use super::*;
use crate::datatype::bson::BsonDocument;
use crate::datatype::term::TermCreateMetadata;
use crate::datatype::BsonValue;
use crate::error::RumErrorKind;
use crate::guc::RumGucs;
use crate::index::{IndexProperty, ScanType, TidBitmap};
use crate::opclass::*;

fn numbers_index() -> (RumIndex, Vec<(ItemPointer, i64)>) {
    let index = int8_index("numbers");
    let rows: Vec<_> = (0..500).map(|n| (nth_tid(n), (n as i64 * 37) % 101 - 50)).collect();
    index.build(&ints(&rows)).unwrap();
    (index, rows)
}

fn expected(rows: &[(ItemPointer, i64)], pred: impl Fn(i64) -> bool) -> Vec<ItemPointer> {
    rows.iter().filter(|(_, v)| pred(*v)).map(|(t, _)| *t).collect()
}

#[test]
fn test_int8_range_strategies() {
    let (index, rows) = numbers_index();
    let cases: [(u16, fn(i64, i64) -> bool); 5] = [
        (INT8_LESS, |v, q| v < q),
        (INT8_LESS_EQUAL, |v, q| v <= q),
        (INT8_EQUAL, |v, q| v == q),
        (INT8_GREATER_EQUAL, |v, q| v >= q),
        (INT8_GREATER, |v, q| v > q),
    ];
    for query in [-60, -50, -7, 0, 13, 50, 70] {
        for (strategy, pred) in cases {
            let found = scan_tids(&index, vec![ScanKeyData::new(1, strategy, Datum::Int(query))]);
            assert_eq!(
                found,
                expected(&rows, |v| pred(v, query)),
                "strategy {} query {}",
                strategy,
                query
            );
        }
    }
}

#[test]
fn test_conditions_on_one_column_intersect() {
    let (index, rows) = numbers_index();
    let found = scan_tids(
        &index,
        vec![
            ScanKeyData::new(1, INT8_GREATER, Datum::Int(-10)),
            ScanKeyData::new(1, INT8_LESS_EQUAL, Datum::Int(10)),
        ],
    );
    assert_eq!(found, expected(&rows, |v| v > -10 && v <= 10));

    let bitmap = bitmap_tids(
        &index,
        vec![
            ScanKeyData::new(1, INT8_GREATER, Datum::Int(-10)),
            ScanKeyData::new(1, INT8_LESS_EQUAL, Datum::Int(10)),
        ],
    );
    assert_eq!(bitmap, found.into_iter().collect::<BTreeSet<_>>());
}

#[test]
fn test_order_by_distance() {
    let (index, rows) = numbers_index();
    let result = scan_all(
        &index,
        vec![ScanKeyData::new(1, INT8_GREATER_EQUAL, Datum::Int(0))],
        vec![ScanKeyData::new(1, INT8_DISTANCE, Datum::Int(20))],
    )
    .unwrap();

    let mut model: Vec<(f64, ItemPointer)> = rows
        .iter()
        .filter(|(_, v)| *v >= 0)
        .map(|&(t, v)| ((v - 20).abs() as f64, t))
        .collect();
    model.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    let got: Vec<(f64, ItemPointer)> = result
        .iter()
        .map(|row| (row.order_by_values[0].as_ref().and_then(Datum::as_float).unwrap(), row.tid))
        .collect();
    assert_eq!(got, model);
}

#[test]
fn test_order_by_without_condition_is_rejected() {
    let (index, _) = numbers_index();
    let err = scan_all(&index, vec![], vec![ScanKeyData::new(1, INT8_DISTANCE, Datum::Int(3))])
        .unwrap_err();
    assert_eq!(err.kind, RumErrorKind::InternalError);
}

#[test]
fn test_full_index_scan_includes_nulls() {
    let index = int8_index("nulls");
    let heap = vec![
        HeapTuple::new(tid(0, 1), vec![Some(Datum::Int(4))]),
        HeapTuple::new(tid(0, 2), vec![None]),
        HeapTuple::new(tid(0, 3), vec![Some(Datum::Int(-4))]),
    ];
    let result = index.build(&heap).unwrap();
    assert_eq!(result.heap_tuples, 3);
    assert_eq!(result.index_tuples, 3);

    assert_eq!(scan_tids(&index, vec![]), vec![tid(0, 1), tid(0, 2), tid(0, 3)]);
    assert_eq!(
        scan_tids(&index, vec![ScanKeyData::new(1, INT8_LESS, Datum::Int(100))]),
        vec![tid(0, 1), tid(0, 3)]
    );
    // a null argument matches nothing
    assert!(scan_tids(&index, vec![ScanKeyData::null(1, INT8_EQUAL)]).is_empty());
}

fn documents_index() -> RumIndex {
    let index = text_index("documents");
    let docs = [
        "the quick brown fox",
        "quick quick dog",
        "lazy dog sleeps",
        "Brown dog",
        "quiet evening",
    ];
    let heap: Vec<_> = docs
        .iter()
        .enumerate()
        .map(|(i, d)| HeapTuple::new(tid(0, i as u16 + 1), vec![Some(Datum::text(d))]))
        .collect();
    index.build(&heap).unwrap();
    index
}

fn text_query(index: &RumIndex, strategy: u16, query: &str) -> Vec<u16> {
    scan_tids(index, vec![ScanKeyData::new(1, strategy, Datum::text(query))])
        .into_iter()
        .map(|t| t.offset)
        .collect()
}

#[test]
fn test_text_queries() {
    let index = documents_index();
    assert_eq!(text_query(&index, TEXT_AND, "quick dog"), vec![2]);
    assert_eq!(text_query(&index, TEXT_AND, "brown"), vec![1, 4]);
    assert_eq!(text_query(&index, TEXT_OR, "fox sleeps"), vec![1, 3]);
    assert_eq!(text_query(&index, TEXT_OR, "qu*"), vec![1, 2, 5]);
    assert_eq!(text_query(&index, TEXT_AND, "qui* dog"), vec![2]);
    assert!(text_query(&index, TEXT_AND, "cat").is_empty());
    assert!(text_query(&index, TEXT_AND, "").is_empty());
    assert!(index.meta().unwrap().is_multi_key());
}

#[test]
fn test_text_order_by_position() {
    let index = documents_index();
    let rows = scan_all(
        &index,
        vec![ScanKeyData::new(1, TEXT_AND, Datum::text("dog"))],
        vec![ScanKeyData::new(1, TEXT_POSITION, Datum::text("dog"))],
    )
    .unwrap();
    let got: Vec<(u16, f64)> = rows
        .iter()
        .map(|row| {
            (
                row.tid.offset,
                row.order_by_values[0].as_ref().and_then(Datum::as_float).unwrap(),
            )
        })
        .collect();
    assert_eq!(got, vec![(3, 2.0), (4, 2.0), (2, 3.0)]);
}

fn bson_doc(key: &str, value: BsonValue) -> Datum {
    Datum::Bytes(BsonDocument::new().with(key, value).to_bytes())
}

fn bson_index() -> RumIndex {
    let meta = TermCreateMetadata {
        path_prefix: b"a".to_vec(),
        ..Default::default()
    };
    let index = RumIndex::create(
        "bson",
        vec![IndexColumn::new("document", TypeInfo::Varlena, bson_term_ops(meta))],
        &RumOptions::default(),
    )
    .unwrap();
    let heap = vec![
        HeapTuple::new(tid(0, 1), vec![Some(bson_doc("a", BsonValue::Int32(5)))]),
        HeapTuple::new(tid(0, 2), vec![Some(bson_doc("a", BsonValue::string("x")))]),
        HeapTuple::new(tid(0, 3), vec![Some(bson_doc("a", BsonValue::Int64(1)))]),
        HeapTuple::new(tid(0, 4), vec![Some(bson_doc("b", BsonValue::Int32(2)))]),
        HeapTuple::new(tid(0, 5), vec![Some(bson_doc("a", BsonValue::Double(3.0)))]),
    ];
    index.build(&heap).unwrap();
    index
}

fn bson_query(index: &RumIndex, strategy: u16, value: BsonValue) -> BTreeSet<u16> {
    bitmap_tids(index, vec![ScanKeyData::new(1, strategy, bson_doc("a", value))])
        .into_iter()
        .map(|t| t.offset)
        .collect()
}

#[test]
fn test_bson_term_queries() {
    let index = bson_index();
    let set = |v: &[u16]| v.iter().copied().collect::<BTreeSet<_>>();
    assert_eq!(bson_query(&index, BSON_EQUAL, BsonValue::Int64(5)), set(&[1]));
    assert_eq!(bson_query(&index, BSON_EQUAL, BsonValue::Double(1.0)), set(&[3]));
    assert_eq!(bson_query(&index, BSON_GREATER, BsonValue::Int32(2)), set(&[1, 5]));
    assert_eq!(bson_query(&index, BSON_GREATER_EQUAL, BsonValue::Int32(3)), set(&[1, 5]));
    assert_eq!(bson_query(&index, BSON_LESS, BsonValue::Int32(4)), set(&[3, 5]));
    assert_eq!(bson_query(&index, BSON_LESS_EQUAL, BsonValue::Int32(5)), set(&[1, 3, 5]));
    assert_eq!(bson_query(&index, BSON_EXISTS, BsonValue::Bool(true)), set(&[1, 2, 3, 5]));
    assert_eq!(bson_query(&index, BSON_GREATER, BsonValue::string("a")), set(&[2]));
}

#[test]
fn test_bson_order_by_raw_keys() {
    let index = bson_index();
    let mut scan = index.begin_scan(
        vec![ScanKeyData::new(1, BSON_EXISTS, bson_doc("a", BsonValue::Bool(true)))],
        vec![ScanKeyData::new(1, BSON_ORDER_BY, bson_doc("a", BsonValue::Int32(0)))],
    );
    let mut offsets = Vec::new();
    while let Some(row) = scan.get_tuple(ScanDirection::Forward).unwrap() {
        assert!(row.order_by_values[0].is_some());
        offsets.push(row.tid.offset);
    }
    assert_eq!(offsets, vec![3, 5, 1, 2]);
    assert_eq!(scan.explain().scan_type, Some(ScanType::Ordered));
}

#[test]
fn test_explain_reports_scan_type() {
    let (index, _) = numbers_index();
    let mut scan = index.begin_scan(vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(3))], vec![]);
    assert_eq!(scan.explain().scan_type, None);
    scan.get_tuple(ScanDirection::Forward).unwrap();
    assert_eq!(scan.explain().scan_type, Some(ScanType::Regular));
    assert_eq!(scan.end_scan().scan_type.map(ScanType::name), Some("regular"));

    let text = documents_index();
    let mut scan = text.begin_scan(vec![ScanKeyData::new(1, TEXT_AND, Datum::text("quick dog"))], vec![]);
    scan.get_tuple(ScanDirection::Forward).unwrap();
    assert_eq!(scan.explain().scan_type, Some(ScanType::Fast));
}

#[test]
fn test_rescan_replaces_keys() {
    let (index, rows) = numbers_index();
    let mut scan = index.begin_scan(vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(3))], vec![]);
    let first = scan.get_tuple(ScanDirection::Forward).unwrap().unwrap();
    assert_eq!(first.tid, expected(&rows, |v| v == 3)[0]);

    scan.rescan(Some(vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(-3))]), None);
    let mut found = Vec::new();
    while let Some(row) = scan.get_tuple(ScanDirection::Forward).unwrap() {
        found.push(row.tid);
    }
    assert_eq!(found, expected(&rows, |v| v == -3));
}

#[test]
fn test_mark_restore_is_not_supported() {
    let (index, _) = numbers_index();
    let mut scan = index.begin_scan(vec![], vec![]);
    assert_eq!(scan.mark_pos().unwrap_err().kind, RumErrorKind::FeatureNotSupported);
    assert_eq!(scan.restore_pos().unwrap_err().message, "RUM does not support mark/restore");
}

#[test]
fn test_fuzzy_search_limit_caps_bitmap() {
    let gucs = RumGucs {
        fuzzy_search_limit: 10,
        ..Default::default()
    };
    let index = RumIndex::create_with_gucs(
        "fuzzy",
        vec![IndexColumn::new("a", TypeInfo::Int(8), int8_ops())],
        &RumOptions::default(),
        gucs,
    )
    .unwrap();
    let rows: Vec<_> = (0..100).map(|n| (nth_tid(n), 1)).collect();
    index.build(&ints(&rows)).unwrap();

    let mut bitmap = TidBitmap::new();
    let mut scan = index.begin_scan(vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(1))], vec![]);
    assert_eq!(scan.get_bitmap(&mut bitmap).unwrap(), 10);
    assert_eq!(bitmap.len(), 10);
}

#[test]
fn test_cancel_interrupts_scan() {
    let (index, _) = numbers_index();
    index.relation().request_cancel();
    let err = scan_all(&index, vec![ScanKeyData::new(1, INT8_GREATER, Datum::Int(0))], vec![])
        .unwrap_err();
    assert_eq!(err.kind, RumErrorKind::QueryCanceled);
    // the request is consumed
    assert!(scan_all(&index, vec![ScanKeyData::new(1, INT8_GREATER, Datum::Int(0))], vec![]).is_ok());
}

#[test]
fn test_invalid_scan_keys() {
    let (index, _) = numbers_index();
    let err = scan_all(&index, vec![ScanKeyData::new(3, INT8_EQUAL, Datum::Int(1))], vec![])
        .unwrap_err();
    assert_eq!(err.kind, RumErrorKind::BadValue);
    let err = scan_all(&index, vec![ScanKeyData::new(1, 99, Datum::Int(1))], vec![]).unwrap_err();
    assert_eq!(err.kind, RumErrorKind::BadValue);
}

#[test]
fn test_attach_options_are_validated() {
    let columns = || {
        vec![
            IndexColumn::new("docid", TypeInfo::Int(8), int8_ops()),
            IndexColumn::new("score", TypeInfo::Int(8), int8_ops()),
            IndexColumn::new("body", TypeInfo::Varlena, text_ops()),
        ]
    };
    let err = RumIndex::create("opts", columns(), &RumOptions::attach("missing", "docid", false))
        .unwrap_err();
    assert_eq!(err.message, "attribute \"missing\" is not found in index");

    let err = RumIndex::create("opts", columns(), &RumOptions::attach("score", "score", false))
        .unwrap_err();
    assert!(err.message.contains("cannot be the same"));

    let half = RumOptions {
        attach: Some("score".into()),
        ..Default::default()
    };
    let err = RumIndex::create("opts", columns(), &half).unwrap_err();
    assert_eq!(err.message, "AddTo and OrderBy columns should be defined both");

    let err = RumIndex::create("opts", columns(), &RumOptions::attach("body", "docid", false))
        .unwrap_err();
    assert_eq!(err.kind, RumErrorKind::NotSupported);

    let err = RumIndex::create("opts", columns(), &RumOptions::attach("score", "body", false))
        .unwrap_err();
    assert!(err.message.contains("AddInfo"));

    let parsed = RumOptions::from_json(r#"{"attach": "score", "to": "docid", "order_by_attach": true}"#)
        .unwrap();
    assert_eq!(parsed, RumOptions::attach("score", "docid", true));
    assert!(RumOptions::from_json(r#"{"attach": 3}"#).is_err());
}

#[test]
fn test_index_properties() {
    let index = attached_index("properties", false);
    assert_eq!(index.property(1, IndexProperty::DistanceOrderable), Some(true));
    assert_eq!(index.property(1, IndexProperty::Returnable), None);
    assert_eq!(index.property(9, IndexProperty::DistanceOrderable), None);
    let caps = index.capabilities();
    assert!(caps.can_order_by_op && caps.can_multi_col && !caps.can_mark_restore);
}

#[test]
fn test_gucs_from_json() {
    let gucs = RumGucs::from_json(r#"{"disableFastScan": true, "fuzzySearchLimit": 5}"#).unwrap();
    assert!(gucs.disable_fast_scan);
    assert_eq!(gucs.fuzzy_search_limit, 5);
    assert!(gucs.prefer_ordered_index_scan);
    assert_eq!(gucs.parallel_workers(), 0);
}

#[test]
fn test_parallel_build_matches_serial_build() {
    let rows: Vec<_> = (0..3_000).map(|n| (nth_tid(n), (n % 17) as i64)).collect();
    let gucs = RumGucs {
        enable_parallel_index_build: true,
        parallel_index_workers_override: 3,
        maintenance_work_mem_items: 500,
        ..Default::default()
    };
    let parallel = RumIndex::create_with_gucs(
        "parallel",
        vec![IndexColumn::new("a", TypeInfo::Int(8), int8_ops())],
        &RumOptions::default(),
        gucs,
    )
    .unwrap();
    parallel.build(&ints(&rows)).unwrap();
    let serial = int8_index("serial");
    serial.build(&ints(&rows)).unwrap();

    for v in [0, 5, 16] {
        let key = || vec![ScanKeyData::new(1, INT8_EQUAL, Datum::Int(v))];
        assert_eq!(scan_tids(&parallel, key()), scan_tids(&serial, key()));
    }
    parallel.vacuum_cleanup(None).unwrap();
    assert_eq!(parallel.meta().unwrap().n_entries, 17);
    check_meta_counts(&parallel);
}

#[test]
fn test_search_mode_from_raw() {
    assert_eq!(SearchMode::from_raw(0), SearchMode::Default);
    assert_eq!(SearchMode::from_raw(1), SearchMode::IncludeEmpty);
    assert_eq!(SearchMode::from_raw(2), SearchMode::All);
    // out of range modes widen to All rather than Everything
    assert_eq!(SearchMode::from_raw(3), SearchMode::All);
    assert_eq!(SearchMode::from_raw(-1), SearchMode::All);
}
