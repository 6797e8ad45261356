use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::datatype::bson::{compare_values, BsonDocument};
use crate::datatype::term::{
    composite_terms, compare_terms, is_truncated, root_exists_term, root_truncated_term,
    serialize_composite, serialize_term, serialize_term_with_compression, value_undefined_term,
    IndexTerm, TermCreateMetadata, COMPRESSED, INDEX_MAX_KEYS,
};
use crate::datatype::{BsonValue, TypeInfo};
use crate::error::RumErrorKind;
use crate::tree::posting::{decode_item, decode_items, encode_item, encode_items, encoded_items_size};
use crate::tree::{ItemPointer, PostingLayout, RumItem};

fn random_items(rng: &mut StdRng, count: usize, with_add_info: bool) -> Vec<RumItem> {
    let mut iptr = ItemPointer::new(rng.random_range(0..4), 1);
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        iptr = if rng.random_bool(0.3) || iptr.offset > 2_000 {
            ItemPointer::new(iptr.block + rng.random_range(1..100_000), rng.random_range(1..300))
        } else {
            ItemPointer::new(iptr.block, iptr.offset + rng.random_range(1..200))
        };
        let add_info = (with_add_info && rng.random_bool(0.8)).then(|| rng.random_range(0..i32::MAX as u64));
        items.push(RumItem::with_add_info(iptr, add_info));
    }
    items
}

#[test]
fn test_posting_round_trip() {
    let seed = rand::rng().random_range(0..u64::MAX);
    let mut rng = StdRng::seed_from_u64(seed);
    println!("Seed: {}", seed);

    let layouts = [
        PostingLayout::default(),
        PostingLayout {
            add_info_type: Some(TypeInfo::Int(4)),
            ..Default::default()
        },
        PostingLayout {
            add_info_type: Some(TypeInfo::Int(8)),
            alternative_order: true,
            ..Default::default()
        },
    ];
    for layout in &layouts {
        for _ in 0..50 {
            let count = rng.random_range(1..400);
            let items = random_items(&mut rng, count, layout.has_add_info());
            let encoded = encode_items(layout, &items);
            assert_eq!(encoded.len(), encoded_items_size(layout, &items));
            assert_eq!(decode_items(layout, &encoded, items.len()).unwrap(), items);
        }
    }
}

#[test]
fn test_posting_decode_from_any_previous_item() {
    let layout = PostingLayout::default();
    let prev = ItemPointer::new(1_000, 7);
    for item in [
        RumItem::new(ItemPointer::new(1_000, 8)),
        RumItem::new(ItemPointer::new(1_001, 1)),
        RumItem::new(ItemPointer::new(1 << 30, 0x7fff)),
    ] {
        let mut out = Vec::new();
        encode_item(&layout, &mut out, &item, &prev);
        let mut pos = 0;
        assert_eq!(decode_item(&layout, &out, &mut pos, &prev).unwrap(), item);
        assert_eq!(pos, out.len());
    }
}

#[test]
fn test_truncated_posting_data_is_an_error() {
    let layout = PostingLayout {
        add_info_type: Some(TypeInfo::Int(8)),
        ..Default::default()
    };
    let items = vec![RumItem::with_add_info(ItemPointer::new(3, 4), Some(42))];
    let encoded = encode_items(&layout, &items);
    let err = decode_items(&layout, &encoded[..encoded.len() - 1], 1).unwrap_err();
    assert_eq!(err.kind, RumErrorKind::InternalError);
}

fn random_value(rng: &mut StdRng) -> BsonValue {
    match rng.random_range(0..8) {
        0 => BsonValue::Int32(rng.random_range(-50..50)),
        1 => BsonValue::Int64(rng.random_range(-50..50)),
        2 => BsonValue::Double(rng.random_range(-50.0..50.0)),
        3 => {
            let len = rng.random_range(0..6);
            BsonValue::Utf8((0..len).map(|_| rng.random_range(b'a'..=b'e')).collect())
        }
        4 => BsonValue::Bool(rng.random_bool(0.5)),
        5 => BsonValue::Null,
        6 => BsonValue::Document(
            BsonDocument::new().with("x", BsonValue::Int32(rng.random_range(0..3))),
        ),
        _ => BsonValue::Array(vec![BsonValue::Int32(rng.random_range(0..3))]),
    }
}

#[test]
fn test_term_order_matches_value_order() {
    let seed = rand::rng().random_range(0..u64::MAX);
    let mut rng = StdRng::seed_from_u64(seed);
    println!("Seed: {}", seed);

    let paths: [&[u8]; 4] = [b"a", b"a.b", b"ab", b"b"];
    let meta = TermCreateMetadata::default();
    for _ in 0..2_000 {
        let (pa, va) = (paths[rng.random_range(0..4)], random_value(&mut rng));
        let (pb, vb) = (paths[rng.random_range(0..4)], random_value(&mut rng));
        let ta = serialize_term(pa, &va, &meta).unwrap();
        let tb = serialize_term(pb, &vb, &meta).unwrap();
        let expected = match pa.cmp(pb) {
            Ordering::Equal => compare_values(&va, &vb, &mut true),
            other => other,
        };
        assert_eq!(
            compare_terms(&ta.bytes, &tb.bytes).unwrap(),
            expected,
            "{:?}={:?} against {:?}={:?}",
            String::from_utf8_lossy(pa),
            va,
            String::from_utf8_lossy(pb),
            vb
        );
    }
}

#[test]
fn test_descending_terms_reverse_value_order() {
    let meta = TermCreateMetadata {
        is_descending: true,
        ..Default::default()
    };
    let low = serialize_term(b"a", &BsonValue::Int32(1), &meta).unwrap();
    let high = serialize_term(b"a", &BsonValue::Int32(2), &meta).unwrap();
    assert_eq!(compare_terms(&low.bytes, &high.bytes).unwrap(), Ordering::Greater);

    let ascending = serialize_term(b"a", &BsonValue::Int32(1), &TermCreateMetadata::default()).unwrap();
    let err = compare_terms(&ascending.bytes, &low.bytes).unwrap_err();
    assert_eq!(err.kind, RumErrorKind::InternalError);
}

#[test]
fn test_truncation_is_monotonic_in_the_limit() {
    let value = BsonValue::Utf8(vec![b'q'; 600]);
    let natural = serialize_term(b"path", &value, &TermCreateMetadata::default()).unwrap();
    let mut previous: Option<Vec<u8>> = None;
    for limit in [64, 100, 200, 400, 1_000] {
        let meta = TermCreateMetadata {
            size_limit: limit,
            ..Default::default()
        };
        let term = serialize_term(b"path", &value, &meta).unwrap();
        assert!(term.bytes.len() <= limit as usize + 1);
        assert_eq!(term.truncated, limit < natural.bytes.len() as i32);
        if let Some(previous) = &previous {
            assert!(compare_terms(previous, &term.bytes).unwrap().is_le());
        }
        if !term.truncated {
            assert_eq!(compare_terms(&term.bytes, &natural.bytes).unwrap(), Ordering::Equal);
        }
        previous = Some(term.bytes);
    }
}

#[test]
fn test_path_longer_than_limit_fails() {
    let meta = TermCreateMetadata {
        size_limit: 10,
        ..Default::default()
    };
    let err = serialize_term(b"a.very.long.path", &BsonValue::Int32(1), &meta).unwrap_err();
    assert_eq!(err.kind, RumErrorKind::ProgramLimitExceeded);
    assert!(err.detail_log.is_some());
}

#[test]
fn test_metadata_terms_sort_first() {
    let meta = TermCreateMetadata {
        path_prefix: b"a".to_vec(),
        ..Default::default()
    };
    let exists = root_exists_term(&meta).unwrap();
    let value = serialize_term(b"", &BsonValue::MinKey, &meta).unwrap();
    assert!(compare_terms(&exists, &value.bytes).unwrap().is_lt());

    let truncated = root_truncated_term(&meta).unwrap();
    assert!(is_truncated(&truncated));

    let undefined = IndexTerm::parse(&value_undefined_term(&meta).unwrap()).unwrap();
    assert!(undefined.metadata.is_value_undefined());
}

#[test]
fn test_composite_terms() {
    let meta = TermCreateMetadata::default();
    let a = serialize_term(b"a", &BsonValue::Int32(1), &meta).unwrap().bytes;
    let b = serialize_term(b"b", &BsonValue::string("x"), &meta).unwrap().bytes;
    let b2 = serialize_term(b"b", &BsonValue::string("y"), &meta).unwrap().bytes;

    let single = serialize_composite(std::slice::from_ref(&a)).unwrap();
    assert_eq!(single.bytes, a);

    let ab = serialize_composite(&[a.clone(), b.clone()]).unwrap().bytes;
    let ab2 = serialize_composite(&[a.clone(), b2]).unwrap().bytes;
    let parts = composite_terms(&ab).unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0], &a[..]);
    assert_eq!(parts[1], &b[..]);
    assert!(compare_terms(&ab, &ab2).unwrap().is_lt());

    let too_many = vec![a; INDEX_MAX_KEYS + 1];
    let err = serialize_composite(&too_many).unwrap_err();
    assert_eq!(err.kind, RumErrorKind::ProgramLimitExceeded);
}

#[test]
fn test_compressed_terms_compare_like_plain_ones() {
    let meta = TermCreateMetadata {
        compression_threshold: 32,
        ..Default::default()
    };
    let low = BsonValue::Utf8(vec![b'z'; 300]);
    let mut high_bytes = vec![b'z'; 300];
    high_bytes.push(b'!');
    let high = BsonValue::Utf8(high_bytes);

    let packed = serialize_term_with_compression(b"a", &low, &meta).unwrap();
    assert_ne!(packed.bytes[0] & COMPRESSED, 0);
    assert!(packed.bytes.len() < 100);
    let plain = serialize_term(b"a", &high, &TermCreateMetadata::default()).unwrap();
    assert!(compare_terms(&packed.bytes, &plain.bytes).unwrap().is_lt());
    assert_eq!(IndexTerm::parse(&packed.bytes).unwrap().value, low);
}
