use super::*;
use crate::error::RumErrorKind;
use crate::opclass::TEXT_AND;
use crate::page::{
    meta_page_info, page_get_data_items, page_get_entries, page_get_stats, ROOT_BLKNO,
    SIZE_OF_ITEM_ID, SIZE_OF_PAGE_HEADER,
};
use crate::tree::META_VERSION;

#[test]
fn test_meta_page_info() {
    let index = text_index("inspect_meta");
    let heap: Vec<_> = ["one two", "two three", "three"]
        .iter()
        .enumerate()
        .map(|(i, d)| HeapTuple::new(tid(0, i as u16 + 1), vec![Some(Datum::text(d))]))
        .collect();
    index.build(&heap).unwrap();

    let raw = index.relation().get_raw_page(METAPAGE_BLKNO).unwrap();
    let info = meta_page_info(&raw).unwrap();
    assert_eq!(info["totalPages"], index.relation().nblocks());
    assert_eq!(info["entryPages"], 1);
    assert_eq!(info["dataPages"], 0);
    assert_eq!(info["entries"], 3);
    assert_eq!(info["pendingHeapTuples"], 1);
}

#[test]
fn test_meta_page_version_mismatch() {
    let index = int8_index("inspect_version");
    index.build_empty().unwrap();
    let mut raw = index.relation().get_raw_page(METAPAGE_BLKNO).unwrap();
    let version = &mut raw[SIZE_OF_PAGE_HEADER..SIZE_OF_PAGE_HEADER + 4];
    assert_eq!(version, &META_VERSION.to_ne_bytes()[..]);
    version.copy_from_slice(&7u32.to_ne_bytes());

    let err = meta_page_info(&raw).unwrap_err();
    assert_eq!(err.message, "Invalid RUM version in metadata page");
    assert!(err.detail_log.unwrap().contains("got 7"));

    let err = meta_page_info(&raw[..100]).unwrap_err();
    assert_eq!(err.kind, RumErrorKind::BadValue);
}

#[test]
fn test_entry_page_listing() {
    let index = text_index("inspect_entries");
    index.build_empty().unwrap();
    index.insert(&[Some(Datum::text("beta alpha"))], tid(0, 1)).unwrap();
    index.insert(&[Some(Datum::text("alpha"))], tid(0, 2)).unwrap();
    index.insert(&[None], tid(0, 3)).unwrap();

    let raw = index.relation().get_raw_page(ROOT_BLKNO).unwrap();
    let stats = page_get_stats(&raw).unwrap();
    assert_eq!(stats["flagsStr"], "LEAF");
    assert_eq!(stats["leftLink"], serde_json::Value::Null);
    assert_eq!(stats["rightLink"], serde_json::Value::Null);
    assert_eq!(stats["nEntries"], 3);

    let entries = page_get_entries(&raw, index.state()).unwrap();
    let first: Vec<_> = entries.iter().map(|e| e["firstEntry"].as_str().unwrap()).collect();
    assert_eq!(first, vec!["alpha", "beta", "NullItem"]);
    assert_eq!(entries[0]["offset"], 1);
    assert_eq!(entries[0]["numPostings"], 2);
    assert_eq!(entries[0]["firstTids"], "(0,1),(0,2),");
    assert_eq!(entries[1]["firstTids"], "(0,1),");
    assert!(entries.iter().all(|e| e["entryType"] == "postingList"));
}

#[test]
fn test_data_page_listing() {
    let index = int8_index("inspect_data");
    let rows: Vec<_> = (0..20_000).map(|n| (nth_tid(n), 1)).collect();
    index.build(&ints(&rows)).unwrap();
    let rel = index.relation();
    let layout = index.state().column(1).layout;

    let (mut leaves, mut internals) = (0, 0);
    for blkno in (ROOT_BLKNO + 1)..rel.nblocks() {
        let raw = rel.get_raw_page(blkno).unwrap();
        let page = page_read(rel, blkno).unwrap();
        if !page.is_data() || page.is_deleted() {
            continue;
        }
        let items = page_get_data_items(&raw, &layout).unwrap();
        let stats = page_get_stats(&raw).unwrap();
        assert_eq!(items[0]["offset"], 0);
        assert_eq!(stats["nEntries"], page.opaque.maxoff);
        assert_eq!(items.len(), page.opaque.maxoff as usize + 1);
        if page.is_leaf() {
            leaves += 1;
            assert!(stats["flagsStr"].as_str().unwrap().contains("DATA"));
            let tids = read_leaf(&layout, &page).unwrap();
            assert_eq!(items[1]["itemTid"], tids[0].iptr.to_string());
        } else {
            internals += 1;
            drop(page);
            for item in &items[1..] {
                let child = item["childBlock"].as_u64().unwrap() as u32;
                assert!(page_read(rel, child).unwrap().is_data());
            }
        }
        // entry listings refuse data pages
        assert!(page_get_entries(&raw, index.state()).unwrap().is_empty());
    }
    assert!(leaves > 1);
    assert!(internals >= 1);

    let root = rel.get_raw_page(ROOT_BLKNO).unwrap();
    assert!(page_get_data_items(&root, &layout).unwrap().is_empty());
    let entries = page_get_entries(&root, index.state()).unwrap();
    assert_eq!(entries[0]["entryType"], "postingTree");
    assert_eq!(entries[0]["firstTids"], serde_json::Value::Null);

    let found = scan_tids(&index, vec![ScanKeyData::new(1, crate::opclass::INT8_EQUAL, Datum::Int(1))]);
    assert_eq!(found.len(), 20_000);
}

#[test]
fn test_text_entries_after_many_keys_split_the_root() {
    let index = text_index("inspect_split");
    index.build_empty().unwrap();
    for n in 0..3_000u32 {
        let word = format!("word{:05}", n);
        index.insert(&[Some(Datum::text(&word))], nth_tid(n)).unwrap();
    }
    let raw = index.relation().get_raw_page(ROOT_BLKNO).unwrap();
    let stats = page_get_stats(&raw).unwrap();
    assert!(!stats["flagsStr"].as_str().unwrap().contains("LEAF"));
    index.vacuum_cleanup(None).unwrap();
    check_meta_counts(&index);

    for n in [0u32, 1_234, 2_999] {
        let word = format!("word{:05}", n);
        let found = scan_tids(&index, vec![ScanKeyData::new(1, TEXT_AND, Datum::text(&word))]);
        assert_eq!(found, vec![nth_tid(n)]);
    }
}

#[test]
fn test_entry_listing_rejects_broken_line_pointers() {
    let index = text_index("inspect_broken");
    index.build_empty().unwrap();
    index.insert(&[Some(Datum::text("alpha beta"))], tid(0, 1)).unwrap();
    let raw = index.relation().get_raw_page(ROOT_BLKNO).unwrap();
    let pointer = SIZE_OF_PAGE_HEADER + SIZE_OF_ITEM_ID;

    // second line pointer runs past the end of the page
    let mut broken = raw.clone();
    // lp_off 8000, LP_NORMAL, lp_len 1000
    let overrun: u32 = 8_000 | (1 << 15) | (1_000 << 17);
    broken[pointer..pointer + 4].copy_from_slice(&overrun.to_ne_bytes());
    let err = page_get_entries(&broken, index.state()).unwrap_err();
    assert_eq!(err.kind, RumErrorKind::BadValue);
    assert!(err.message.contains("offset 2"), "{}", err.message);

    // pd_lower claims more line pointers than the page holds
    let mut broken = raw;
    broken[12..14].copy_from_slice(&60_000u16.to_ne_bytes());
    let err = page_get_entries(&broken, index.state()).unwrap_err();
    assert_eq!(err.kind, RumErrorKind::BadValue);
}
