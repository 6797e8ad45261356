//! Introspection of raw page images, reported as JSON objects.

use serde_json::{json, Map, Value};

use crate::datatype::Datum;
use crate::error::{RumError, RumResult};
use crate::tree::posting::{posting_items, read_leaf, right_bound};
use crate::tree::{EntryKeyspace, EntryTuple, MetaPageData, NullCategory, PostingLayout, META_VERSION};

use super::{
    ItemIdData, RumPage, INVALID_BLOCK_NUMBER, PAGE_SPECIAL_OFFSET, SIZE_OF_ITEM_ID,
    SIZE_OF_PAGE_HEADER,
};

const SIZE_OF_TUPLE_HEADER: usize = 8;

fn link(blkno: u32) -> Value {
    if blkno == INVALID_BLOCK_NUMBER {
        Value::Null
    } else {
        json!(blkno)
    }
}

fn flags_str(page: &RumPage) -> String {
    let mut names = Vec::new();
    if page.is_leaf() {
        names.push("LEAF");
    }
    if page.is_data() {
        names.push("DATA");
    }
    if page.is_deleted() {
        names.push("DELETED");
    }
    if page.is_half_dead() {
        names.push("HALFDEAD");
    }
    names.join("|")
}

fn datum_text(datum: &Datum) -> String {
    match datum {
        Datum::Int(v) => v.to_string(),
        Datum::Float(v) => v.to_string(),
        Datum::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => format!("\\x{}", hex(bytes)),
        },
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn meta_page_info(raw: &[u8]) -> RumResult<Value> {
    let page = RumPage::from_bytes(raw)?;
    let meta: MetaPageData = *RumPage::as_ref::<MetaPageData>(&page);
    if meta.rum_version != META_VERSION {
        return Err(RumError::bad_value("Invalid RUM version in metadata page").with_detail(format!(
            "Expected version {}, got {}.",
            META_VERSION, meta.rum_version
        )));
    }
    Ok(json!({
        "totalPages": meta.n_total_pages,
        "entryPages": meta.n_entry_pages,
        "dataPages": meta.n_data_pages,
        "entries": meta.n_entries,
        "pendingHeapTuples": meta.n_pending_heap_tuples,
    }))
}

pub fn page_get_stats(raw: &[u8]) -> RumResult<Value> {
    let page = RumPage::from_bytes(raw)?;
    let n_entries = if page.is_data() {
        page.opaque.maxoff
    } else {
        page.max_offset_number()
    };
    Ok(json!({
        "flags": page.opaque.flags,
        "flagsStr": flags_str(&page),
        "leftLink": link(page.opaque.leftlink),
        "rightLink": link(page.opaque.rightlink),
        "nEntries": n_entries,
    }))
}

/// One object per tuple of an entry page. `ks` decodes the keys.
fn check_item_id(item_id: ItemIdData, off: u16) -> RumResult<()> {
    let (start, len) = (item_id.lp_off(), item_id.lp_len());
    if start < SIZE_OF_PAGE_HEADER || start + len > PAGE_SPECIAL_OFFSET || len < SIZE_OF_TUPLE_HEADER {
        return Err(RumError::bad_value(format!(
            "invalid line pointer at offset {}: start {} length {}",
            off, start, len
        )));
    }
    Ok(())
}

pub fn page_get_entries<K: EntryKeyspace + ?Sized>(raw: &[u8], ks: &K) -> RumResult<Vec<Value>> {
    let page = RumPage::from_bytes(raw)?;
    if page.is_data() || page.is_deleted() {
        log::warn!("Cannot yet enumerate data or deleted pages");
        return Ok(Vec::new());
    }
    let maxoff = page.max_offset_number();
    if SIZE_OF_PAGE_HEADER + maxoff as usize * SIZE_OF_ITEM_ID > PAGE_SPECIAL_OFFSET {
        return Err(RumError::bad_value(format!(
            "line pointer array of {} items overruns the page",
            maxoff
        )));
    }
    let mut rows = Vec::with_capacity(maxoff as usize);
    for off in 1..=maxoff {
        check_item_id(page.item_id(off), off)?;
        let tuple = EntryTuple::new(page.item(off));
        let raw = tuple.raw();
        let data = &raw[SIZE_OF_TUPLE_HEADER.min(raw.len())..tuple.size().min(raw.len())];
        let tuple_tid = format!("({},{})", tuple.downlink(), tuple.tid_offset());

        let mut row = Map::new();
        row.insert("offset".into(), json!(off));
        row.insert("tupleTid".into(), json!(tuple_tid));
        row.insert(
            "entryType".into(),
            json!(if tuple.is_posting_tree() { "postingTree" } else { "postingList" }),
        );
        row.insert(
            "numPostings".into(),
            json!(if tuple.is_posting_tree() { -1 } else { tuple.nposting() as i64 }),
        );
        row.insert("data".into(), json!(hex(data)));
        let first_tids = if page.is_leaf() && !tuple.is_posting_tree() && tuple.nposting() > 0 {
            let tids: String = tuple
                .items(ks)?
                .iter()
                .take(5)
                .map(|item| format!("{},", item.iptr))
                .collect();
            json!(tids)
        } else {
            Value::Null
        };
        row.insert("firstTids".into(), first_tids);
        let key = tuple.entry_key(ks)?;
        let first_entry = match (key.category, key.key.as_ref()) {
            (NullCategory::NormKey, Some(datum)) => datum_text(datum),
            (category, _) => format!("{:?}", category),
        };
        row.insert("firstEntry".into(), json!(first_entry));
        rows.push(Value::Object(row));
    }
    Ok(rows)
}

/// One object per item of a data page, the right bound first at offset 0.
pub fn page_get_data_items(raw: &[u8], layout: &PostingLayout) -> RumResult<Vec<Value>> {
    let page = RumPage::from_bytes(raw)?;
    if !page.is_data() || page.is_deleted() {
        log::warn!("Cannot yet enumerate deleted pages");
        return Ok(Vec::new());
    }
    let mut rows = vec![json!({
        "offset": 0,
        "itemTid": right_bound(&page).iptr.to_string(),
    })];
    if page.is_leaf() {
        for (i, item) in read_leaf(layout, &page)?.iter().enumerate() {
            rows.push(json!({
                "offset": i + 1,
                "itemTid": item.iptr.to_string(),
            }));
        }
    } else {
        for (i, posting) in posting_items(&page).iter().enumerate() {
            rows.push(json!({
                "offset": i + 1,
                "itemTid": posting.item().iptr.to_string(),
                "childBlock": posting.child(),
            }));
        }
    }
    Ok(rows)
}
