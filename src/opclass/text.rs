use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    ConsistentArgs, ExtractedQuery, ExtractedValue, OrderingFn, QueryEntry, RumConfig, RumOpClass,
};
use crate::datatype::{Datum, TypeInfo};
use crate::error::{RumError, RumResult};

/// Every query word must be present.
pub const TEXT_AND: u16 = 1;
/// Any query word is enough.
pub const TEXT_OR: u16 = 2;
/// Order by the position of the earliest matched word.
pub const TEXT_POSITION: u16 = 20;

fn words(datum: &Datum) -> RumResult<Vec<String>> {
    let bytes = datum
        .as_bytes()
        .ok_or_else(|| RumError::bad_value(format!("expected text, got {:?}", datum)))?;
    Ok(String::from_utf8_lossy(bytes)
        .split_whitespace()
        .map(str::to_lowercase)
        .collect())
}

/// One key per distinct word, carrying the position of its first
/// occurrence as AddInfo.
fn extract_value(value: &Datum) -> RumResult<Vec<ExtractedValue>> {
    let mut first = BTreeMap::new();
    for (pos, word) in words(value)?.into_iter().enumerate() {
        first.entry(word).or_insert(pos as i64 + 1);
    }
    Ok(first
        .into_iter()
        .map(|(word, pos)| ExtractedValue {
            key: Some(Datum::text(&word)),
            add_info: Some(Datum::Int(pos)),
        })
        .collect())
}

fn extract_query(query: &Datum, strategy: u16, search_mode: i32) -> RumResult<ExtractedQuery> {
    if !matches!(strategy, TEXT_AND | TEXT_OR | TEXT_POSITION) {
        return Err(RumError::bad_value(format!(
            "unrecognized strategy number: {}",
            strategy
        )));
    }
    let mut entries: Vec<QueryEntry> = Vec::new();
    for word in words(query)? {
        let entry = match word.strip_suffix('*') {
            Some(prefix) if !prefix.is_empty() => QueryEntry::partial(Datum::text(prefix), None),
            _ => QueryEntry::exact(Datum::text(&word)),
        };
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }
    Ok(ExtractedQuery {
        entries,
        search_mode,
    })
}

fn matches(args: &ConsistentArgs<'_>) -> bool {
    let check = &args.check[..args.nentries.min(args.check.len())];
    match args.strategy {
        TEXT_AND => !check.is_empty() && check.iter().all(|&c| c),
        _ => check.iter().any(|&c| c),
    }
}

fn consistent(args: &ConsistentArgs<'_>, recheck: &mut bool) -> RumResult<bool> {
    *recheck = false;
    Ok(matches(args))
}

fn compare_partial(
    partial: &Datum,
    key: &Datum,
    _strategy: u16,
    _extra: Option<&Datum>,
) -> RumResult<i32> {
    let (Some(prefix), Some(key)) = (partial.as_bytes(), key.as_bytes()) else {
        return Err(RumError::bad_value("prefix match over non-text keys"));
    };
    Ok(if key.starts_with(prefix) {
        0
    } else if key > prefix {
        1
    } else {
        -1
    })
}

fn position_distance(args: &ConsistentArgs<'_>) -> f64 {
    args.add_info
        .iter()
        .zip(args.check)
        .filter(|(_, &c)| c)
        .filter_map(|(add_info, _)| add_info.as_ref().and_then(Datum::as_int))
        .min()
        .map_or(f64::INFINITY, |pos| pos as f64)
}

fn join_add_info(a: &Datum, b: &Datum) -> Datum {
    match (a.as_int(), b.as_int()) {
        (Some(a), Some(b)) => Datum::Int(a.min(b)),
        _ => a.clone(),
    }
}

/// Lowercased words with `word*` prefix queries. Postings carry the first
/// position of the word, which the position ordering uses.
pub fn text_ops() -> RumOpClass {
    RumOpClass {
        name: "text_ops",
        key_type: TypeInfo::Varlena,
        compare: None,
        extract_value: Arc::new(extract_value),
        extract_query: Arc::new(extract_query),
        consistent: Arc::new(consistent),
        compare_partial: Some(Arc::new(compare_partial)),
        pre_consistent: Some(Arc::new(|args| Ok(matches(args)))),
        ordering: Some(OrderingFn::AddInfo(Arc::new(position_distance))),
        outer_ordering: None,
        join_add_info: Some(Arc::new(join_add_info)),
        config: Some(RumConfig {
            add_info_type: Some(TypeInfo::Int(4)),
            strategy_info: Vec::new(),
        }),
    }
}
