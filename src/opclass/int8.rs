use std::sync::Arc;

use super::{
    ConsistentArgs, ExtractedQuery, ExtractedValue, OrderingFn, QueryEntry, RumConfig, RumOpClass,
};
use crate::datatype::{Datum, TypeInfo};
use crate::error::{RumError, RumResult};
use crate::tree::ScanDirection;

pub const INT8_LESS: u16 = 1;
pub const INT8_LESS_EQUAL: u16 = 2;
pub const INT8_EQUAL: u16 = 3;
pub const INT8_GREATER_EQUAL: u16 = 4;
pub const INT8_GREATER: u16 = 5;
pub const INT8_DISTANCE: u16 = 20;
pub const INT8_LEFT_DISTANCE: u16 = 21;
pub const INT8_RIGHT_DISTANCE: u16 = 22;

fn int(datum: &Datum) -> RumResult<i64> {
    datum
        .as_int()
        .ok_or_else(|| RumError::bad_value(format!("expected a bigint, got {:?}", datum)))
}

fn extract_value(value: &Datum) -> RumResult<Vec<ExtractedValue>> {
    Ok(vec![ExtractedValue::key(Datum::Int(int(value)?))])
}

fn extract_query(query: &Datum, strategy: u16, search_mode: i32) -> RumResult<ExtractedQuery> {
    let value = int(query)?;
    let entry = match strategy {
        INT8_LESS | INT8_LESS_EQUAL => {
            QueryEntry::partial(Datum::Int(i64::MIN), Some(Datum::Int(value)))
        }
        INT8_GREATER_EQUAL | INT8_GREATER => QueryEntry::partial(Datum::Int(value), None),
        INT8_EQUAL | INT8_DISTANCE | INT8_LEFT_DISTANCE | INT8_RIGHT_DISTANCE => {
            QueryEntry::exact(Datum::Int(value))
        }
        _ => {
            return Err(RumError::bad_value(format!(
                "unrecognized strategy number: {}",
                strategy
            )))
        }
    };
    Ok(ExtractedQuery {
        entries: vec![entry],
        search_mode,
    })
}

/// Bounds a partial match started at the lower end of the range.
fn compare_partial(
    partial: &Datum,
    key: &Datum,
    strategy: u16,
    extra: Option<&Datum>,
) -> RumResult<i32> {
    let key = int(key)?;
    let bound = match strategy {
        INT8_LESS | INT8_LESS_EQUAL => int(extra.unwrap_or(partial))?,
        _ => int(partial)?,
    };
    let cmp = bound.cmp(&key) as i32;
    Ok(match strategy {
        INT8_LESS => i32::from(cmp <= 0),
        INT8_LESS_EQUAL => i32::from(cmp < 0),
        INT8_EQUAL => i32::from(cmp != 0),
        INT8_GREATER_EQUAL => i32::from(cmp > 0),
        INT8_GREATER => match cmp {
            c if c < 0 => 0,
            0 => -1,
            _ => 1,
        },
        _ => {
            return Err(RumError::bad_value(format!(
                "unrecognized strategy number: {}",
                strategy
            )))
        }
    })
}

fn consistent(args: &ConsistentArgs<'_>, recheck: &mut bool) -> RumResult<bool> {
    *recheck = false;
    Ok(args.check.iter().take(args.nentries.max(1)).any(|&c| c))
}

/// Distance between a key and the query; one sided strategies are
/// infinite on the wrong side.
pub fn int8_distance(key: &Datum, query: &Datum, strategy: u16) -> f64 {
    let (Some(key), Some(query)) = (key.as_int(), query.as_int()) else {
        return f64::INFINITY;
    };
    let diff = (key as f64) - (query as f64);
    match strategy {
        INT8_LEFT_DISTANCE if key <= query => -diff,
        INT8_RIGHT_DISTANCE if key >= query => diff,
        INT8_LEFT_DISTANCE | INT8_RIGHT_DISTANCE => f64::INFINITY,
        _ => diff.abs(),
    }
}

/// `bigint` keys with range partial matches and distance ordering. Used as
/// the attach column, its values order the postings of the target column:
/// `<=|` walks them backward and `|=>` forward.
pub fn int8_ops() -> RumOpClass {
    RumOpClass {
        name: "int8_ops",
        key_type: TypeInfo::Int(8),
        compare: None,
        extract_value: Arc::new(extract_value),
        extract_query: Arc::new(extract_query),
        consistent: Arc::new(consistent),
        compare_partial: Some(Arc::new(compare_partial)),
        pre_consistent: None,
        ordering: Some(OrderingFn::Distance(Arc::new(int8_distance))),
        outer_ordering: Some(OrderingFn::Distance(Arc::new(int8_distance))),
        join_add_info: None,
        config: Some(RumConfig {
            add_info_type: None,
            strategy_info: vec![
                (INT8_LEFT_DISTANCE, ScanDirection::Backward),
                (INT8_RIGHT_DISTANCE, ScanDirection::Forward),
            ],
        }),
    }
}
