//! Operator classes: the per-column capability table the index calls into
//! for key extraction, comparison, consistency checks and ordering.
//!
//! A missing optional slot disables the matching feature: no
//! `compare_partial` means no partial matches, no `ordering` means the
//! column cannot serve order-by keys.

mod bson;
mod int8;
mod text;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

pub use bson::{
    bson_term_ops, BSON_EQUAL, BSON_EXISTS, BSON_GREATER, BSON_GREATER_EQUAL, BSON_LESS,
    BSON_LESS_EQUAL, BSON_ORDER_BY,
};
pub use int8::{
    int8_distance, int8_ops, INT8_DISTANCE, INT8_EQUAL, INT8_GREATER, INT8_GREATER_EQUAL,
    INT8_LEFT_DISTANCE, INT8_LESS, INT8_LESS_EQUAL, INT8_RIGHT_DISTANCE,
};
pub use text::{text_ops, TEXT_AND, TEXT_OR, TEXT_POSITION};

use crate::datatype::{datum_cmp, Datum, TypeInfo};
use crate::error::RumResult;
use crate::tree::{NullCategory, ScanDirection};

/// One key produced from an indexed value. `key: None` is a null key.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedValue {
    pub key: Option<Datum>,
    pub add_info: Option<Datum>,
}

impl ExtractedValue {
    pub fn key(key: Datum) -> Self {
        Self {
            key: Some(key),
            add_info: None,
        }
    }
}

/// One entry of an extracted query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEntry {
    pub key: Option<Datum>,
    pub partial_match: bool,
    pub extra_data: Option<Datum>,
}

impl QueryEntry {
    pub fn exact(key: Datum) -> Self {
        Self {
            key: Some(key),
            partial_match: false,
            extra_data: None,
        }
    }

    pub fn partial(key: Datum, extra_data: Option<Datum>) -> Self {
        Self {
            key: Some(key),
            partial_match: true,
            extra_data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedQuery {
    pub entries: Vec<QueryEntry>,
    /// Raw search mode as reported by the operator class; see [`SearchMode::from_raw`].
    pub search_mode: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    Default,
    IncludeEmpty,
    All,
    /// Internal: scan every entry of the column.
    Everything,
}

impl SearchMode {
    /// Any mode above 2, and any negative one, searches as `All`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => SearchMode::Default,
            1 => SearchMode::IncludeEmpty,
            _ => SearchMode::All,
        }
    }

    /// Category of the hidden entry a non-default mode adds to a key.
    pub fn hidden_category(self) -> Option<NullCategory> {
        match self {
            SearchMode::Default => None,
            SearchMode::IncludeEmpty => Some(NullCategory::EmptyItem),
            SearchMode::All | SearchMode::Everything => Some(NullCategory::EmptyQuery),
        }
    }
}

/// Arguments of `consistent`, `pre_consistent` and AddInfo ordering.
#[derive(Debug, Clone, Copy)]
pub struct ConsistentArgs<'a> {
    /// Which query entries the current item carries.
    pub check: &'a [bool],
    pub strategy: u16,
    pub query: &'a Datum,
    pub nentries: usize,
    pub extra_data: &'a [Option<Datum>],
    pub query_keys: &'a [Option<Datum>],
    pub categories: &'a [NullCategory],
    /// AddInfo of the current item per entry, when it carries the entry.
    pub add_info: &'a [Option<Datum>],
}

pub type CompareFn = Arc<dyn Fn(&Datum, &Datum) -> RumResult<Ordering> + Send + Sync>;
pub type ExtractValueFn = Arc<dyn Fn(&Datum) -> RumResult<Vec<ExtractedValue>> + Send + Sync>;
/// `(query, strategy, search mode hint)`; the hint is `All` when the scan
/// will be ordered by raw keys.
pub type ExtractQueryFn =
    Arc<dyn Fn(&Datum, u16, i32) -> RumResult<ExtractedQuery> + Send + Sync>;
pub type ConsistentFn =
    Arc<dyn Fn(&ConsistentArgs<'_>, &mut bool) -> RumResult<bool> + Send + Sync>;
pub type PreConsistentFn = Arc<dyn Fn(&ConsistentArgs<'_>) -> RumResult<bool> + Send + Sync>;
/// `(partial key, index key, strategy, extra data)`: 0 matches, a negative
/// value skips the key, a positive value ends the partial match.
pub type ComparePartialFn =
    Arc<dyn Fn(&Datum, &Datum, u16, Option<&Datum>) -> RumResult<i32> + Send + Sync>;
pub type JoinAddInfoFn = Arc<dyn Fn(&Datum, &Datum) -> Datum + Send + Sync>;

/// Ordering support procedure, by arity.
#[derive(Clone)]
pub enum OrderingFn {
    /// `(key or AddInfo, query, strategy) -> distance`.
    Distance(Arc<dyn Fn(&Datum, &Datum, u16) -> f64 + Send + Sync>),
    /// `(key, query, strategy) -> projected key`; drives ordered raw key scans.
    RawKey(Arc<dyn Fn(&Datum, &Datum, u16) -> Datum + Send + Sync>),
    /// Full consistent-style arguments with AddInfo.
    AddInfo(Arc<dyn Fn(&ConsistentArgs<'_>) -> f64 + Send + Sync>),
}

impl OrderingFn {
    pub fn nargs(&self) -> usize {
        match self {
            OrderingFn::Distance(_) => 3,
            OrderingFn::RawKey(_) => 4,
            OrderingFn::AddInfo(_) => 10,
        }
    }
}

impl fmt::Debug for OrderingFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderingFn({})", self.nargs())
    }
}

/// What `config` reports for a column.
#[derive(Debug, Clone, Default)]
pub struct RumConfig {
    pub add_info_type: Option<TypeInfo>,
    /// Scan direction implied by an ordering strategy over AddInfo.
    pub strategy_info: Vec<(u16, ScanDirection)>,
}

impl RumConfig {
    pub fn direction(&self, strategy: u16) -> ScanDirection {
        self.strategy_info
            .iter()
            .find(|(s, _)| *s == strategy)
            .map(|(_, direction)| *direction)
            .unwrap_or(ScanDirection::NoMovement)
    }
}

#[derive(Clone)]
pub struct RumOpClass {
    pub name: &'static str,
    pub key_type: TypeInfo,
    pub compare: Option<CompareFn>,
    pub extract_value: ExtractValueFn,
    pub extract_query: ExtractQueryFn,
    pub consistent: ConsistentFn,
    pub compare_partial: Option<ComparePartialFn>,
    pub pre_consistent: Option<PreConsistentFn>,
    pub ordering: Option<OrderingFn>,
    pub outer_ordering: Option<OrderingFn>,
    pub join_add_info: Option<JoinAddInfoFn>,
    pub config: Option<RumConfig>,
}

impl fmt::Debug for RumOpClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RumOpClass")
            .field("name", &self.name)
            .field("key_type", &self.key_type)
            .field("can_partial_match", &self.can_partial_match())
            .field("can_ordering", &self.can_ordering())
            .field("can_pre_consistent", &self.can_pre_consistent())
            .finish()
    }
}

impl RumOpClass {
    pub fn compare(&self, a: &Datum, b: &Datum) -> RumResult<Ordering> {
        match &self.compare {
            Some(compare) => compare(a, b),
            None => Ok(datum_cmp(a, b)),
        }
    }

    pub fn can_partial_match(&self) -> bool {
        self.compare_partial.is_some()
    }

    pub fn can_ordering(&self) -> bool {
        self.ordering.is_some()
    }

    pub fn can_outer_ordering(&self) -> bool {
        self.outer_ordering.is_some()
    }

    pub fn can_join_add_info(&self) -> bool {
        self.join_add_info.is_some()
    }

    pub fn can_pre_consistent(&self) -> bool {
        self.pre_consistent.is_some()
    }

    pub fn ordering_nargs(&self) -> usize {
        self.ordering.as_ref().map_or(0, OrderingFn::nargs)
    }

    pub fn add_info_type(&self) -> Option<TypeInfo> {
        self.config.as_ref().and_then(|config| config.add_info_type)
    }

    pub fn direction(&self, strategy: u16) -> ScanDirection {
        self.config
            .as_ref()
            .map_or(ScanDirection::NoMovement, |config| config.direction(strategy))
    }
}
