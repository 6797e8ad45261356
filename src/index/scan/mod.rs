//! Index scans: tuple at a time in order-by order, or a bitmap of every
//! matching row.

mod entry;
mod get;
mod key;
mod order;

use std::collections::BTreeMap;

use crate::datatype::Datum;
use crate::error::{RumError, RumResult};
use crate::tree::{ItemPointer, ScanDirection};

use super::RumIndex;
use get::ScanRun;

/// One condition or order-by expression of a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanKeyData {
    pub attnum: u16,
    pub strategy: u16,
    /// `None` stands for a null argument, which no row satisfies.
    pub argument: Option<Datum>,
}

impl ScanKeyData {
    pub fn new(attnum: u16, strategy: u16, argument: Datum) -> Self {
        Self {
            attnum,
            strategy,
            argument: Some(argument),
        }
    }

    pub fn null(attnum: u16, strategy: u16) -> Self {
        Self {
            attnum,
            strategy,
            argument: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub tid: ItemPointer,
    /// The row has to be checked against the conditions again.
    pub recheck: bool,
    /// The order-by values are lower bounds only.
    pub recheck_order_by: bool,
    pub order_by_values: Vec<Option<Datum>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Fast,
    Full,
    Regular,
    Ordered,
}

impl ScanType {
    pub fn name(self) -> &'static str {
        match self {
            ScanType::Fast => "fast",
            ScanType::Full => "full",
            ScanType::Regular => "regular",
            ScanType::Ordered => "ordered",
        }
    }
}

/// What a finished or running scan reports for EXPLAIN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExplainInfo {
    pub scan_type: Option<ScanType>,
    pub loops: u64,
}

/// Rows found by a bitmap scan, with their recheck flag.
pub type TidBitmap = BTreeMap<ItemPointer, bool>;

pub struct RumScan {
    index: RumIndex,
    keys: Vec<ScanKeyData>,
    orderbys: Vec<ScanKeyData>,
    run: Option<ScanRun>,
    explain: ExplainInfo,
}

impl RumIndex {
    pub fn begin_scan(&self, keys: Vec<ScanKeyData>, orderbys: Vec<ScanKeyData>) -> RumScan {
        RumScan {
            index: self.clone(),
            keys,
            orderbys,
            run: None,
            explain: ExplainInfo::default(),
        }
    }
}

impl RumScan {
    /// Restarts the scan, replacing the keys that are given.
    pub fn rescan(&mut self, keys: Option<Vec<ScanKeyData>>, orderbys: Option<Vec<ScanKeyData>>) {
        if let Some(keys) = keys {
            self.keys = keys;
        }
        if let Some(orderbys) = orderbys {
            self.orderbys = orderbys;
        }
        self.run = None;
    }

    pub fn get_tuple(&mut self, direction: ScanDirection) -> RumResult<Option<ScanResult>> {
        let RumIndex { rel, state } = &self.index;
        if self.run.is_none() {
            self.run = Some(ScanRun::start(rel, state, &self.keys, &self.orderbys, direction, false)?);
        }
        let Some(run) = self.run.as_mut() else {
            return Ok(None);
        };
        let result = run.next_tuple(rel, state)?;
        self.explain = ExplainInfo {
            scan_type: run.explain_type(),
            loops: run.loops,
        };
        Ok(result)
    }

    /// Adds every matching row to `bitmap` and returns how many rows were
    /// found. Stops early once `fuzzy_search_limit` rows were found when
    /// that limit is set.
    pub fn get_bitmap(&mut self, bitmap: &mut TidBitmap) -> RumResult<u64> {
        let RumIndex { rel, state } = &self.index;
        let mut run = ScanRun::start(rel, state, &self.keys, &[], ScanDirection::Forward, true)?;
        let limit = state.gucs.fuzzy_search_limit;
        let mut ntids = 0u64;
        while let Some(found) = run.next_item(rel, state)? {
            let recheck = bitmap.entry(found.item.iptr).or_insert(false);
            *recheck |= found.recheck;
            ntids += 1;
            if limit > 0 && ntids >= limit as u64 {
                log::debug!("bitmap scan stopped at the fuzzy search limit of {}", limit);
                break;
            }
        }
        self.explain = ExplainInfo {
            scan_type: run.explain_type(),
            loops: run.loops,
        };
        Ok(ntids)
    }

    pub fn explain(&self) -> ExplainInfo {
        self.explain
    }

    pub fn mark_pos(&mut self) -> RumResult<()> {
        Err(RumError::feature_not_supported("RUM does not support mark/restore"))
    }

    pub fn restore_pos(&mut self) -> RumResult<()> {
        Err(RumError::feature_not_supported("RUM does not support mark/restore"))
    }

    pub fn end_scan(self) -> ExplainInfo {
        self.explain
    }
}
