use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::datatype::{datum_cmp, Datum};
use crate::error::{RumError, RumResult};
use crate::opclass::OrderingFn;
use crate::page::Relation;
use crate::tree::{NullCategory, RumItem, ScanDirection};

use super::super::state::RumState;
use super::entry::{ItemOrder, ScanCtx, ScanEntry};
use super::key::{call_add_info_consistent, call_consistent, ScanKey, ScanPlan};
use super::order::OrderedScan;
use super::{ScanKeyData, ScanResult, ScanType};

/// A matching row before order values are attached.
#[derive(Debug, Clone, Copy)]
pub(super) struct FoundItem {
    pub item: RumItem,
    pub recheck: bool,
    pub recheck_order_by: bool,
}

enum FetchMode {
    Void,
    /// Rows come out of the merge in final order.
    Simple,
    /// Rows come out in order-by order, one pass per direction.
    Natural { second_pass: bool },
    /// Everything was collected and sorted by order values up front.
    Sorted(VecDeque<ScanResult>),
}

/// State of one execution of a scan, from the first fetch to the end or
/// the next rescan.
pub(super) struct ScanRun {
    conditions: Vec<ScanKeyData>,
    orderbys: Vec<ScanKeyData>,
    plan: ScanPlan,
    scan_type: Option<ScanType>,
    mode: FetchMode,
    /// Entry indexes by descending current item, for the fast scan.
    sorted: Vec<usize>,
    incr_index: Option<usize>,
    last: Option<RumItem>,
    ordered: Option<OrderedScan>,
    direction: ScanDirection,
    pub loops: u64,
}

fn cmp_entries(order: &ItemOrder, a: &ScanEntry, b: &ScanEntry) -> Ordering {
    match (a.finished, b.finished) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => order.cmp(&a.cur, &b.cur),
    }
}

/// `None` sorts after every value.
fn cmp_order_values(a: &[Option<Datum>], b: &[Option<Datum>]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = match (x, y) {
            (Some(x), Some(y)) => datum_cmp(x, y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

impl ScanRun {
    pub fn start(
        rel: &Relation,
        state: &RumState,
        conditions: &[ScanKeyData],
        orderbys: &[ScanKeyData],
        direction: ScanDirection,
        bitmap: bool,
    ) -> RumResult<Self> {
        let plan = ScanPlan::new(state, conditions, orderbys, false)?;
        let direction = if direction == ScanDirection::NoMovement {
            ScanDirection::Forward
        } else {
            direction
        };
        let mut run = Self {
            conditions: conditions.to_vec(),
            orderbys: orderbys.to_vec(),
            plan,
            scan_type: None,
            mode: FetchMode::Void,
            sorted: Vec::new(),
            incr_index: None,
            last: None,
            ordered: None,
            direction,
            loops: 0,
        };
        if run.plan.is_void {
            return Ok(run);
        }
        run.start_scan(rel, state)?;
        if bitmap || run.plan.is_void {
            run.mode = if run.plan.is_void {
                FetchMode::Void
            } else {
                FetchMode::Simple
            };
            return Ok(run);
        }

        let scan_type = run.scan_type();
        run.mode = if (state.gucs.allow_order_by_raw_keys && scan_type == ScanType::Ordered)
            || (run.plan.norderbys == 0 && scan_type != ScanType::Full && !state.alternative_order)
        {
            FetchMode::Simple
        } else if matches!(
            run.plan.natural,
            Some(ScanDirection::Forward | ScanDirection::Backward)
        ) {
            FetchMode::Natural { second_pass: false }
        } else {
            FetchMode::Sorted(run.collect_sorted(rel, state)?)
        };
        Ok(run)
    }

    pub fn scan_type(&self) -> ScanType {
        self.scan_type.unwrap_or(ScanType::Regular)
    }

    pub fn explain_type(&self) -> Option<ScanType> {
        self.scan_type
    }

    /// Whether every key can be served by walking the entry tree in key
    /// order.
    fn supports_ordered_scan(&self, state: &RumState) -> bool {
        let keys = &self.plan.keys;
        let Some(first) = keys.first() else {
            return false;
        };
        keys.iter().all(|key| {
            let opclass = state.opclass(key.attnum);
            key.attnum == first.attnum
                && opclass.can_partial_match()
                && opclass.can_ordering()
                && opclass.ordering_nargs() == 4
        })
    }

    fn start_scan(&mut self, rel: &Relation, state: &RumState) -> RumResult<()> {
        let gucs = &state.gucs;
        let supported = self.supports_ordered_scan(state);
        let raw_order = self.plan.keys.iter().any(|k| {
            k.order_by && !k.use_add_to_column && state.opclass(k.attnum).ordering_nargs() == 4
        });
        let single_partial = self.plan.entries.len() == 1 && self.plan.entries[0].def.partial;

        let mut scan_type = ScanType::Fast;
        if supported
            && (gucs.force_ordered_index_scan
                || (gucs.allow_order_by_raw_keys
                    && self.plan.norderbys > 0
                    && raw_order
                    && !state.alternative_order)
                || (gucs.prefer_ordered_index_scan && single_partial))
        {
            scan_type = ScanType::Ordered;
            match OrderedScan::start(rel, state, &mut self.plan, self.direction)? {
                Some(ordered) => self.ordered = Some(ordered),
                None => self.plan.is_void = true,
            }
        } else {
            let ctx = ScanCtx {
                rel,
                state,
                order: self.plan.order,
            };
            for entry in self.plan.entries.iter_mut() {
                rel.check_for_interrupts()?;
                entry.start(&ctx)?;
            }
        }

        for (i, key) in self.plan.keys.iter().enumerate() {
            if i == 0
                && scan_type == ScanType::Fast
                && key.is_everything()
                && self.plan.keys.len() > 1
            {
                scan_type = ScanType::Full;
            } else if scan_type == ScanType::Fast && !state.opclass(key.attnum).can_pre_consistent() {
                scan_type = ScanType::Regular;
            }
        }
        if scan_type == ScanType::Fast
            && (gucs.disable_fast_scan || self.plan.entries.iter().any(|e| e.def.partial))
        {
            scan_type = ScanType::Regular;
        }

        self.last = None;
        self.incr_index = None;
        if scan_type == ScanType::Fast {
            let ctx = ScanCtx {
                rel,
                state,
                order: self.plan.order,
            };
            for entry in self.plan.entries.iter_mut() {
                entry.next(&ctx)?;
            }
            let order = self.plan.order;
            let entries = &self.plan.entries;
            let mut sorted: Vec<usize> = (0..entries.len()).collect();
            sorted.sort_by(|&a, &b| cmp_entries(&order, &entries[b], &entries[a]));
            self.sorted = sorted;
        }
        log::debug!(
            "rum scan uses {} scan over {} keys and {} entries",
            scan_type.name(),
            self.plan.keys.len(),
            self.plan.entries.len()
        );
        self.scan_type = Some(scan_type);
        Ok(())
    }

    /// Next row of the merge, in the order the scan type produces them.
    pub fn next_item(&mut self, rel: &Relation, state: &RumState) -> RumResult<Option<FoundItem>> {
        if self.plan.is_void {
            return Ok(None);
        }
        rel.check_for_interrupts()?;
        let found = match self.scan_type() {
            ScanType::Fast => self.get_item_fast(rel, state)?,
            ScanType::Full => self.get_item_full(rel, state)?,
            ScanType::Ordered => match self.ordered.as_mut() {
                Some(ordered) => {
                    let found = ordered.next(rel, state, &mut self.plan)?;
                    self.loops = ordered.loops;
                    found
                }
                None => None,
            },
            ScanType::Regular => self.get_item_regular(rel, state)?,
        };
        if let Some(found) = &found {
            self.last = Some(found.item);
        }
        Ok(found)
    }

    /// Next row with its order values, as handed to the caller.
    pub fn next_tuple(&mut self, rel: &Relation, state: &RumState) -> RumResult<Option<ScanResult>> {
        loop {
            let second_pass = match &mut self.mode {
                FetchMode::Void => return Ok(None),
                FetchMode::Sorted(queue) => return Ok(queue.pop_front()),
                FetchMode::Simple => None,
                FetchMode::Natural { second_pass } => Some(*second_pass),
            };
            if let Some(found) = self.next_item(rel, state)? {
                let values = self.order_values(state, &found.item)?;
                return Ok(Some(ScanResult {
                    tid: found.item.iptr,
                    recheck: found.recheck,
                    recheck_order_by: found.recheck_order_by,
                    order_by_values: values,
                }));
            }
            match second_pass {
                Some(false) => self.reverse(rel, state)?,
                _ => return Ok(None),
            }
        }
    }

    /// Restarts the scan from the mark in the other direction.
    fn reverse(&mut self, rel: &Relation, state: &RumState) -> RumResult<()> {
        let loops = self.loops;
        self.plan = ScanPlan::new(state, &self.conditions, &self.orderbys, true)?;
        self.ordered = None;
        if !self.plan.is_void {
            self.start_scan(rel, state)?;
        }
        self.loops += loops;
        self.mode = FetchMode::Natural { second_pass: true };
        log::debug!("rum scan continues in the opposite direction from the mark");
        Ok(())
    }

    fn collect_sorted(&mut self, rel: &Relation, state: &RumState) -> RumResult<VecDeque<ScanResult>> {
        let mut results = Vec::new();
        while let Some(found) = self.next_item(rel, state)? {
            let values = self.order_values(state, &found.item)?;
            results.push(ScanResult {
                tid: found.item.iptr,
                recheck: found.recheck,
                recheck_order_by: false,
                order_by_values: values,
            });
        }
        results.sort_by(|a, b| {
            cmp_order_values(&a.order_by_values, &b.order_by_values).then(a.tid.cmp(&b.tid))
        });
        let mut out: VecDeque<ScanResult> = VecDeque::with_capacity(results.len());
        for result in results {
            if out.back().is_some_and(|last| last.tid == result.tid) {
                continue;
            }
            out.push_back(result);
        }
        log::debug!("rum scan sorted {} rows by order values", out.len());
        Ok(out)
    }

    /// Current min item of `key` and the consistency of the key there.
    fn key_get_item(state: &RumState, key: &mut ScanKey, entries: &[ScanEntry], order: &ItemOrder, needs_outer: bool) -> RumResult<()> {
        let mut min: Option<RumItem> = None;
        for &e in &key.entries {
            let entry = &entries[e];
            if entry.finished {
                continue;
            }
            if min.is_none_or(|m| order.cmp(&entry.cur, &m) == Ordering::Less) {
                min = Some(entry.cur);
            }
        }
        let Some(min) = min else {
            key.finished = true;
            return Ok(());
        };
        if key.cur_item.iptr == min.iptr {
            return Ok(());
        }
        key.cur_item = min;
        for (i, &e) in key.entries.iter().enumerate() {
            let entry = &entries[e];
            if !entry.finished && entry.cur.iptr == min.iptr {
                key.entry_res[i] = true;
                key.add_info[i] = state.add_info_datum(entry.def.attnum, &entry.cur);
            } else {
                key.entry_res[i] = false;
                key.add_info[i] = None;
            }
        }
        key.cur_item_matches = call_consistent(state, key, needs_outer)?;
        Ok(())
    }

    fn get_item_regular(&mut self, rel: &Relation, state: &RumState) -> RumResult<Option<FoundItem>> {
        let ctx = ScanCtx {
            rel,
            state,
            order: self.plan.order,
        };
        let order = self.plan.order;
        let needs_outer = self.plan.needs_outer;
        let find_item = state.gucs.enable_entry_find_item_on_scan;
        let ScanPlan { keys, entries, .. } = &mut self.plan;

        let mut advance_past = self.last;
        let mut intermediate: Option<RumItem> = None;
        let item = loop {
            let mut all_finished = true;
            for entry in entries.iter_mut() {
                loop {
                    if entry.finished {
                        break;
                    }
                    let not_past = advance_past.is_none_or(|p| order.cmp(&entry.cur, &p) != Ordering::Greater);
                    let behind = intermediate.is_some_and(|p| order.cmp(&entry.cur, &p) == Ordering::Less);
                    if !not_past && !behind {
                        break;
                    }
                    match intermediate {
                        Some(target) if behind && !entry.def.partial && find_item => {
                            entry.skip_to(&ctx, &target)?;
                        }
                        _ => entry.next(&ctx)?,
                    }
                    if advance_past.is_none() {
                        break;
                    }
                }
                if !entry.finished {
                    all_finished = false;
                }
            }
            if all_finished {
                return Ok(None);
            }

            let mut item: Option<RumItem> = None;
            let mut highest: Option<RumItem> = None;
            for key in keys.iter_mut().filter(|k| !k.order_by) {
                Self::key_get_item(state, key, entries, &order, needs_outer)?;
                if key.finished {
                    return Ok(None);
                }
                if item.is_none_or(|i| order.cmp(&key.cur_item, &i) == Ordering::Less) {
                    item = Some(key.cur_item);
                }
                if highest.is_none_or(|h| order.cmp(&key.cur_item, &h) == Ordering::Greater) {
                    highest = Some(key.cur_item);
                }
            }
            let Some(item) = item else {
                return Ok(None);
            };
            let matched = keys
                .iter()
                .filter(|k| !k.order_by)
                .all(|k| k.cur_item_matches && k.cur_item.iptr == item.iptr);
            if matched {
                break item;
            }
            advance_past = Some(item);
            intermediate = highest;
            self.loops += 1;
            rel.check_for_interrupts()?;
        };

        let mut recheck = false;
        for key in keys.iter() {
            if key.order_by {
                for &e in &key.entries {
                    let entry = &mut entries[e];
                    while !entry.finished && order.cmp(&entry.cur, &item) == Ordering::Less {
                        entry.next(&ctx)?;
                    }
                }
            } else if key.recheck_cur_item {
                recheck = true;
            }
        }
        self.loops += 1;
        Ok(Some(FoundItem {
            item,
            recheck,
            recheck_order_by: false,
        }))
    }

    /// Advances the entry with the fewest predicted items among
    /// `sorted[i..]`, to `sorted[i - 1]` when `find`, and restores the
    /// descending order.
    fn entry_shift(&mut self, ctx: &ScanCtx<'_>, i: usize, find: bool) -> RumResult<()> {
        let entries = &mut self.plan.entries;
        let sorted = &mut self.sorted;
        let mut min_index = i;
        for j in i..sorted.len() {
            if entries[sorted[j]].predict() < entries[sorted[min_index]].predict() {
                min_index = j;
            }
        }
        if min_index >= sorted.len() {
            return Ok(());
        }
        if find && i > 0 {
            let target = entries[sorted[i - 1]].cur;
            entries[sorted[min_index]].skip_to(ctx, &target)?;
        } else {
            entries[sorted[min_index]].next(ctx)?;
        }
        while min_index > 0
            && cmp_entries(&ctx.order, &entries[sorted[min_index]], &entries[sorted[min_index - 1]])
                == Ordering::Greater
        {
            sorted.swap(min_index, min_index - 1);
            min_index -= 1;
        }
        Ok(())
    }

    fn pre_consistent_check(&mut self, state: &RumState) -> RumResult<bool> {
        let ScanPlan { keys, entries, .. } = &mut self.plan;
        for key in keys.iter_mut() {
            if key.order_by || key.is_everything() {
                continue;
            }
            let opclass = state.opclass(key.attnum);
            let Some(pre_consistent) = opclass.pre_consistent.as_ref() else {
                continue;
            };
            let mut has_false = false;
            for (i, &e) in key.entries.iter().enumerate() {
                key.entry_res[i] = entries[e].pre_value;
                has_false |= !entries[e].pre_value;
            }
            if !has_false {
                continue;
            }
            let Some(query) = key.query.as_ref() else {
                continue;
            };
            if !pre_consistent(&key.args(query, &key.entry_res))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn get_item_fast(&mut self, rel: &Relation, state: &RumState) -> RumResult<Option<FoundItem>> {
        let ctx = ScanCtx {
            rel,
            state,
            order: self.plan.order,
        };
        let n = self.sorted.len();
        if n == 0 {
            return Ok(None);
        }
        if let Some(k) = self.incr_index {
            for j in k..n {
                self.entry_shift(&ctx, j, false)?;
            }
        }
        let needs_outer = self.plan.needs_outer;
        loop {
            self.loops += 1;
            rel.check_for_interrupts()?;
            for entry in self.plan.entries.iter_mut() {
                entry.pre_value = true;
            }
            let mut pre_ok = true;
            let (mut j, mut k) = (0, 0);
            let mut i = 1;
            while i < n {
                let (cur, prev) = (&self.plan.entries[self.sorted[i]], &self.plan.entries[self.sorted[i - 1]]);
                if cmp_entries(&ctx.order, cur, prev) == Ordering::Less {
                    k = i;
                    while j < i {
                        let e = self.sorted[j];
                        self.plan.entries[e].pre_value = false;
                        j += 1;
                    }
                    if !self.pre_consistent_check(state)? {
                        pre_ok = false;
                        break;
                    }
                }
                i += 1;
            }
            if self.plan.entries[self.sorted[i - 1]].finished {
                return Ok(None);
            }
            if !pre_ok {
                self.entry_shift(&ctx, i, true)?;
                continue;
            }

            let min = self.plan.entries[self.sorted[n - 1]].cur;
            let mut consistent = true;
            {
                let ScanPlan { keys, entries, .. } = &mut self.plan;
                for key in keys.iter_mut().filter(|k| !k.order_by) {
                    for (x, &e) in key.entries.iter().enumerate() {
                        let entry = &entries[e];
                        if !entry.finished && entry.cur.iptr == min.iptr {
                            key.entry_res[x] = true;
                            key.add_info[x] = state.add_info_datum(entry.def.attnum, &entry.cur);
                        } else {
                            key.entry_res[x] = false;
                            key.add_info[x] = None;
                        }
                    }
                    if !call_consistent(state, key, needs_outer)? {
                        consistent = false;
                        break;
                    }
                }
            }
            if !consistent {
                for x in k..n {
                    self.entry_shift(&ctx, x, false)?;
                }
                continue;
            }
            let recheck = self
                .plan
                .keys
                .iter()
                .any(|key| !key.order_by && key.recheck_cur_item);
            self.incr_index = Some(k);
            return Ok(Some(FoundItem {
                item: min,
                recheck,
                recheck_order_by: false,
            }));
        }
    }

    /// Walks every row of the first column; the other keys only rank.
    fn get_item_full(&mut self, rel: &Relation, state: &RumState) -> RumResult<Option<FoundItem>> {
        let ctx = ScanCtx {
            rel,
            state,
            order: self.plan.order,
        };
        let needs_outer = self.plan.needs_outer;
        let ScanPlan { keys, entries, .. } = &mut self.plan;
        let Some(&first) = keys.first().and_then(|k| k.entries.first()) else {
            return Ok(None);
        };
        let key = &mut keys[0];
        let (head, rest) = entries.split_at_mut(first + 1);
        let entry = &mut head[first];
        if entry.finished {
            return Ok(None);
        }
        entry.next(&ctx)?;
        if entry.finished {
            return Ok(None);
        }
        let current = entry.cur;
        key.entry_res[0] = true;
        key.add_info[0] = state.add_info_datum(entry.def.attnum, &current);
        call_add_info_consistent(state, key, needs_outer)?;

        let others = head[..first].iter_mut().chain(rest.iter_mut());
        for other in others {
            while !other.finished
                && (!other.cur.iptr.is_valid() || ctx.order.cmp(&other.cur, &current) == Ordering::Less)
            {
                other.next(&ctx)?;
            }
        }
        self.loops += 1;
        Ok(Some(FoundItem {
            item: current,
            recheck: false,
            recheck_order_by: false,
        }))
    }

    /// Order-by values of `item`, one per order-by expression.
    fn order_values(&mut self, state: &RumState, item: &RumItem) -> RumResult<Vec<Option<Datum>>> {
        if self.plan.norderbys == 0 {
            return Ok(Vec::new());
        }
        if let Some(ordered) = self.ordered.as_ref() {
            return ordered.order_values(state, &self.plan);
        }
        let ScanPlan { keys, entries, .. } = &mut self.plan;

        let outer = keys
            .iter()
            .find(|k| !k.order_by && state.add_to_column == Some(k.attnum) && k.outer_add_info.is_some())
            .and_then(|k| k.outer_add_info.clone());
        for key in keys.iter_mut() {
            if key.use_add_to_column {
                key.outer_add_info = outer.clone();
            } else if key.use_cur_key {
                key.cur_key = key.cur_key_entry.and_then(|e| entries[e].cur_key.clone());
            }
        }

        let mut values = Vec::with_capacity(self.plan.norderbys);
        let ScanPlan { keys, entries, .. } = &mut self.plan;
        for key in keys.iter_mut().filter(|k| k.order_by) {
            values.push(key_get_ordering(state, key, entries, item)?);
        }
        Ok(values)
    }
}

fn key_get_ordering(
    state: &RumState,
    key: &mut ScanKey,
    entries: &[ScanEntry],
    item: &RumItem,
) -> RumResult<Option<Datum>> {
    if key.use_add_to_column {
        let Some(Some(query_key)) = key.query_keys.first() else {
            return Ok(None);
        };
        let Some(OrderingFn::Distance(distance)) = state.opclass(key.attnum_orig).outer_ordering.as_ref() else {
            return Err(RumError::internal(
                "Cannot order by addToColumn and have order by raw keys",
            ));
        };
        let value = match key.outer_add_info.as_ref() {
            Some(outer) => distance(outer, query_key, key.strategy),
            None => f64::INFINITY,
        };
        return Ok(Some(Datum::Float(value)));
    }
    let Some(query) = key.query.clone() else {
        return Ok(None);
    };
    let ordering = state.opclass(key.attnum).ordering.as_ref();
    if key.use_cur_key {
        let Some(OrderingFn::Distance(distance)) = ordering else {
            return Err(RumError::internal(
                "Cannot order by curKey and have order by raw keys",
            ));
        };
        let value = match key.cur_key.as_ref() {
            Some(cur) if cur.category == NullCategory::NormKey => match cur.key.as_ref() {
                Some(datum) => distance(datum, &query, key.strategy),
                None => f64::INFINITY,
            },
            _ => f64::INFINITY,
        };
        return Ok(Some(Datum::Float(value)));
    }

    for (i, &e) in key.entries.iter().enumerate() {
        let entry = &entries[e];
        if !entry.finished && entry.cur.iptr == item.iptr {
            key.entry_res[i] = true;
            key.add_info[i] = state.add_info_datum(entry.def.attnum, &entry.cur);
        } else {
            key.entry_res[i] = false;
            key.add_info[i] = None;
        }
    }
    let Some(OrderingFn::AddInfo(ordering)) = ordering else {
        return Err(RumError::internal(
            "Cannot order by curKey and have order by raw keys",
        ));
    };
    let value = ordering(&key.args(&query, &key.entry_res));
    Ok(Some(Datum::Float(value)))
}
