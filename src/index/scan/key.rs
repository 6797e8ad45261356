//! Scan keys: the user's conditions and order-by expressions turned into
//! query entries, plus the bookkeeping the merge loops need per key.

use crate::datatype::Datum;
use crate::error::{RumError, RumResult};
use crate::opclass::{ConsistentArgs, OrderingFn, SearchMode};
use crate::tree::{EntryKey, NullCategory, RumItem, ScanDirection};

use super::super::state::RumState;
use super::entry::{EntryDef, ItemOrder, ScanEntry};
use super::ScanKeyData;

/// A condition on the attach column, checked against the AddInfo of the
/// key it was moved under.
#[derive(Debug, Clone)]
pub(super) struct AddInfoKey {
    pub attnum: u16,
    pub query_key: Option<Datum>,
    pub strategy: u16,
    pub extra: Option<Datum>,
}

pub(super) struct ScanKey {
    /// Column whose entries are scanned.
    pub attnum: u16,
    /// Column the key was written against.
    pub attnum_orig: u16,
    pub strategy: u16,
    pub query: Option<Datum>,
    pub search_mode: SearchMode,
    pub order_by: bool,

    pub query_keys: Vec<Option<Datum>>,
    pub categories: Vec<NullCategory>,
    pub extra_data: Vec<Option<Datum>>,
    defs: Vec<EntryDef>,
    /// Entries extracted from the query, without the hidden one.
    pub nuser_entries: usize,
    /// Indexes into the entries of the plan.
    pub entries: Vec<usize>,

    pub entry_res: Vec<bool>,
    pub add_info: Vec<Option<Datum>>,
    pub cur_item: RumItem,
    pub cur_item_matches: bool,
    pub recheck_cur_item: bool,
    pub finished: bool,

    pub use_add_to_column: bool,
    pub use_cur_key: bool,
    /// Entry providing the current index key to a `use_cur_key` order key.
    pub cur_key_entry: Option<usize>,
    pub cur_key: Option<EntryKey>,
    pub outer_add_info: Option<Datum>,
    pub add_info_keys: Vec<AddInfoKey>,
}

impl ScanKey {
    fn new(attnum: u16, strategy: u16, query: Option<Datum>, search_mode: SearchMode, order_by: bool) -> Self {
        Self {
            attnum,
            attnum_orig: attnum,
            strategy,
            query,
            search_mode,
            order_by,
            query_keys: Vec::new(),
            categories: Vec::new(),
            extra_data: Vec::new(),
            defs: Vec::new(),
            nuser_entries: 0,
            entries: Vec::new(),
            entry_res: Vec::new(),
            add_info: Vec::new(),
            cur_item: RumItem::min(),
            cur_item_matches: false,
            recheck_cur_item: false,
            finished: false,
            use_add_to_column: false,
            use_cur_key: false,
            cur_key_entry: None,
            cur_key: None,
            outer_add_info: None,
            add_info_keys: Vec::new(),
        }
    }

    /// Fills the query entries, adding the hidden entry of a non-default
    /// search mode.
    fn fill_entries(&mut self, state: &RumState, entries: Vec<crate::opclass::QueryEntry>) -> RumResult<()> {
        let opclass = state.opclass(self.attnum);
        self.nuser_entries = entries.len();
        for entry in entries {
            if entry.partial_match && !opclass.can_partial_match() {
                return Err(RumError::not_supported(
                    "Compare with prefix expressions isn't supported",
                ));
            }
            let category = if entry.key.is_some() {
                NullCategory::NormKey
            } else {
                NullCategory::NullKey
            };
            self.push_def(EntryDef {
                attnum: self.attnum,
                strategy: self.strategy,
                search_mode: self.search_mode,
                query_key: entry.key,
                category,
                partial: entry.partial_match,
                extra: entry.extra_data,
            });
        }
        if let Some(category) = self.search_mode.hidden_category() {
            self.push_def(EntryDef {
                attnum: self.attnum,
                strategy: 0,
                search_mode: self.search_mode,
                query_key: None,
                category,
                partial: false,
                extra: None,
            });
        }
        Ok(())
    }

    fn push_def(&mut self, def: EntryDef) {
        self.query_keys.push(def.query_key.clone());
        self.categories.push(def.category);
        self.extra_data.push(def.extra.clone());
        self.defs.push(def);
    }

    pub fn nentries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_everything(&self) -> bool {
        self.search_mode == SearchMode::Everything
    }

    pub fn reset(&mut self) {
        self.entry_res = vec![false; self.entries.len()];
        self.add_info = vec![None; self.entries.len()];
        self.cur_item = RumItem::min();
        self.cur_item_matches = false;
        self.recheck_cur_item = false;
        self.finished = false;
        self.cur_key = None;
        self.outer_add_info = None;
    }

    pub fn args<'a>(&'a self, query: &'a Datum, check: &'a [bool]) -> ConsistentArgs<'a> {
        ConsistentArgs {
            check,
            strategy: self.strategy,
            query,
            nentries: self.nuser_entries,
            extra_data: &self.extra_data,
            query_keys: &self.query_keys,
            categories: &self.categories,
            add_info: &self.add_info,
        }
    }
}

/// Everything derived from the scan keys once per scan direction.
pub(super) struct ScanPlan {
    /// Condition keys first, then one key per order-by expression.
    pub keys: Vec<ScanKey>,
    pub norderbys: usize,
    pub entries: Vec<ScanEntry>,
    /// Some condition can never be true.
    pub is_void: bool,
    /// Direction in which the postings come out in order-by order, when
    /// they do.
    pub natural: Option<ScanDirection>,
    /// The add-to column has to report its AddInfo.
    pub needs_outer: bool,
    pub order: ItemOrder,
    pending_mark: Option<RumItem>,
}

impl ScanPlan {
    pub fn new(
        state: &RumState,
        conditions: &[ScanKeyData],
        orderbys: &[ScanKeyData],
        reversed: bool,
    ) -> RumResult<Self> {
        let mut plan = ScanPlan {
            keys: Vec::new(),
            norderbys: orderbys.len(),
            entries: Vec::new(),
            is_void: false,
            natural: None,
            needs_outer: false,
            order: ItemOrder::by_item_pointer(),
            pending_mark: None,
        };
        for data in conditions.iter().chain(orderbys) {
            if data.attnum == 0 || data.attnum > state.natts() {
                return Err(RumError::bad_value(format!(
                    "invalid attribute number {} for scan key",
                    data.attnum
                )));
            }
        }

        for data in conditions {
            let opclass = state.opclass(data.attnum);
            let Some(argument) = data.argument.as_ref() else {
                plan.is_void = true;
                return Ok(plan);
            };
            let hint = if (!orderbys.is_empty() || state.gucs.force_ordered_index_scan)
                && opclass.can_ordering()
                && opclass.ordering_nargs() == 4
            {
                2
            } else {
                0
            };
            let extracted = (opclass.extract_query)(argument, data.strategy, hint)?;
            let search_mode = SearchMode::from_raw(extracted.search_mode);
            if extracted.entries.is_empty() && search_mode == SearchMode::Default {
                plan.is_void = true;
                return Ok(plan);
            }
            let mut key = ScanKey::new(data.attnum, data.strategy, Some(argument.clone()), search_mode, false);
            key.fill_entries(state, extracted.entries)?;
            plan.keys.push(key);
        }
        if plan.keys.is_empty() {
            let mut key = ScanKey::new(1, 0, None, SearchMode::Everything, false);
            key.fill_entries(state, Vec::new())?;
            plan.keys.push(key);
        }

        for data in orderbys {
            let key = plan.order_key(state, data)?;
            plan.keys.push(key);
        }

        plan.attach_add_info_keys(state);
        plan.mark_natural_order(state, reversed)?;
        plan.materialize(state)?;
        Ok(plan)
    }

    fn order_key(&mut self, state: &RumState, data: &ScanKeyData) -> RumResult<ScanKey> {
        let attnum = data.attnum;
        let opclass = state.opclass(attnum);
        let mut key = ScanKey::new(attnum, data.strategy, data.argument.clone(), SearchMode::Default, true);
        let Some(argument) = data.argument.as_ref() else {
            return Ok(key);
        };

        if let (Some(attach), Some(add_to)) = (state.attach_column, state.add_to_column) {
            if attach == attnum {
                let extracted = (opclass.extract_query)(argument, data.strategy, 0)?;
                if extracted.entries.len() != 1 {
                    return Err(RumError::internal(
                        "extractQuery should return only one value for ordering",
                    ));
                }
                if !state.column(attnum).type_info.by_val() {
                    return Err(RumError::not_supported(
                        "doesn't support order by over pass-by-reference column",
                    ));
                }
                if !opclass.can_outer_ordering() {
                    return Err(RumError::not_supported(
                        "doesn't support ordering as additional info",
                    ));
                }
                key.query_keys = extracted.entries.into_iter().map(|e| e.key).collect();
                key.use_add_to_column = true;
                key.attnum = add_to;
                self.needs_outer = true;
                return Ok(key);
            }
        }

        match &opclass.ordering {
            None => Err(RumError::not_supported(
                "doesn't support ordering, check operator class definition",
            )),
            Some(OrderingFn::Distance(_)) => {
                let source = self
                    .keys
                    .iter()
                    .position(|k| !k.order_by && !k.is_everything() && k.attnum == attnum)
                    .ok_or_else(|| {
                        RumError::internal(format!(
                            "cannot order without attribute {} in WHERE clause",
                            attnum
                        ))
                    })?;
                match self.keys[source].defs.len() {
                    0 => return Err(RumError::internal("scan key should contain key value")),
                    1 => {}
                    _ => return Err(RumError::internal("scan key should contain only one value")),
                }
                key.use_cur_key = true;
                Ok(key)
            }
            Some(OrderingFn::RawKey(_)) if state.gucs.allow_order_by_raw_keys => Ok(key),
            Some(OrderingFn::RawKey(_)) => Err(RumError::not_supported(
                "doesn't support ordering - ordering function is incorrect, check operator class definition",
            )),
            Some(OrderingFn::AddInfo(_)) => {
                let extracted = (opclass.extract_query)(argument, data.strategy, 0)?;
                key.fill_entries(state, extracted.entries)?;
                Ok(key)
            }
        }
    }

    /// Conditions on the attach column become checks on the AddInfo of the
    /// first condition on the add-to column.
    fn attach_add_info_keys(&mut self, state: &RumState) {
        let (Some(attach), Some(add_to)) = (state.attach_column, state.add_to_column) else {
            return;
        };
        let Some(target) = self
            .keys
            .iter()
            .position(|k| !k.order_by && !k.is_everything() && k.attnum_orig == add_to)
        else {
            return;
        };
        if !self.keys.iter().any(|k| !k.order_by && k.attnum_orig == attach) {
            return;
        }
        let mut moved = Vec::new();
        let mut kept = Vec::with_capacity(self.keys.len());
        let mut target_pos = 0;
        for (i, key) in std::mem::take(&mut self.keys).into_iter().enumerate() {
            if !key.order_by && key.attnum_orig == attach && i != target {
                moved.extend(key.defs.into_iter().map(|def| AddInfoKey {
                    attnum: attach,
                    query_key: def.query_key,
                    strategy: def.strategy,
                    extra: def.extra,
                }));
                continue;
            }
            if i == target {
                target_pos = kept.len();
            }
            kept.push(key);
        }
        kept[target_pos].add_info_keys = moved;
        self.keys = kept;
        self.needs_outer = true;
    }

    /// Binds the order-by value as the start mark of the add-to column
    /// entries when the postings can be read in order-by order.
    fn mark_natural_order(&mut self, state: &RumState, reversed: bool) -> RumResult<()> {
        let Some(add_to) = state.add_to_column else {
            return Ok(());
        };
        if !state.alternative_order {
            return Ok(());
        }
        let all_on_add_to = self
            .keys
            .iter()
            .filter(|k| !k.order_by)
            .all(|k| k.attnum == add_to);
        let order_entries = self.keys.iter().any(|k| k.order_by && !k.defs.is_empty());
        if !all_on_add_to || order_entries {
            return Ok(());
        }

        let mut natural: Option<(ScanDirection, &ScanKey)> = None;
        for key in self.keys.iter().filter(|k| k.use_add_to_column) {
            let direction = state.opclass(key.attnum_orig).direction(key.strategy);
            if let Some((current, _)) = natural {
                if current != direction {
                    return Err(RumError::not_supported(
                        "Could not scan in differ directions at the same time",
                    ));
                }
                return Err(RumError::not_supported(
                    "could not order by more than one operator",
                ));
            }
            natural = Some((direction, key));
        }
        let Some((direction, key)) = natural else {
            return Ok(());
        };
        if direction == ScanDirection::NoMovement {
            self.natural = Some(ScanDirection::NoMovement);
            return Ok(());
        }
        let Some(Some(value)) = key.query_keys.first() else {
            return Ok(());
        };
        let ty = state
            .column(add_to)
            .add_info_type
            .ok_or_else(|| RumError::internal("add-to column has no additional information type"))?;
        let iptr = if direction == ScanDirection::Backward {
            crate::tree::ItemPointer::MAX
        } else {
            crate::tree::ItemPointer::MIN
        };
        let mark = RumItem::with_add_info(iptr, Some(ty.to_raw(value)?));
        let backward = direction.is_backward() != reversed;
        self.natural = Some(if backward {
            ScanDirection::Backward
        } else {
            ScanDirection::Forward
        });
        self.order = ItemOrder {
            layout: Some(state.column(add_to).layout),
            backward,
        };
        self.pending_mark = Some(mark);
        Ok(())
    }

    /// Creates the scan entries, sharing one entry between keys asking for
    /// the same thing.
    fn materialize(&mut self, state: &RumState) -> RumResult<()> {
        let mark = self.pending_mark.take();
        for k in 0..self.keys.len() {
            let defs = std::mem::take(&mut self.keys[k].defs);
            let mut indexes = Vec::with_capacity(defs.len());
            for def in defs {
                let mut found = None;
                for (i, entry) in self.entries.iter().enumerate() {
                    if entry.same_as(state, &def)? {
                        found = Some(i);
                        break;
                    }
                }
                let index = match found {
                    Some(i) => i,
                    None => {
                        let mut entry = ScanEntry::new(def);
                        if let Some(mark) = mark {
                            if !self.keys[k].order_by {
                                entry.use_mark = true;
                                entry.mark = mark;
                            }
                        }
                        self.entries.push(entry);
                        self.entries.len() - 1
                    }
                };
                indexes.push(index);
            }
            self.keys[k].entries = indexes;
            self.keys[k].reset();
        }
        for k in 0..self.keys.len() {
            if !self.keys[k].use_cur_key {
                continue;
            }
            let attnum = self.keys[k].attnum;
            let entry = self
                .keys
                .iter()
                .find(|s| !s.order_by && !s.is_everything() && s.attnum == attnum)
                .and_then(|s| s.entries.first().copied());
            if let Some(entry) = entry {
                self.entries[entry].use_cur_key = true;
            }
            self.keys[k].cur_key_entry = entry;
        }
        Ok(())
    }
}

/// Consistency of `key` at its current item: the opclass predicate, then
/// the AddInfo conditions moved under the key.
pub(super) fn call_consistent(state: &RumState, key: &mut ScanKey, needs_outer: bool) -> RumResult<bool> {
    if key.is_everything() {
        key.recheck_cur_item = false;
        return call_add_info_consistent(state, key, needs_outer);
    }
    let Some(query) = key.query.as_ref() else {
        return Ok(false);
    };
    let opclass = state.opclass(key.attnum);
    let mut recheck = true;
    let res = (opclass.consistent)(&key.args(query, &key.entry_res), &mut recheck)?;
    key.recheck_cur_item = recheck;
    if !res {
        return Ok(false);
    }
    call_add_info_consistent(state, key, needs_outer)
}

/// Remembers the AddInfo of the current item for ordering by the attach
/// column and checks the conditions on it.
pub(super) fn call_add_info_consistent(state: &RumState, key: &mut ScanKey, needs_outer: bool) -> RumResult<bool> {
    if state.add_to_column != Some(key.attnum) {
        return Ok(true);
    }
    key.outer_add_info = None;
    if key.add_info_keys.is_empty() && !needs_outer {
        return Ok(true);
    }
    key.outer_add_info = key
        .entry_res
        .iter()
        .zip(&key.add_info)
        .find_map(|(res, add_info)| if *res { add_info.clone() } else { None });
    if key.add_info_keys.is_empty() {
        return Ok(true);
    }
    let Some(outer) = key.outer_add_info.as_ref() else {
        return Ok(false);
    };
    for sub in &key.add_info_keys {
        let Some(query_key) = sub.query_key.as_ref() else {
            return Ok(false);
        };
        let compare_partial = state.opclass(sub.attnum).compare_partial.as_ref().ok_or_else(|| {
            RumError::not_supported("Compare with prefix expressions isn't supported")
        })?;
        if compare_partial(query_key, outer, sub.strategy, sub.extra.as_ref())? != 0 {
            return Ok(false);
        }
    }
    Ok(true)
}
