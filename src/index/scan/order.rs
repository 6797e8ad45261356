//! Ordered scan: walks the entry tree of one column in key order and
//! emits the postings of every matching index entry in turn, so rows come
//! out ordered by their raw index key.
//!
//! The walk works on a private copy of the current leaf. The leaf stays
//! pinned; when the next sibling is not the one the copy pointed to, the
//! leaf was split meanwhile and entries up to the last one seen are
//! skipped.

use std::cmp::Ordering;

use crate::datatype::Datum;
use crate::error::{RumError, RumResult};
use crate::opclass::OrderingFn;
use crate::page::{Buffer, RumPage, Relation, FIRST_OFFSET_NUMBER, ROOT_BLKNO};
use crate::tree::{
    collect_posting_tree, compare_entries, find_leaf_page, page_tuple, rum_step, EntryBtree,
    EntryKey, LockedPage, NullCategory, ScanDirection,
};

use super::super::state::RumState;
use super::entry::{EntryDef, ItemOrder, PostingStream, ScanCtx};
use super::get::FoundItem;
use super::key::{call_consistent, ScanPlan};

struct Position {
    buffer: Buffer,
    page: Box<RumPage>,
    off: u16,
}

enum Verdict {
    Match,
    Skip { marked_finished: bool },
    Finished,
}

pub(super) struct OrderedScan {
    /// Plan entry the walk was started from.
    entry: usize,
    attnum: u16,
    backward: bool,
    position: Option<Position>,
    /// Last entry seen before a concurrent split; entries up to it were
    /// already returned.
    bound: Option<EntryKey>,
    postings: Option<PostingStream>,
    cur_datum: Option<Datum>,
    recheck: bool,
    recheck_order_by: bool,
    pub loops: u64,
}

/// Entry to start from: the first entry of each condition in walk order,
/// the last of those across conditions.
fn min_scan_entry(state: &RumState, plan: &ScanPlan, backward: bool) -> RumResult<Option<usize>> {
    let directed = |a: &EntryDef, b: &EntryDef| -> RumResult<Ordering> {
        let ord = compare_entries(state, &a.entry_key(), &b.entry_key())?;
        Ok(if backward { ord.reverse() } else { ord })
    };
    let mut global: Option<usize> = None;
    for key in plan.keys.iter().filter(|k| !k.order_by) {
        let mut min: Option<usize> = None;
        for &e in &key.entries {
            if plan.entries[e].finished {
                continue;
            }
            match min {
                Some(m) if directed(&plan.entries[m].def, &plan.entries[e].def)? != Ordering::Greater => {}
                _ => min = Some(e),
            }
        }
        let Some(min) = min else {
            continue;
        };
        match global {
            Some(g) if directed(&plan.entries[g].def, &plan.entries[min].def)? != Ordering::Less => {}
            _ => global = Some(min),
        }
    }
    Ok(global)
}

/// Where `idatum` lies relative to the range of `def`: zero inside,
/// negative before it, positive past it.
fn entry_compare(state: &RumState, def: &EntryDef, idatum: &Datum) -> RumResult<i32> {
    match def.category {
        NullCategory::EmptyQuery => return Ok(0),
        NullCategory::NormKey => {}
        _ => return Ok(-1),
    }
    let Some(query) = def.query_key.as_ref() else {
        return Ok(-1);
    };
    let compare_partial = state.opclass(def.attnum).compare_partial.as_ref().ok_or_else(|| {
        RumError::not_supported("Compare with prefix expressions isn't supported")
    })?;
    compare_partial(query, idatum, def.strategy, def.extra.as_ref())
}

impl OrderedScan {
    pub fn start(
        rel: &Relation,
        state: &RumState,
        plan: &mut ScanPlan,
        direction: ScanDirection,
    ) -> RumResult<Option<Self>> {
        let backward = direction.is_backward();
        let Some(entry) = min_scan_entry(state, plan, backward)? else {
            return Ok(None);
        };
        let mut scan = Self {
            entry,
            attnum: plan.entries[entry].def.attnum,
            backward,
            position: None,
            bound: None,
            postings: None,
            cur_datum: None,
            recheck: false,
            recheck_order_by: false,
            loops: 0,
        };
        scan.start_at(rel, state, plan, entry)?;
        Ok(Some(scan))
    }

    /// Positions the walk on the index entry of plan entry `entry`.
    fn start_at(&mut self, rel: &Relation, state: &RumState, plan: &ScanPlan, entry: usize) -> RumResult<()> {
        self.entry = entry;
        self.bound = None;
        self.postings = None;
        let btree = EntryBtree::new(state, plan.entries[entry].def.entry_key(), true);
        let (_, leaf) = find_leaf_page(&btree, rel, ROOT_BLKNO)?;
        let mut off = FIRST_OFFSET_NUMBER;
        let found = btree.find_item(&leaf, &mut off)?;
        let maxoff = leaf.max_offset_number();
        if !found && self.backward && off > maxoff {
            off = maxoff;
        }
        log::debug!(
            "ordered scan starts on block {} offset {} walking {}",
            leaf.blkno(),
            off,
            if self.backward { "backward" } else { "forward" }
        );
        let page = Box::new(*leaf);
        self.position = Some(Position {
            buffer: leaf.unlock(),
            page,
            off,
        });
        Ok(())
    }

    fn step(&mut self) {
        if let Some(pos) = self.position.as_mut() {
            if self.backward {
                pos.off = pos.off.saturating_sub(1);
            } else {
                pos.off += 1;
            }
        }
    }

    /// Makes the position point into the page copy, moving to the next
    /// leaf when needed. Returns false at the end of the tree.
    fn settle(&mut self, rel: &Relation, state: &RumState) -> RumResult<bool> {
        loop {
            let Some(pos) = self.position.as_mut() else {
                return Ok(false);
            };
            let maxoff = pos.page.max_offset_number();
            if pos.off >= FIRST_OFFSET_NUMBER && pos.off <= maxoff {
                return Ok(true);
            }
            rel.check_for_interrupts()?;
            let current = LockedPage::Share(pos.buffer.clone().lock_share());
            let (at_end, cached, bound_off) = if self.backward {
                (current.is_leftmost(), pos.page.opaque.leftlink, FIRST_OFFSET_NUMBER)
            } else {
                (current.is_rightmost(), pos.page.opaque.rightlink, maxoff)
            };
            if at_end {
                self.position = None;
                return Ok(false);
            }
            let direction = if self.backward {
                ScanDirection::Backward
            } else {
                ScanDirection::Forward
            };
            let Some(next) = rum_step(rel, current, direction)? else {
                self.position = None;
                return Ok(false);
            };
            if next.blkno() != cached && bound_off >= FIRST_OFFSET_NUMBER && bound_off <= maxoff {
                log::debug!(
                    "ordered scan saw a split of block {}, skipping entries already returned",
                    pos.buffer.blkno()
                );
                self.bound = Some(page_tuple(&pos.page, bound_off).entry_key(state)?);
            }
            pos.page = Box::new(*next);
            pos.off = if self.backward {
                next.max_offset_number()
            } else {
                FIRST_OFFSET_NUMBER
            };
            pos.buffer = next.unlock();
        }
    }

    fn validate(&mut self, state: &RumState, plan: &mut ScanPlan, idatum: &Datum) -> RumResult<Verdict> {
        self.loops += 1;
        self.recheck = false;
        self.recheck_order_by = false;

        if let Some(bound) = self.bound.as_ref() {
            let current = EntryKey::new(self.attnum, Some(idatum.clone()), NullCategory::NormKey);
            let ord = compare_entries(state, bound, &current)?;
            let ord = if self.backward { ord.reverse() } else { ord };
            if ord != Ordering::Less {
                return Ok(Verdict::Skip {
                    marked_finished: false,
                });
            }
            self.bound = None;
        }

        let backward = self.backward;
        let ScanPlan { keys, entries, .. } = plan;
        let mut marked_finished = false;
        for key in keys.iter_mut().filter(|k| !k.order_by) {
            let mut exhausted = true;
            let mut any_match = false;
            for (j, &e) in key.entries.iter().enumerate() {
                key.add_info[j] = None;
                let entry = &mut entries[e];
                if entry.finished {
                    key.entry_res[j] = false;
                    continue;
                }
                let cmp = entry_compare(state, &entry.def, idatum)?;
                // walking backward, a key past the range was not reached yet
                let cmp = if backward && cmp > 0 { -1 } else { cmp };
                match cmp {
                    0 => {
                        any_match = true;
                        exhausted = false;
                        key.entry_res[j] = true;
                    }
                    c if c < 0 => {
                        exhausted = false;
                        key.entry_res[j] = false;
                    }
                    _ => {
                        marked_finished = true;
                        entry.finished = true;
                        key.entry_res[j] = false;
                    }
                }
            }
            if exhausted {
                return Ok(Verdict::Finished);
            }
            if !any_match || !call_consistent(state, key, false)? {
                return Ok(Verdict::Skip { marked_finished });
            }
            self.recheck |= key.recheck_cur_item;
        }

        let def = &entries[self.entry].def;
        if let (Some(query), Some(compare_partial)) = (
            def.query_key.as_ref(),
            state.opclass(def.attnum).compare_partial.as_ref(),
        ) {
            if compare_partial(query, idatum, 0, def.extra.as_ref())? < 0 {
                self.recheck_order_by = true;
            }
        }
        Ok(Verdict::Match)
    }

    /// Moves to the next matching index entry and opens its postings.
    /// Returns false when the walk is over.
    fn advance(&mut self, rel: &Relation, state: &RumState, plan: &mut ScanPlan) -> RumResult<bool> {
        loop {
            if !self.settle(rel, state)? {
                return Ok(false);
            }
            let Some(pos) = self.position.as_ref() else {
                return Ok(false);
            };
            let tuple = page_tuple(&pos.page, pos.off);
            if tuple.attnum(state.one_col) != self.attnum {
                if self.backward {
                    self.step();
                    continue;
                }
                self.position = None;
                return Ok(false);
            }
            let key = tuple.entry_key(state)?;
            let (NullCategory::NormKey, Some(idatum)) = (key.category, key.key) else {
                self.step();
                continue;
            };

            match self.validate(state, plan, &idatum)? {
                Verdict::Finished => {
                    self.position = None;
                    return Ok(false);
                }
                Verdict::Skip { marked_finished } => {
                    if marked_finished {
                        if let Some(min) = min_scan_entry(state, plan, self.backward)? {
                            let def = &plan.entries[min].def;
                            let current = EntryKey::new(self.attnum, Some(idatum.clone()), def.category);
                            let ord = compare_entries(state, &def.entry_key(), &current)?;
                            let ord = if self.backward { ord.reverse() } else { ord };
                            if ord == Ordering::Greater {
                                self.start_at(rel, state, plan, min)?;
                                continue;
                            }
                        }
                    }
                    self.step();
                    continue;
                }
                Verdict::Match => {}
            }

            let ctx = ScanCtx {
                rel,
                state,
                order: ItemOrder::by_item_pointer(),
            };
            let Some(pos) = self.position.as_ref() else {
                return Ok(false);
            };
            let tuple = page_tuple(&pos.page, pos.off);
            let layout = &state.column(self.attnum).layout;
            let stream = if tuple.is_posting_tree() {
                let root = tuple.posting_tree_root();
                if layout.order_by_add_info {
                    let mut items = collect_posting_tree(rel, layout, root)?;
                    items.sort_by(|a, b| a.iptr.cmp(&b.iptr));
                    PostingStream::list(self.attnum, items, Vec::new())
                } else {
                    PostingStream::tree(&ctx, self.attnum, root, None)?
                }
            } else {
                let mut items = tuple.items(state)?;
                items.sort_by(|a, b| a.iptr.cmp(&b.iptr));
                PostingStream::list(self.attnum, items, Vec::new())
            };
            self.cur_datum = Some(idatum);
            self.postings = Some(stream);
            self.step();
            return Ok(true);
        }
    }

    pub fn next(&mut self, rel: &Relation, state: &RumState, plan: &mut ScanPlan) -> RumResult<Option<FoundItem>> {
        loop {
            if let Some(stream) = self.postings.as_mut() {
                let ctx = ScanCtx {
                    rel,
                    state,
                    order: ItemOrder::by_item_pointer(),
                };
                if let Some(item) = stream.next(&ctx)? {
                    return Ok(Some(FoundItem {
                        item,
                        recheck: self.recheck || self.recheck_order_by,
                        recheck_order_by: self.recheck_order_by,
                    }));
                }
                self.postings = None;
            }
            rel.check_for_interrupts()?;
            if !self.advance(rel, state, plan)? {
                return Ok(None);
            }
        }
    }

    /// Order values of the rows of the current index entry.
    pub fn order_values(&self, state: &RumState, plan: &ScanPlan) -> RumResult<Vec<Option<Datum>>> {
        let mut values = Vec::with_capacity(plan.norderbys);
        for key in plan.keys.iter().filter(|k| k.order_by) {
            let (Some(query), Some(idatum), false) = (key.query.as_ref(), self.cur_datum.as_ref(), key.use_add_to_column)
            else {
                values.push(None);
                continue;
            };
            let value = match state.opclass(key.attnum).ordering.as_ref() {
                Some(OrderingFn::RawKey(ordering)) => Some(ordering(idatum, query, key.strategy)),
                Some(OrderingFn::Distance(distance)) => {
                    Some(Datum::Float(distance(idatum, query, key.strategy)))
                }
                _ => None,
            };
            values.push(value);
        }
        Ok(values)
    }
}
