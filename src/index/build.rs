use std::cmp::Ordering;

use rayon::prelude::*;

use super::insert::entry_insert;
use super::state::RumState;
use super::{HeapTuple, IndexBuildResult, RumIndex};
use crate::error::{RumError, RumResult};
use crate::page::{
    page_write, rum_new_buffer, GenericXLog, PageFlags, Relation, METAPAGE_BLKNO, ROOT_BLKNO,
};
use crate::tree::{compare_entries, EntryKey, MetaPageData, RumItem, RumStats};

/// Heap rows extracted per round before the accumulator is checked.
const EXTRACT_BATCH: usize = 1024;

/// Formats block 0 as the meta page and block 1 as the empty entry root.
pub(super) fn init_meta_and_root(rel: &Relation) -> RumResult<()> {
    let mut meta = rum_new_buffer(rel)?;
    let mut root = rum_new_buffer(rel)?;
    if meta.blkno() != METAPAGE_BLKNO || root.blkno() != ROOT_BLKNO {
        return Err(RumError::internal(format!(
            "index \"{}\" is not empty",
            rel.name()
        )));
    }
    let mut xlog = GenericXLog::start(rel);
    let m = xlog.register(&mut meta, true);
    let page = xlog.page_mut(m);
    page.init(PageFlags::META);
    *page.as_mut::<MetaPageData>() = MetaPageData::default();
    let r = xlog.register(&mut root, true);
    xlog.page_mut(r).init(PageFlags::LEAF);
    xlog.finish();
    Ok(())
}

struct ExtractedRow {
    entries: Vec<(EntryKey, RumItem)>,
    multi_key: bool,
}

fn extract_row(state: &RumState, tuple: &HeapTuple) -> RumResult<ExtractedRow> {
    let mut row = ExtractedRow {
        entries: Vec::new(),
        multi_key: false,
    };
    if tuple.values.len() != state.natts() as usize {
        return Err(RumError::bad_value(format!(
            "heap tuple {} has {} values, index has {} columns",
            tuple.tid,
            tuple.values.len(),
            state.natts()
        )));
    }
    for attnum in 1..=state.natts() {
        let value = tuple.values[attnum as usize - 1].as_ref();
        let entries = state.extract_entries(attnum, value)?;
        row.multi_key |= entries.len() > 1;
        let attached = match (state.add_to_column, state.attach_column) {
            (Some(to), Some(attach)) if to == attnum => tuple.values[attach as usize - 1].as_ref(),
            _ => None,
        };
        for (key, add_info) in entries {
            let item = state.make_item(attnum, tuple.tid, attached.or(add_info.as_ref()))?;
            row.entries.push((key, item));
        }
    }
    Ok(row)
}

/// Sorted runs of `(entry, posting)` pairs waiting to be written.
struct BuildAccumulator {
    entries: Vec<(EntryKey, RumItem)>,
}

impl BuildAccumulator {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn flush(&mut self, rel: &Relation, state: &RumState, stats: &mut RumStats) -> RumResult<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let mut error = None;
        self.entries.sort_by(|a, b| {
            match compare_entries(state, &a.0, &b.0) {
                Ok(Ordering::Equal) => state.column(a.0.attnum).layout.compare(&a.1, &b.1),
                Ok(ord) => ord,
                Err(e) => {
                    error.get_or_insert(e);
                    Ordering::Equal
                }
            }
        });
        if let Some(e) = error {
            return Err(e);
        }

        let entries = std::mem::take(&mut self.entries);
        let mut iter = entries.into_iter().peekable();
        while let Some((key, item)) = iter.next() {
            let layout = &state.column(key.attnum).layout;
            let mut items = vec![item];
            while let Some((next, next_item)) = iter.peek() {
                if compare_entries(state, &key, next)? != Ordering::Equal {
                    break;
                }
                if items.last().map(|last| layout.compare(last, next_item)) != Some(Ordering::Equal) {
                    items.push(*next_item);
                }
                iter.next();
            }
            entry_insert(rel, state, &key, &items, Some(&mut *stats))?;
        }
        Ok(())
    }
}

impl RumIndex {
    /// Formats an empty index: the meta page and an empty entry root.
    pub fn build_empty(&self) -> RumResult<()> {
        init_meta_and_root(&self.rel)
    }

    /// Bulk loads `heap` into a fresh index.
    pub fn build(&self, heap: &[HeapTuple]) -> RumResult<IndexBuildResult> {
        let rel = &self.rel;
        let state = &*self.state;
        if rel.nblocks() != 0 {
            return Err(RumError::internal(format!(
                "index \"{}\" already contains data",
                rel.name()
            )));
        }
        init_meta_and_root(rel)?;

        let mut stats = RumStats {
            n_entry_pages: 1,
            ..Default::default()
        };
        let parallel = state.gucs.enable_parallel_index_build
            && state.add_to_column.is_none()
            && state
                .columns
                .iter()
                .all(|c| c.add_info_type.is_none() && !c.opclass.can_join_add_info());
        let pool = if parallel {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(state.gucs.parallel_workers().max(1))
                    .thread_name(|i| format!("rum_build_{i}"))
                    .build()
                    .map_err(|e| RumError::internal(format!("cannot start build workers: {}", e)))?,
            )
        } else {
            None
        };

        let limit = state.gucs.maintenance_work_mem_items.max(1);
        let mut accumulator = BuildAccumulator::new();
        let mut index_tuples = 0;
        let mut multi_key = false;
        for batch in heap.chunks(EXTRACT_BATCH) {
            rel.check_for_interrupts()?;
            let rows: Vec<ExtractedRow> = match &pool {
                Some(pool) => pool.install(|| {
                    batch
                        .par_iter()
                        .map(|tuple| extract_row(state, tuple))
                        .collect::<RumResult<Vec<_>>>()
                })?,
                None => batch
                    .iter()
                    .map(|tuple| extract_row(state, tuple))
                    .collect::<RumResult<Vec<_>>>()?,
            };
            for row in rows {
                multi_key |= row.multi_key;
                index_tuples += row.entries.len();
                accumulator.entries.extend(row.entries);
            }
            if accumulator.len() >= limit {
                accumulator.flush(rel, state, &mut stats)?;
            }
        }
        accumulator.flush(rel, state, &mut stats)?;

        stats.n_total_pages = rel.nblocks();
        let mut meta = page_write(rel, METAPAGE_BLKNO)?;
        let mut xlog = GenericXLog::start(rel);
        let idx = xlog.register(&mut meta, false);
        let data = xlog.page_mut(idx).as_mut::<MetaPageData>();
        data.set_stats(&stats);
        data.n_pending_heap_tuples = i64::from(multi_key);
        xlog.finish();

        log::debug!(
            "built index \"{}\": {} heap tuples, {} entries, {} pages",
            rel.name(),
            heap.len(),
            stats.n_entries,
            stats.n_total_pages
        );
        Ok(IndexBuildResult {
            heap_tuples: heap.len(),
            index_tuples,
        })
    }
}
