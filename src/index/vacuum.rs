//! Bulk deletion of dead postings and the cleanup sweep.
//!
//! Entry leaves are walked left to right; inline posting lists are
//! rewritten in place and posting trees are vacuumed after their entry page
//! is released. Posting tree leaves left empty are unlinked in a second
//! pass under a cleanup lock on the tree root.

use std::time::Duration;

use super::state::RumState;
use super::{IndexBulkDeleteResult, RumIndex};
use crate::error::{RumError, RumResult};
use crate::page::{
    page_read, page_write, GenericXLog, PageFlags, PageWriteGuard, Relation, RumPage,
    INVALID_BLOCK_NUMBER, METAPAGE_BLKNO, ROOT_BLKNO,
};
use crate::tree::posting::{
    encode_items, posting_items, read_leaf, right_bound, set_right_bound, write_leaf,
    write_posting_items,
};
use crate::tree::{
    find_leaf_page, form_tuple, page_tuple, posting_tree_leaf, EntryBtree, ItemPointer,
    MetaPageData, PostingLayout, PostingStart, RumItem, RumStats,
};

const MAX_DELETE_RETRIES: u32 = 10;

enum DeleteOutcome {
    Deleted,
    /// The page no longer qualifies for deletion.
    Skipped,
    /// A lock or pin on one of the pages is held elsewhere, or a sibling
    /// link changed before the locks were taken.
    Busy,
}

struct Vacuum<'a> {
    rel: &'a Relation,
    state: &'a RumState,
    callback: &'a dyn Fn(ItemPointer) -> bool,
    result: IndexBulkDeleteResult,
}

impl Vacuum<'_> {
    /// Drops dead items from `items`, counting both outcomes.
    fn filter(&mut self, items: &[RumItem]) -> Vec<RumItem> {
        let live: Vec<_> = items
            .iter()
            .filter(|item| !(self.callback)(item.iptr))
            .copied()
            .collect();
        self.result.tuples_removed += (items.len() - live.len()) as u64;
        self.result.num_index_tuples += live.len() as u64;
        live
    }

    fn entry_leaves(&mut self) -> RumResult<()> {
        let btree = EntryBtree::full_scan(self.state);
        let (_, leaf) = find_leaf_page(&btree, self.rel, ROOT_BLKNO)?;
        let mut blkno = leaf.blkno();
        drop(leaf);
        loop {
            self.rel.check_for_interrupts()?;
            let mut page = page_write(self.rel, blkno)?;
            let mut roots = Vec::new();
            let mut replacements = Vec::new();
            for off in 1..=page.max_offset_number() {
                let tuple = page_tuple(&page, off);
                if tuple.is_posting_tree() {
                    roots.push((tuple.posting_tree_root(), tuple.attnum(self.state.one_col)));
                    continue;
                }
                let items = tuple.items(self.state)?;
                let live = self.filter(&items);
                if live.len() == items.len() {
                    continue;
                }
                let key = tuple.entry_key(self.state)?;
                let layout = &self.state.column(key.attnum).layout;
                let encoded = encode_items(layout, &live);
                let raw = form_tuple(self.state, self.rel, &key, &encoded, live.len() as u16, true)?
                    .ok_or_else(|| RumError::internal("shrunk entry tuple does not fit"))?;
                replacements.push((off, raw));
            }
            if !replacements.is_empty() {
                let mut xlog = GenericXLog::start(self.rel);
                let idx = xlog.register(&mut page, false);
                for (off, raw) in &replacements {
                    if !xlog.page_mut(idx).replace_item(*off, raw) {
                        return Err(RumError::internal(format!(
                            "failed to replace entry tuple at offset {} of block {} in index \"{}\"",
                            off,
                            blkno,
                            self.rel.name()
                        )));
                    }
                }
                xlog.finish();
            }
            let next = page.opaque.rightlink;
            drop(page);

            for (root, attnum) in roots {
                let layout = self.state.column(attnum).layout.clone();
                self.posting_tree(root, &layout)?;
                self.rel.vacuum_delay_point()?;
            }
            if next == INVALID_BLOCK_NUMBER {
                return Ok(());
            }
            blkno = next;
        }
    }

    /// Prunes one data leaf; returns whether it is left empty.
    fn leaf(&mut self, page: &mut PageWriteGuard, layout: &PostingLayout) -> RumResult<bool> {
        let items = read_leaf(layout, page)?;
        let live = self.filter(&items);
        if live.len() != items.len() {
            let mut xlog = GenericXLog::start(self.rel);
            let idx = xlog.register(page, false);
            if !write_leaf(layout, xlog.page_mut(idx), &live) {
                return Err(RumError::internal("pruned posting list does not fit"));
            }
            xlog.finish();
        }
        Ok(live.is_empty())
    }

    fn posting_tree(&mut self, root: u32, layout: &PostingLayout) -> RumResult<()> {
        let has_void = if self.state.gucs.use_new_vacuum_scan {
            self.posting_leaves_linear(root, layout)?
        } else {
            self.posting_subtree(root, root, layout)?
        };
        if has_void {
            let mut root_page = self.rel.read_buffer(root)?.lock_for_cleanup(self.rel)?;
            self.delete_empty_leaves(&mut root_page)?;
        }
        Ok(())
    }

    fn posting_leaves_linear(&mut self, root: u32, layout: &PostingLayout) -> RumResult<bool> {
        let (leaf, _) = posting_tree_leaf(self.rel, layout, root, PostingStart::First)?;
        let mut blkno = leaf.blkno();
        drop(leaf);
        let mut has_void = false;
        loop {
            self.rel.check_for_interrupts()?;
            let mut page = page_write(self.rel, blkno)?;
            if !page.is_deleted() && self.leaf(&mut page, layout)? && blkno != root {
                has_void = true;
            }
            let next = page.opaque.rightlink;
            drop(page);
            if next == INVALID_BLOCK_NUMBER {
                return Ok(has_void);
            }
            blkno = next;
        }
    }

    fn posting_subtree(&mut self, blkno: u32, root: u32, layout: &PostingLayout) -> RumResult<bool> {
        self.rel.check_for_interrupts()?;
        let mut page = page_write(self.rel, blkno)?;
        if page.is_deleted() {
            return Ok(false);
        }
        if page.is_leaf() {
            return Ok(self.leaf(&mut page, layout)? && blkno != root);
        }
        let children: Vec<u32> = posting_items(&page).iter().map(|p| p.child()).collect();
        drop(page);
        let mut has_void = false;
        for child in children {
            has_void |= self.posting_subtree(child, root, layout)?;
        }
        Ok(has_void)
    }

    /// Finds `(parent, leaf)` pairs of empty leaves that may be unlinked.
    /// Pages held by someone else are passed over until the next vacuum.
    fn collect_empty_leaves(&self, root: &RumPage, root_blkno: u32) -> RumResult<Vec<(u32, u32)>> {
        let mut out = Vec::new();
        let mut level = vec![(root_blkno, Box::new(*root))];
        while !level.is_empty() {
            let mut next_level = Vec::new();
            for (parent, page) in level {
                for pitem in posting_items(&page) {
                    let child = pitem.child();
                    let Ok(guard) = self.rel.read_buffer(child)?.conditional_lock_exclusive() else {
                        continue;
                    };
                    if guard.is_deleted() {
                        continue;
                    }
                    if !guard.is_leaf() {
                        next_level.push((child, Box::new(*guard)));
                    } else if guard.opaque.maxoff == 0 && !guard.is_leftmost() && !guard.is_rightmost() {
                        out.push((parent, child));
                    }
                }
            }
            level = next_level;
        }
        Ok(out)
    }

    fn delete_empty_leaves(&mut self, root: &mut PageWriteGuard) -> RumResult<()> {
        if root.is_leaf() {
            return Ok(());
        }
        let root_blkno = root.blkno();
        let bounded = self.state.gucs.skip_retry_on_delete_page;
        for (parent, child) in self.collect_empty_leaves(root, root_blkno)? {
            let mut backoff = Duration::from_millis(1);
            let mut retries = 0u32;
            loop {
                match self.try_delete_leaf(root, parent, child)? {
                    DeleteOutcome::Deleted => {
                        self.result.pages_deleted += 1;
                        break;
                    }
                    DeleteOutcome::Skipped => break,
                    DeleteOutcome::Busy if bounded && retries >= MAX_DELETE_RETRIES => {
                        log::warn!(
                            "skipping deletion of empty page {} in index \"{}\" after {} retries",
                            child,
                            self.rel.name(),
                            retries
                        );
                        break;
                    }
                    DeleteOutcome::Busy => {
                        retries += 1;
                        self.rel.check_for_interrupts()?;
                        std::thread::sleep(backoff);
                        backoff = (backoff * 2).min(Duration::from_millis(64));
                    }
                }
            }
        }
        Ok(())
    }

    /// Unlinks the empty leaf `child` from its siblings and from `parent` in
    /// one atomic action. Locks go left, deleted page, right, then parent,
    /// all conditionally: an inserter may hold a leaf while it waits for
    /// the root we hold.
    fn try_delete_leaf(
        &mut self,
        root: &mut PageWriteGuard,
        parent: u32,
        child: u32,
    ) -> RumResult<DeleteOutcome> {
        let rel = self.rel;
        let (left, right) = {
            let Ok(page) = rel.read_buffer(child)?.conditional_lock_exclusive() else {
                return Ok(DeleteOutcome::Busy);
            };
            if page.is_deleted()
                || page.opaque.maxoff != 0
                || page.is_leftmost()
                || page.is_rightmost()
            {
                return Ok(DeleteOutcome::Skipped);
            }
            (page.opaque.leftlink, page.opaque.rightlink)
        };

        let Ok(mut lpage) = rel.read_buffer(left)?.conditional_lock_exclusive() else {
            return Ok(DeleteOutcome::Busy);
        };
        let Ok(mut dpage) = rel.read_buffer(child)?.conditional_lock_for_cleanup() else {
            return Ok(DeleteOutcome::Busy);
        };
        let Ok(mut rpage) = rel.read_buffer(right)?.conditional_lock_exclusive() else {
            return Ok(DeleteOutcome::Busy);
        };
        let mut parent_guard = None;
        if parent != root.blkno() {
            let Ok(page) = rel.read_buffer(parent)?.conditional_lock_exclusive() else {
                return Ok(DeleteOutcome::Busy);
            };
            parent_guard = Some(page);
        }
        let ppage: &mut PageWriteGuard = match parent_guard.as_mut() {
            Some(page) => page,
            None => root,
        };

        if dpage.opaque.maxoff != 0 || dpage.is_deleted() || ppage.is_deleted() {
            return Ok(DeleteOutcome::Skipped);
        }
        // a sibling split or an earlier deletion moved the links; start over
        if lpage.opaque.rightlink != child || rpage.opaque.leftlink != child {
            return Ok(DeleteOutcome::Busy);
        }
        let mut downlinks = posting_items(ppage).to_vec();
        let Some(pos) = downlinks.iter().position(|p| p.child() == child) else {
            return Ok(DeleteOutcome::Skipped);
        };
        // an internal page never goes without downlinks
        if downlinks.len() < 2 {
            return Ok(DeleteOutcome::Skipped);
        }
        let removed = downlinks.remove(pos);
        // the left sibling takes over the key range of the last downlink
        let widen_left = pos == downlinks.len();
        if widen_left {
            if downlinks[pos - 1].child() != left {
                return Ok(DeleteOutcome::Skipped);
            }
            downlinks[pos - 1].item = removed.item;
        }
        let bound = right_bound(&dpage);

        let mut xlog = GenericXLog::start(rel);
        let l = xlog.register(&mut lpage, false);
        xlog.page_mut(l).opaque.rightlink = right;
        if widen_left {
            set_right_bound(xlog.page_mut(l), bound);
        }
        let r = xlog.register(&mut rpage, false);
        xlog.page_mut(r).opaque.leftlink = left;
        let p = xlog.register(ppage, false);
        write_posting_items(xlog.page_mut(p), &downlinks);
        let d = xlog.register(&mut dpage, false);
        xlog.page_mut(d).set_flags(PageFlags::DELETED);
        xlog.finish();

        rel.predicate_lock_page_combine(child, right);
        log::debug!(
            "deleted empty data page {} of index \"{}\" between {} and {}",
            child,
            rel.name(),
            left,
            right
        );
        Ok(DeleteOutcome::Deleted)
    }
}

impl RumIndex {
    /// Removes every posting whose row `callback` reports dead.
    pub fn bulk_delete<F>(
        &self,
        stats: Option<IndexBulkDeleteResult>,
        callback: F,
    ) -> RumResult<IndexBulkDeleteResult>
    where
        F: Fn(ItemPointer) -> bool,
    {
        let mut vacuum = Vacuum {
            rel: &self.rel,
            state: &self.state,
            callback: &callback,
            result: stats.unwrap_or_default(),
        };
        vacuum.entry_leaves()?;
        Ok(vacuum.result)
    }

    /// Reclassifies every page, hands empty ones to the free space map and
    /// rewrites the statistics on the meta page.
    pub fn vacuum_cleanup(
        &self,
        stats: Option<IndexBulkDeleteResult>,
    ) -> RumResult<IndexBulkDeleteResult> {
        let rel = &self.rel;
        let mut result = stats.unwrap_or(IndexBulkDeleteResult {
            estimated_count: true,
            ..Default::default()
        });
        let nblocks = rel.nblocks();
        let mut totals = RumStats {
            n_total_pages: nblocks,
            ..Default::default()
        };
        for blkno in (METAPAGE_BLKNO + 1)..nblocks {
            rel.vacuum_delay_point()?;
            let page = page_read(rel, blkno)?;
            if page.is_new() || page.is_deleted() {
                rel.record_free_page(blkno);
                result.pages_free += 1;
            } else if page.is_data() {
                totals.n_data_pages += 1;
            } else {
                totals.n_entry_pages += 1;
                if page.is_leaf() {
                    totals.n_entries += page.max_offset_number() as i64;
                }
            }
        }

        let mut meta = page_write(rel, METAPAGE_BLKNO)?;
        let mut xlog = GenericXLog::start(rel);
        let idx = xlog.register(&mut meta, false);
        xlog.page_mut(idx).as_mut::<MetaPageData>().set_stats(&totals);
        xlog.finish();

        result.num_pages = nblocks;
        log::debug!(
            "vacuum cleanup of index \"{}\": {} pages, {} free, {} entries",
            rel.name(),
            nblocks,
            result.pages_free,
            totals.n_entries
        );
        Ok(result)
    }
}
