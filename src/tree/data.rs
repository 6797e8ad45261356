//! Posting trees: B-trees of compressed posting lists for entries with too
//! many postings to keep inline.

use std::cmp::Ordering;

use super::btree::{find_leaf_page, insert_value, LockedPage, RumBtree};
use super::item::{ItemPointer, PostingItem, PostingLayout, RumItem};
use super::meta::RumStats;
use super::posting::{
    encoded_size, posting_items, read_leaf, right_bound, set_right_bound, write_leaf,
    write_posting_items, MAX_POSTING_ITEMS, RUM_DATA_PAGE_SIZE,
};
use super::ScanDirection;
use crate::error::{RumError, RumResult};
use crate::page::{
    page_alloc_with_fsm, GenericXLog, PageFlags, Relation, RumPage, FIRST_OFFSET_NUMBER,
    INVALID_BLOCK_NUMBER,
};

/// Where a posting tree descent should land.
#[derive(Debug, Clone, Copy)]
pub enum PostingStart {
    First,
    Last,
    At(RumItem),
}

/// Posting tree search and insertion state.
pub struct DataBtree<'a> {
    layout: &'a PostingLayout,
    /// Sorted items to insert, consumed from `cur_item`.
    pub items: Vec<RumItem>,
    pub cur_item: usize,
    search_mode: bool,
    full_scan: Option<ScanDirection>,
    target: RumItem,
    pitem: PostingItem,
    rightblkno: u32,
    /// Cap on downlinks per internal page, when set.
    split_size: Option<usize>,
}

impl<'a> DataBtree<'a> {
    pub fn for_insert(layout: &'a PostingLayout, items: Vec<RumItem>, split_size: Option<usize>) -> Self {
        Self {
            layout,
            items,
            cur_item: 0,
            search_mode: false,
            full_scan: None,
            target: RumItem::min(),
            pitem: PostingItem::default(),
            rightblkno: INVALID_BLOCK_NUMBER,
            split_size,
        }
    }

    pub fn for_search(layout: &'a PostingLayout, start: PostingStart) -> Self {
        let mut btree = Self::for_insert(layout, Vec::new(), None);
        btree.search_mode = true;
        match start {
            PostingStart::First => btree.full_scan = Some(ScanDirection::Forward),
            PostingStart::Last => btree.full_scan = Some(ScanDirection::Backward),
            PostingStart::At(item) => btree.target = item,
        }
        btree
    }

    fn target(&self) -> &RumItem {
        if self.search_mode {
            &self.target
        } else {
            &self.items[self.cur_item]
        }
    }

    fn internal_capacity(&self) -> usize {
        match self.split_size {
            Some(size) if size >= 2 => size.min(MAX_POSTING_ITEMS),
            _ => MAX_POSTING_ITEMS,
        }
    }

    fn appends(&self, page: &RumPage, existing: &[RumItem]) -> bool {
        page.is_rightmost()
            && existing.last().map_or(true, |last| {
                self.layout.compare(&self.items[self.cur_item], last) == Ordering::Greater
            })
    }

    /// Items waiting to go onto `page`: every remaining item when they all
    /// append to the rightmost leaf, otherwise just the next one.
    fn pending_for(&self, page: &RumPage, existing: &[RumItem]) -> usize {
        if self.appends(page, existing) {
            self.items.len() - self.cur_item
        } else {
            1
        }
    }

    fn merged(&self, existing: &[RumItem], pending: usize) -> Vec<RumItem> {
        let new = &self.items[self.cur_item..self.cur_item + pending];
        super::posting::merge_items(self.layout, existing, new)
    }

    fn split_internal(&self, page: &RumPage, off: u16) -> Vec<PostingItem> {
        let mut items = posting_items(page).to_vec();
        let idx = (off - FIRST_OFFSET_NUMBER) as usize;
        if idx < items.len() {
            items[idx].set_child(self.rightblkno);
        }
        items.insert(idx.min(items.len()), self.pitem);
        items
    }
}

/// Largest prefix of `items` that fits on one leaf.
fn fitting_prefix(layout: &PostingLayout, items: &[RumItem]) -> usize {
    let mut size = 0;
    let mut prev = ItemPointer::MIN;
    for (i, item) in items.iter().enumerate() {
        size += encoded_size(layout, item, &prev);
        if size > RUM_DATA_PAGE_SIZE {
            return i;
        }
        prev = item.iptr;
    }
    items.len()
}

/// Index where the encoded bytes of `items` reach half their total.
fn half_point(layout: &PostingLayout, items: &[RumItem]) -> usize {
    let total = super::posting::encoded_items_size(layout, items);
    let mut size = 0;
    let mut prev = ItemPointer::MIN;
    for (i, item) in items.iter().enumerate() {
        size += encoded_size(layout, item, &prev);
        prev = item.iptr;
        if size >= total / 2 {
            return (i + 1).clamp(1, items.len().saturating_sub(1).max(1));
        }
    }
    items.len() / 2
}

impl RumBtree for DataBtree<'_> {
    fn is_data(&self) -> bool {
        true
    }

    fn search_mode(&self) -> bool {
        self.search_mode
    }

    fn full_scan(&self) -> bool {
        self.full_scan.is_some()
    }

    fn is_move_right(&self, page: &RumPage) -> RumResult<bool> {
        if page.is_rightmost() {
            return Ok(false);
        }
        Ok(self.layout.compare(self.target(), &right_bound(page)) == Ordering::Greater)
    }

    fn find_child_page(&self, page: &RumPage, off: &mut u16) -> RumResult<u32> {
        let items = posting_items(page);
        if items.is_empty() {
            return Err(RumError::internal(format!(
                "internal data page has no downlinks (flags {:?})",
                page.flags()
            )));
        }
        let idx = match self.full_scan {
            Some(ScanDirection::Backward) => items.len() - 1,
            Some(_) => 0,
            None => {
                let last = items.len() - 1;
                let rightmost = page.is_rightmost();
                items
                    .iter()
                    .enumerate()
                    .position(|(i, pitem)| {
                        (rightmost && i == last)
                            || self.layout.compare(self.target(), &pitem.item()) != Ordering::Greater
                    })
                    .unwrap_or(last)
            }
        };
        *off = idx as u16 + FIRST_OFFSET_NUMBER;
        Ok(items[idx].child())
    }

    fn get_left_most_page(&self, page: &RumPage) -> RumResult<u32> {
        posting_items(page)
            .first()
            .map(|pitem| pitem.child())
            .ok_or_else(|| RumError::internal("internal data page has no downlinks"))
    }

    fn find_child_ptr(&self, page: &RumPage, blkno: u32, stored_off: u16) -> Option<u16> {
        let items = posting_items(page);
        let stored = stored_off as usize;
        if stored >= 1 && stored <= items.len() && items[stored - 1].child() == blkno {
            return Some(stored_off);
        }
        items
            .iter()
            .position(|pitem| pitem.child() == blkno)
            .map(|idx| idx as u16 + FIRST_OFFSET_NUMBER)
    }

    fn is_enough_space(&self, page: &RumPage, _off: u16) -> RumResult<bool> {
        if page.is_leaf() {
            let existing = read_leaf(self.layout, page)?;
            let pending = self.pending_for(page, &existing);
            let merged = self.merged(&existing, pending);
            Ok(super::posting::leaf_fits(self.layout, &merged))
        } else {
            Ok((page.opaque.maxoff as usize) < self.internal_capacity())
        }
    }

    fn place_to_page(&mut self, page: &mut RumPage, off: u16) -> RumResult<()> {
        if page.is_leaf() {
            let existing = read_leaf(self.layout, page)?;
            let pending = self.pending_for(page, &existing);
            let merged = self.merged(&existing, pending);
            if !write_leaf(self.layout, page, &merged) {
                return Err(RumError::internal("posting list does not fit on data page"));
            }
            self.cur_item += pending;
        } else {
            let items = self.split_internal(page, off);
            write_posting_items(page, &items);
        }
        Ok(())
    }

    fn split_page(
        &mut self,
        page: &RumPage,
        off: u16,
        lpage: &mut RumPage,
        rpage: &mut RumPage,
    ) -> RumResult<()> {
        let old_bound = right_bound(page);
        if page.is_leaf() {
            let existing = read_leaf(self.layout, page)?;
            let pending = self.pending_for(page, &existing);
            let appends = self.appends(page, &existing);
            let merged = self.merged(&existing, pending);
            let (left, right, consumed) = if appends {
                // fill the left page, then as much as fits on the right
                let separator = fitting_prefix(self.layout, &merged).max(1);
                let rest = fitting_prefix(self.layout, &merged[separator..]).max(1);
                let end = (separator + rest).min(merged.len());
                let consumed = end - existing.len();
                (&merged[..separator], &merged[separator..end], consumed)
            } else {
                let separator = half_point(self.layout, &merged);
                (&merged[..separator], &merged[separator..], pending)
            };
            if !write_leaf(self.layout, lpage, left) || !write_leaf(self.layout, rpage, right) {
                return Err(RumError::internal("data page split does not fit"));
            }
            set_right_bound(lpage, *left.last().unwrap_or(&old_bound));
            set_right_bound(rpage, old_bound);
            self.cur_item += consumed;
        } else {
            let items = self.split_internal(page, off);
            let separator = items.len() / 2;
            write_posting_items(lpage, &items[..separator]);
            write_posting_items(rpage, &items[separator..]);
            set_right_bound(lpage, items[separator - 1].item());
            set_right_bound(rpage, old_bound);
        }
        Ok(())
    }

    fn prepare_downlink(&mut self, lblkno: u32, lpage: &RumPage, rblkno: u32) -> RumResult<()> {
        self.pitem = PostingItem::new(lblkno, right_bound(lpage));
        self.rightblkno = rblkno;
        Ok(())
    }

    fn fill_root(
        &self,
        root: &mut RumPage,
        lblkno: u32,
        lpage: &RumPage,
        rblkno: u32,
        rpage: &RumPage,
    ) -> RumResult<()> {
        let items = [
            PostingItem::new(lblkno, right_bound(lpage)),
            PostingItem::new(rblkno, right_bound(rpage)),
        ];
        write_posting_items(root, &items);
        set_right_bound(root, right_bound(rpage));
        Ok(())
    }
}

/// Inserts sorted, distinct `items` into the posting tree at `root`.
pub fn insert_item_pointers(
    rel: &Relation,
    layout: &PostingLayout,
    root: u32,
    items: &[RumItem],
    split_size: Option<usize>,
    mut stats: Option<&mut RumStats>,
) -> RumResult<()> {
    let mut btree = DataBtree::for_insert(layout, items.to_vec(), split_size);
    while btree.cur_item < btree.items.len() {
        let (stack, leaf) = find_leaf_page(&btree, rel, root)?;
        let leaf = leaf.into_exclusive()?;
        insert_value(&mut btree, rel, root, stack, leaf, stats.as_deref_mut())?;
    }
    Ok(())
}

/// Creates a posting tree holding `items` and returns its root block.
pub fn create_posting_tree(
    rel: &Relation,
    layout: &PostingLayout,
    items: &[RumItem],
    split_size: Option<usize>,
    mut stats: Option<&mut RumStats>,
) -> RumResult<u32> {
    let mut page = page_alloc_with_fsm(rel, PageFlags::DATA | PageFlags::LEAF)?;
    if let Some(stats) = stats.as_deref_mut() {
        stats.n_data_pages += 1;
    }
    let root = page.blkno();
    let n = fitting_prefix(layout, items);
    {
        let mut xlog = GenericXLog::start(rel);
        let idx = xlog.register(&mut page, true);
        let image = xlog.page_mut(idx);
        image.init(PageFlags::DATA | PageFlags::LEAF);
        write_leaf(layout, image, &items[..n]);
        set_right_bound(image, RumItem::max());
        xlog.finish();
    }
    drop(page);
    if n < items.len() {
        insert_item_pointers(rel, layout, root, &items[n..], split_size, stats)?;
    }
    log::debug!(
        "created posting tree {} in index \"{}\" with {} items",
        root,
        rel.name(),
        items.len()
    );
    Ok(root)
}

/// Descends a posting tree in search mode and returns the leaf with the
/// estimated number of items in the tree.
pub fn posting_tree_leaf(
    rel: &Relation,
    layout: &PostingLayout,
    root: u32,
    start: PostingStart,
) -> RumResult<(LockedPage, u32)> {
    let btree = DataBtree::for_search(layout, start);
    let (stack, leaf) = find_leaf_page(&btree, rel, root)?;
    let predict = stack
        .top()
        .predict_number
        .saturating_mul(leaf.opaque.maxoff.max(1) as u32);
    Ok((leaf, predict))
}

/// Every item of a posting tree in tree order.
pub fn collect_posting_tree(
    rel: &Relation,
    layout: &PostingLayout,
    root: u32,
) -> RumResult<Vec<RumItem>> {
    let (mut leaf, _) = posting_tree_leaf(rel, layout, root, PostingStart::First)?;
    let mut out = Vec::new();
    loop {
        out.extend(read_leaf(layout, &leaf)?);
        match super::btree::rum_step(rel, leaf, ScanDirection::Forward)? {
            Some(next) => leaf = next,
            None => break,
        }
    }
    Ok(out)
}
