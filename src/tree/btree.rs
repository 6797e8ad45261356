//! Descent, page split and downlink insertion shared by the entry tree and
//! the posting trees. The two trees plug their page formats in through
//! [`RumBtree`].

use std::ops::Deref;

use super::meta::RumStats;
use super::ScanDirection;
use crate::error::{RumError, RumResult};
use crate::page::{
    page_alloc_with_fsm, page_read, page_write, Buffer, GenericXLog, PageFlags, PageReadGuard,
    PageWriteGuard, Relation, RumPage, INVALID_BLOCK_NUMBER, INVALID_OFFSET_NUMBER,
};

/// A page held under either lock mode.
pub enum LockedPage {
    Share(PageReadGuard),
    Exclusive(PageWriteGuard),
}

impl Deref for LockedPage {
    type Target = RumPage;

    fn deref(&self) -> &RumPage {
        match self {
            LockedPage::Share(page) => page,
            LockedPage::Exclusive(page) => page,
        }
    }
}

impl LockedPage {
    pub fn blkno(&self) -> u32 {
        match self {
            LockedPage::Share(page) => page.blkno(),
            LockedPage::Exclusive(page) => page.blkno(),
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockedPage::Exclusive(_))
    }

    /// Releases the lock and keeps the pin.
    pub fn unlock(self) -> Buffer {
        match self {
            LockedPage::Share(page) => page.unlock(),
            LockedPage::Exclusive(page) => page.unlock(),
        }
    }

    pub fn into_exclusive(self) -> RumResult<PageWriteGuard> {
        match self {
            LockedPage::Exclusive(page) => Ok(page),
            LockedPage::Share(page) => Err(RumError::internal(format!(
                "block {} is not locked exclusively",
                page.blkno()
            ))),
        }
    }

    fn relock(buffer: Buffer, exclusive: bool) -> LockedPage {
        if exclusive {
            LockedPage::Exclusive(buffer.lock_exclusive())
        } else {
            LockedPage::Share(buffer.lock_share())
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StackEntry {
    pub blkno: u32,
    /// Offset of the downlink followed from this page, or of the leaf item.
    pub off: u16,
    /// Estimated number of leaf pages under this page.
    pub predict_number: u32,
}

/// Path from the root to the current page, root first.
#[derive(Debug, Clone)]
pub struct BtreeStack {
    pub entries: Vec<StackEntry>,
}

impl BtreeStack {
    fn new(root: u32) -> Self {
        Self {
            entries: vec![StackEntry {
                blkno: root,
                off: INVALID_OFFSET_NUMBER,
                predict_number: 1,
            }],
        }
    }

    /// The stack starts at the root and only grows.
    pub fn top(&self) -> &StackEntry {
        &self.entries[self.entries.len() - 1]
    }

    pub fn top_mut(&mut self) -> &mut StackEntry {
        let level = self.entries.len() - 1;
        &mut self.entries[level]
    }
}

pub trait RumBtree {
    fn is_data(&self) -> bool;

    /// Read only descent: leaves are share locked.
    fn search_mode(&self) -> bool;

    /// Descend along the leftmost (or rightmost) path without comparing.
    fn full_scan(&self) -> bool {
        false
    }

    /// Whether the searched key lies beyond this page.
    fn is_move_right(&self, page: &RumPage) -> RumResult<bool>;

    /// Picks the downlink to follow on an internal page and stores its
    /// offset in `off`.
    fn find_child_page(&self, page: &RumPage, off: &mut u16) -> RumResult<u32>;

    fn get_left_most_page(&self, page: &RumPage) -> RumResult<u32>;

    /// Offset of the downlink to `blkno` on an internal page. `stored_off`
    /// is tried first.
    fn find_child_ptr(&self, page: &RumPage, blkno: u32, stored_off: u16) -> Option<u16>;

    fn is_enough_space(&self, page: &RumPage, off: u16) -> RumResult<bool>;

    fn place_to_page(&mut self, page: &mut RumPage, off: u16) -> RumResult<()>;

    /// Distributes the content of `page` plus the pending insertion over
    /// `lpage` and `rpage`, which arrive formatted with the page flags.
    fn split_page(
        &mut self,
        page: &RumPage,
        off: u16,
        lpage: &mut RumPage,
        rpage: &mut RumPage,
    ) -> RumResult<()>;

    /// Turns the pending insertion into the downlink for `lblkno` whose
    /// existing parent pointer moves to `rblkno`.
    fn prepare_downlink(&mut self, lblkno: u32, lpage: &RumPage, rblkno: u32) -> RumResult<()>;

    fn fill_root(
        &self,
        root: &mut RumPage,
        lblkno: u32,
        lpage: &RumPage,
        rblkno: u32,
        rpage: &RumPage,
    ) -> RumResult<()>;
}

fn page_items(page: &RumPage) -> u32 {
    if page.is_data() {
        page.opaque.maxoff as u32
    } else {
        page.max_offset_number() as u32
    }
}

/// Share locks a page, upgrading leaves to exclusive for inserters. The
/// root may stop being a leaf while unlocked, hence the recheck.
fn traverse_lock(buffer: Buffer, search_mode: bool) -> LockedPage {
    let page = buffer.lock_share();
    if search_mode || !page.is_leaf() {
        return LockedPage::Share(page);
    }
    let page = page.unlock().lock_exclusive();
    if page.is_leaf() {
        LockedPage::Exclusive(page)
    } else {
        LockedPage::Share(page.unlock().lock_share())
    }
}

/// Moves to the sibling in `direction`, keeping the lock mode. Deleted
/// pages are passed over through their own links, which deletion leaves
/// intact. Returns `None` at the end of the level.
pub fn rum_step(
    rel: &Relation,
    page: LockedPage,
    direction: ScanDirection,
) -> RumResult<Option<LockedPage>> {
    let exclusive = page.is_exclusive();
    let (is_leaf, is_data) = (page.is_leaf(), page.is_data());
    let link = |page: &RumPage| match direction {
        ScanDirection::Backward => page.opaque.leftlink,
        _ => page.opaque.rightlink,
    };
    let mut next = link(&*page);
    let mut current = page;
    loop {
        if next == INVALID_BLOCK_NUMBER {
            return Ok(None);
        }
        let buffer = rel.read_buffer(next)?;
        drop(current);
        let page = LockedPage::relock(buffer, exclusive);
        if page.is_deleted() {
            next = link(&*page);
            current = page;
            continue;
        }
        if page.is_leaf() != is_leaf || page.is_data() != is_data {
            return Err(RumError::internal(
                "right sibling of RUM page is of different type",
            ));
        }
        return Ok(Some(page));
    }
}

/// Descends from `root_blkno` to the leaf responsible for the searched key.
/// Parents are unlocked before children are locked; concurrent splits are
/// caught up with by moving right.
pub fn find_leaf_page<B: RumBtree + ?Sized>(
    btree: &B,
    rel: &Relation,
    root_blkno: u32,
) -> RumResult<(BtreeStack, LockedPage)> {
    let mut stack = BtreeStack::new(root_blkno);
    let mut page = traverse_lock(rel.read_buffer(root_blkno)?, btree.search_mode());
    loop {
        rel.check_for_interrupts()?;
        while page.is_deleted() || (!btree.full_scan() && btree.is_move_right(&page)?) {
            let Some(next) = rum_step(rel, page, ScanDirection::Forward)? else {
                return Err(RumError::internal(format!(
                    "ran off the end of a level in index \"{}\"",
                    rel.name()
                )));
            };
            page = next;
            stack.top_mut().blkno = page.blkno();
        }
        if page.is_leaf() {
            return Ok((stack, page));
        }
        let mut off = INVALID_OFFSET_NUMBER;
        let child = btree.find_child_page(&page, &mut off)?;
        let predict_number = stack.top().predict_number.saturating_mul(page_items(&page).max(1));
        stack.top_mut().off = off;
        let buffer = rel.read_buffer(child)?;
        drop(page);
        stack.entries.push(StackEntry {
            blkno: child,
            off: INVALID_OFFSET_NUMBER,
            predict_number,
        });
        page = traverse_lock(buffer, btree.search_mode());
    }
}

fn count_new_page(stats: &mut Option<&mut RumStats>, is_data: bool) {
    if let Some(stats) = stats.as_deref_mut() {
        if is_data {
            stats.n_data_pages += 1;
        } else {
            stats.n_entry_pages += 1;
        }
    }
}

/// Locks the parent of `child`, recorded at `stack.entries[level - 1]`.
/// The remembered page is tried first, moving right; if the tree grew a
/// level since the descent the search restarts from the root.
fn find_parent<B: RumBtree + ?Sized>(
    btree: &B,
    rel: &Relation,
    root_blkno: u32,
    stack: &mut BtreeStack,
    level: usize,
    child: u32,
) -> RumResult<PageWriteGuard> {
    let stored_off = stack.entries[level - 1].off;
    let mut blkno = stack.entries[level - 1].blkno;
    let mut page = page_write(rel, blkno)?;
    loop {
        if !page.is_deleted() && !page.is_leaf() {
            if let Some(off) = btree.find_child_ptr(&page, child, stored_off) {
                stack.entries[level - 1].blkno = blkno;
                stack.entries[level - 1].off = off;
                return Ok(page);
            }
        }
        if page.is_rightmost() {
            break;
        }
        blkno = page.opaque.rightlink;
        page = page_write(rel, blkno)?;
    }
    drop(page);

    let mut leftmost = root_blkno;
    loop {
        let first = page_read(rel, leftmost)?;
        if first.is_leaf() {
            return Err(RumError::internal(format!(
                "failed to re-find parent of block {} in index \"{}\"",
                child,
                rel.name()
            )));
        }
        let next_leftmost = btree.get_left_most_page(&first)?;
        drop(first);
        let mut blkno = leftmost;
        loop {
            let page = page_write(rel, blkno)?;
            if let Some(off) = btree.find_child_ptr(&page, child, INVALID_OFFSET_NUMBER) {
                stack.entries[level - 1].blkno = blkno;
                stack.entries[level - 1].off = off;
                return Ok(page);
            }
            if page.is_rightmost() {
                break;
            }
            blkno = page.opaque.rightlink;
        }
        leftmost = next_leftmost;
    }
}

fn split_root<B: RumBtree + ?Sized>(
    btree: &mut B,
    rel: &Relation,
    root: &mut PageWriteGuard,
    off: u16,
    stats: &mut Option<&mut RumStats>,
) -> RumResult<()> {
    let flags = root.flags() & (PageFlags::DATA | PageFlags::LEAF);
    let mut lpage = page_alloc_with_fsm(rel, flags)?;
    let mut rpage = page_alloc_with_fsm(rel, flags)?;
    count_new_page(stats, btree.is_data());
    count_new_page(stats, btree.is_data());
    let (lblkno, rblkno) = (lpage.blkno(), rpage.blkno());

    let mut left: Box<RumPage> = bytemuck::zeroed_box();
    let mut right: Box<RumPage> = bytemuck::zeroed_box();
    left.init(flags);
    right.init(flags);
    btree.split_page(root, off, &mut left, &mut right)?;
    left.opaque.rightlink = rblkno;
    right.opaque.leftlink = lblkno;

    let mut new_root: Box<RumPage> = bytemuck::zeroed_box();
    new_root.init(flags - PageFlags::LEAF);
    btree.fill_root(&mut new_root, lblkno, &left, rblkno, &right)?;

    let mut xlog = GenericXLog::start(rel);
    let r = xlog.register(root, true);
    *xlog.page_mut(r) = *new_root;
    let l = xlog.register(&mut lpage, true);
    *xlog.page_mut(l) = *left;
    let rr = xlog.register(&mut rpage, true);
    *xlog.page_mut(rr) = *right;
    xlog.finish();
    log::debug!(
        "split root {} of index \"{}\" into {} and {}",
        root.blkno(),
        rel.name(),
        lblkno,
        rblkno
    );
    Ok(())
}

/// Inserts the pending value of `btree` at the leaf on top of `stack`,
/// splitting pages and inserting downlinks upward as needed. Locks are
/// taken left, right, then parent.
pub fn insert_value<B: RumBtree + ?Sized>(
    btree: &mut B,
    rel: &Relation,
    root_blkno: u32,
    mut stack: BtreeStack,
    leaf: PageWriteGuard,
    mut stats: Option<&mut RumStats>,
) -> RumResult<()> {
    let mut page = leaf;
    let mut level = stack.entries.len() - 1;
    loop {
        let off = stack.entries[level].off;
        if btree.is_enough_space(&page, off)? {
            let mut xlog = GenericXLog::start(rel);
            let idx = xlog.register(&mut page, false);
            btree.place_to_page(xlog.page_mut(idx), off)?;
            xlog.finish();
            return Ok(());
        }

        let blkno = page.blkno();
        if blkno == root_blkno {
            return split_root(btree, rel, &mut page, off, &mut stats);
        }

        let flags = page.flags() & (PageFlags::DATA | PageFlags::LEAF);
        let mut rpage = page_alloc_with_fsm(rel, flags)?;
        count_new_page(&mut stats, btree.is_data());
        let rblkno = rpage.blkno();

        let mut left: Box<RumPage> = bytemuck::zeroed_box();
        let mut right: Box<RumPage> = bytemuck::zeroed_box();
        left.init(flags);
        right.init(flags);
        btree.split_page(&page, off, &mut left, &mut right)?;
        let old_right = page.opaque.rightlink;
        left.opaque.leftlink = page.opaque.leftlink;
        left.opaque.rightlink = rblkno;
        right.opaque.leftlink = blkno;
        right.opaque.rightlink = old_right;

        let mut right_sibling = if old_right != INVALID_BLOCK_NUMBER {
            Some(page_write(rel, old_right)?)
        } else {
            None
        };
        let mut xlog = GenericXLog::start(rel);
        let l = xlog.register(&mut page, true);
        *xlog.page_mut(l) = *left;
        let r = xlog.register(&mut rpage, true);
        *xlog.page_mut(r) = *right;
        if let Some(sibling) = right_sibling.as_mut() {
            let s = xlog.register(sibling, false);
            xlog.page_mut(s).opaque.leftlink = rblkno;
        }
        xlog.finish();
        drop(right_sibling);
        drop(rpage);
        log::debug!(
            "split {} page {} of index \"{}\", new right sibling {}",
            if btree.is_data() { "data" } else { "entry" },
            blkno,
            rel.name(),
            rblkno
        );

        btree.prepare_downlink(blkno, &left, rblkno)?;
        if level == 0 {
            stack.entries.insert(
                0,
                StackEntry {
                    blkno: root_blkno,
                    off: INVALID_OFFSET_NUMBER,
                    predict_number: 1,
                },
            );
            level += 1;
        }
        let parent = find_parent(btree, rel, root_blkno, &mut stack, level, blkno)?;
        drop(page);
        page = parent;
        level -= 1;
    }
}
