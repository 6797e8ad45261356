//! Entry tree: tuples of `(attnum, category, key)` with either an inline
//! posting list or the root of a posting tree.
//!
//! Tuple layout:
//!
//! ```text
//! t_tid (6) | t_info (2) | attnum (2, multi-column only) | category (1) | key | pad | postings
//! ```
//!
//! On leaves `t_tid` holds the posting list offset and item count, or the
//! posting tree root with [`RUM_TREE_POSTING`] as count. On internal pages
//! it holds the child block.

use std::cmp::Ordering;

use bytemuck::{Pod, Zeroable};
use lending_iterator::{lending_iterator::LendingIteratorඞItem, LendingIterator, HKT};

use super::btree::{rum_step, LockedPage, RumBtree};
use super::item::{ItemPointerData, PostingLayout, RumItem};
use super::posting::decode_items;
use super::ScanDirection;
use crate::datatype::{Datum, TypeInfo};
use crate::error::{RumError, RumResult};
use crate::page::{
    maxalign, maxalign_down, PageFlags, Relation, RumPage, FIRST_OFFSET_NUMBER,
    INVALID_BLOCK_NUMBER, INVALID_OFFSET_NUMBER, RUM_PAGE_SIZE, SIZE_OF_ITEM_ID, SIZE_OF_OPAQUE,
    SIZE_OF_PAGE_HEADER,
};

pub const RUM_TREE_POSTING: u16 = 0xffff;

/// Largest entry tuple; three must fit on a page.
pub const RUM_MAX_ITEM_SIZE: usize = maxalign_down(
    (RUM_PAGE_SIZE - maxalign(SIZE_OF_PAGE_HEADER + 3 * SIZE_OF_ITEM_ID) - maxalign(SIZE_OF_OPAQUE))
        / 3,
);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IndexTupleData {
    t_tid: ItemPointerData,
    t_info: u16,
}

unsafe impl Zeroable for IndexTupleData {}
unsafe impl Pod for IndexTupleData {}

const SIZE_OF_TUPLE_HEADER: usize = std::mem::size_of::<IndexTupleData>();

/// Kind of entry. Real keys sort before every placeholder of the same
/// column, and `EmptyQuery` before everything.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NullCategory {
    EmptyQuery = -1,
    NormKey = 0,
    NullKey = 1,
    EmptyItem = 2,
    NullItem = 3,
    OrderItem = 4,
}

impl NullCategory {
    pub fn from_i8(value: i8) -> RumResult<Self> {
        Ok(match value {
            -1 => NullCategory::EmptyQuery,
            0 => NullCategory::NormKey,
            1 => NullCategory::NullKey,
            2 => NullCategory::EmptyItem,
            3 => NullCategory::NullItem,
            4 => NullCategory::OrderItem,
            _ => {
                return Err(RumError::internal(format!(
                    "invalid entry category {}",
                    value
                )))
            }
        })
    }
}

/// What the entry tree needs to know about the index columns.
pub trait EntryKeyspace {
    fn one_col(&self) -> bool;
    fn key_type(&self, attnum: u16) -> TypeInfo;
    fn compare_keys(&self, attnum: u16, a: &Datum, b: &Datum) -> RumResult<Ordering>;
    fn layout(&self, attnum: u16) -> &PostingLayout;
}

/// A decoded entry: the sort key of the entry tree.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryKey {
    pub attnum: u16,
    pub category: NullCategory,
    pub key: Option<Datum>,
}

impl EntryKey {
    pub fn new(attnum: u16, key: Option<Datum>, category: NullCategory) -> Self {
        Self {
            attnum,
            category,
            key,
        }
    }
}

pub fn compare_entries<K: EntryKeyspace + ?Sized>(
    ks: &K,
    a: &EntryKey,
    b: &EntryKey,
) -> RumResult<Ordering> {
    let ord = a.attnum.cmp(&b.attnum).then(a.category.cmp(&b.category));
    if ord != Ordering::Equal {
        return Ok(ord);
    }
    match (a.category, &a.key, &b.key) {
        (NullCategory::NormKey, Some(ka), Some(kb)) => ks.compare_keys(a.attnum, ka, kb),
        _ => Ok(Ordering::Equal),
    }
}

/// Borrowed view of a stored entry tuple.
#[derive(Clone, Copy)]
pub struct EntryTuple<'a> {
    raw: &'a [u8],
}

impl<'a> EntryTuple<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        Self { raw }
    }

    fn header(&self) -> IndexTupleData {
        bytemuck::pod_read_unaligned(&self.raw[..SIZE_OF_TUPLE_HEADER])
    }

    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn size(&self) -> usize {
        self.header().t_info as usize
    }

    pub fn attnum(&self, one_col: bool) -> u16 {
        if one_col {
            1
        } else {
            u16::from_le_bytes([self.raw[SIZE_OF_TUPLE_HEADER], self.raw[SIZE_OF_TUPLE_HEADER + 1]])
        }
    }

    fn category_pos(one_col: bool) -> usize {
        if one_col {
            SIZE_OF_TUPLE_HEADER
        } else {
            SIZE_OF_TUPLE_HEADER + 2
        }
    }

    pub fn category(&self, one_col: bool) -> RumResult<NullCategory> {
        NullCategory::from_i8(self.raw[Self::category_pos(one_col)] as i8)
    }

    /// Decodes the key and returns it with the end offset of the key part.
    fn key_with_end<K: EntryKeyspace + ?Sized>(&self, ks: &K) -> RumResult<(EntryKey, usize)> {
        let one_col = ks.one_col();
        let attnum = self.attnum(one_col);
        let category = self.category(one_col)?;
        let start = Self::category_pos(one_col) + 1;
        if category != NullCategory::NormKey {
            return Ok((EntryKey::new(attnum, None, category), start));
        }
        let (key, len) = ks.key_type(attnum).read(&self.raw[start..])?;
        Ok((EntryKey::new(attnum, Some(key), category), start + len))
    }

    pub fn entry_key<K: EntryKeyspace + ?Sized>(&self, ks: &K) -> RumResult<EntryKey> {
        Ok(self.key_with_end(ks)?.0)
    }

    pub fn is_posting_tree(&self) -> bool {
        self.header().t_tid.ip_posid == RUM_TREE_POSTING
    }

    fn tid_block(&self) -> u32 {
        let tid = self.header().t_tid;
        ((tid.bi_hi as u32) << 16) | tid.bi_lo as u32
    }

    pub fn posting_tree_root(&self) -> u32 {
        self.tid_block()
    }

    pub fn downlink(&self) -> u32 {
        self.tid_block()
    }

    /// Offset half of `t_tid`, whatever it encodes.
    pub fn tid_offset(&self) -> u16 {
        self.header().t_tid.ip_posid
    }

    pub fn nposting(&self) -> u16 {
        if self.is_posting_tree() {
            0
        } else {
            self.header().t_tid.ip_posid
        }
    }

    pub fn posting_data(&self) -> &'a [u8] {
        if self.is_posting_tree() {
            return &[];
        }
        let start = (self.tid_block() as usize).min(self.raw.len());
        &self.raw[start..self.size().min(self.raw.len())]
    }

    /// Decodes the inline posting list.
    pub fn items<K: EntryKeyspace + ?Sized>(&self, ks: &K) -> RumResult<Vec<RumItem>> {
        let attnum = self.attnum(ks.one_col());
        decode_items(ks.layout(attnum), self.posting_data(), self.nposting() as usize)
    }
}

fn set_tid(raw: &mut [u8], block: u32, posid: u16) {
    let mut header: IndexTupleData = bytemuck::pod_read_unaligned(&raw[..SIZE_OF_TUPLE_HEADER]);
    header.t_tid = ItemPointerData {
        bi_hi: (block >> 16) as u16,
        bi_lo: block as u16,
        ip_posid: posid,
    };
    raw[..SIZE_OF_TUPLE_HEADER].copy_from_slice(bytemuck::bytes_of(&header));
}

fn set_size(raw: &mut [u8]) {
    let mut header: IndexTupleData = bytemuck::pod_read_unaligned(&raw[..SIZE_OF_TUPLE_HEADER]);
    header.t_info = raw.len() as u16;
    raw[..SIZE_OF_TUPLE_HEADER].copy_from_slice(bytemuck::bytes_of(&header));
}

fn key_part<K: EntryKeyspace + ?Sized>(ks: &K, key: &EntryKey) -> RumResult<Vec<u8>> {
    let mut out = vec![0u8; SIZE_OF_TUPLE_HEADER];
    if !ks.one_col() {
        out.extend_from_slice(&key.attnum.to_le_bytes());
    }
    out.push(key.category as i8 as u8);
    if key.category == NullCategory::NormKey {
        let datum = key
            .key
            .as_ref()
            .ok_or_else(|| RumError::internal("normal entry without a key"))?;
        ks.key_type(key.attnum).write(datum, &mut out)?;
    }
    Ok(out)
}

/// Builds a leaf tuple with an inline posting list. Returns `None` when
/// the tuple would exceed [`RUM_MAX_ITEM_SIZE`] and `error_too_big` is off.
pub fn form_tuple<K: EntryKeyspace + ?Sized>(
    ks: &K,
    rel: &Relation,
    key: &EntryKey,
    posting: &[u8],
    nposting: u16,
    error_too_big: bool,
) -> RumResult<Option<Vec<u8>>> {
    let mut raw = key_part(ks, key)?;
    let posting_offset = maxalign(raw.len());
    let size = maxalign(posting_offset + posting.len());
    if size > RUM_MAX_ITEM_SIZE {
        if error_too_big {
            return Err(RumError::limit_exceeded(format!(
                "index row size {} exceeds maximum {} for index \"{}\"",
                size,
                RUM_MAX_ITEM_SIZE,
                rel.name()
            )));
        }
        return Ok(None);
    }
    raw.resize(posting_offset, 0);
    raw.extend_from_slice(posting);
    set_tid(&mut raw, posting_offset as u32, nposting);
    set_size(&mut raw);
    Ok(Some(raw))
}

/// Builds a leaf tuple pointing at the posting tree rooted at `root`.
pub fn form_posting_tree_tuple<K: EntryKeyspace + ?Sized>(
    ks: &K,
    rel: &Relation,
    key: &EntryKey,
    root: u32,
) -> RumResult<Vec<u8>> {
    let mut raw = form_tuple(ks, rel, key, &[], 0, true)?
        .ok_or_else(|| RumError::internal("entry key does not fit"))?;
    set_tid(&mut raw, root, RUM_TREE_POSTING);
    Ok(raw)
}

/// Builds the internal page tuple carrying `tuple`'s key down to `child`.
pub fn form_downlink<K: EntryKeyspace + ?Sized>(
    ks: &K,
    tuple: &EntryTuple<'_>,
    child: u32,
) -> RumResult<Vec<u8>> {
    let (_, end) = tuple.key_with_end(ks)?;
    let mut raw = tuple.raw[..end].to_vec();
    set_tid(&mut raw, child, INVALID_OFFSET_NUMBER);
    set_size(&mut raw);
    Ok(raw)
}

fn set_downlink(raw: &mut [u8], child: u32) {
    set_tid(raw, child, INVALID_OFFSET_NUMBER);
}

pub fn page_tuple(page: &RumPage, off: u16) -> EntryTuple<'_> {
    EntryTuple::new(page.item(off))
}

/// Entry tree search and insertion state.
pub struct EntryBtree<'a, K: EntryKeyspace + ?Sized> {
    ks: &'a K,
    pub key: EntryKey,
    search_mode: bool,
    full_scan: bool,
    /// Tuple to place.
    pub entry: Vec<u8>,
    /// The tuple at the target offset is replaced rather than shifted.
    pub is_delete: bool,
    rightblkno: u32,
}

impl<'a, K: EntryKeyspace + ?Sized> EntryBtree<'a, K> {
    pub fn new(ks: &'a K, key: EntryKey, search_mode: bool) -> Self {
        Self {
            ks,
            key,
            search_mode,
            full_scan: false,
            entry: Vec::new(),
            is_delete: false,
            rightblkno: INVALID_BLOCK_NUMBER,
        }
    }

    /// Descends to the leftmost leaf.
    pub fn full_scan(ks: &'a K) -> Self {
        let mut btree = Self::new(ks, EntryKey::new(1, None, NullCategory::EmptyQuery), true);
        btree.full_scan = true;
        btree
    }

    fn compare_at(&self, page: &RumPage, off: u16) -> RumResult<Ordering> {
        let other = page_tuple(page, off).entry_key(self.ks)?;
        compare_entries(self.ks, &self.key, &other)
    }

    /// Locates the searched key on a leaf. Returns whether it exists; `off`
    /// receives its offset or the insertion point.
    pub fn find_item(&self, page: &RumPage, off: &mut u16) -> RumResult<bool> {
        let maxoff = page.max_offset_number();
        let (mut low, mut high) = (FIRST_OFFSET_NUMBER, maxoff + 1);
        while low < high {
            let mid = low + (high - low) / 2;
            match self.compare_at(page, mid)? {
                Ordering::Equal => {
                    *off = mid;
                    return Ok(true);
                }
                Ordering::Greater => low = mid + 1,
                Ordering::Less => high = mid,
            }
        }
        *off = low;
        Ok(false)
    }

    fn split_tuples(&self, page: &RumPage, off: u16) -> Vec<Vec<u8>> {
        let maxoff = page.max_offset_number();
        let mut tuples = Vec::with_capacity(maxoff as usize + 1);
        for i in FIRST_OFFSET_NUMBER..=maxoff {
            if i == off {
                tuples.push(self.entry.clone());
                if self.is_delete {
                    continue;
                }
                let mut old = page.item(i).to_vec();
                if !page.is_leaf() {
                    set_downlink(&mut old, self.rightblkno);
                }
                tuples.push(old);
            } else {
                tuples.push(page.item(i).to_vec());
            }
        }
        if off > maxoff {
            tuples.push(self.entry.clone());
        }
        tuples
    }
}

impl<K: EntryKeyspace + ?Sized> RumBtree for EntryBtree<'_, K> {
    fn is_data(&self) -> bool {
        false
    }

    fn search_mode(&self) -> bool {
        self.search_mode
    }

    fn full_scan(&self) -> bool {
        self.full_scan
    }

    fn is_move_right(&self, page: &RumPage) -> RumResult<bool> {
        if page.is_rightmost() || page.max_offset_number() == 0 {
            return Ok(false);
        }
        Ok(self.compare_at(page, page.max_offset_number())? == Ordering::Greater)
    }

    fn find_child_page(&self, page: &RumPage, off: &mut u16) -> RumResult<u32> {
        let maxoff = page.max_offset_number();
        if self.full_scan {
            *off = FIRST_OFFSET_NUMBER;
            return Ok(page_tuple(page, FIRST_OFFSET_NUMBER).downlink());
        }
        // first tuple whose key is not below ours; the last tuple of the
        // rightmost page stands for +infinity
        let (mut low, mut high) = (FIRST_OFFSET_NUMBER, maxoff);
        while low < high {
            let mid = low + (high - low) / 2;
            if page.is_rightmost() && mid == maxoff {
                high = mid;
                continue;
            }
            if self.compare_at(page, mid)? == Ordering::Greater {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        *off = low;
        Ok(page_tuple(page, low).downlink())
    }

    fn get_left_most_page(&self, page: &RumPage) -> RumResult<u32> {
        if page.max_offset_number() == 0 {
            return Err(RumError::internal("internal entry page is empty"));
        }
        Ok(page_tuple(page, FIRST_OFFSET_NUMBER).downlink())
    }

    fn find_child_ptr(&self, page: &RumPage, blkno: u32, stored_off: u16) -> Option<u16> {
        let maxoff = page.max_offset_number();
        if stored_off >= FIRST_OFFSET_NUMBER
            && stored_off <= maxoff
            && page_tuple(page, stored_off).downlink() == blkno
        {
            return Some(stored_off);
        }
        (FIRST_OFFSET_NUMBER..=maxoff).find(|&off| page_tuple(page, off).downlink() == blkno)
    }

    fn is_enough_space(&self, page: &RumPage, off: u16) -> RumResult<bool> {
        let mut release = 0;
        if self.is_delete {
            release = maxalign(page.item_id(off).lp_len()) + SIZE_OF_ITEM_ID;
        }
        Ok(page.free_space() + release >= maxalign(self.entry.len()))
    }

    fn place_to_page(&mut self, page: &mut RumPage, off: u16) -> RumResult<()> {
        if !page.is_leaf() {
            set_downlink(page.item_mut(off), self.rightblkno);
        }
        if self.is_delete {
            page.delete_item(off);
        }
        page.add_item(&self.entry, Some(off)).ok_or_else(|| {
            RumError::internal(format!("failed to add item to index page at offset {}", off))
        })?;
        Ok(())
    }

    fn split_page(
        &mut self,
        page: &RumPage,
        off: u16,
        lpage: &mut RumPage,
        rpage: &mut RumPage,
    ) -> RumResult<()> {
        let tuples = self.split_tuples(page, off);
        let total: usize = tuples
            .iter()
            .map(|t| maxalign(t.len()) + SIZE_OF_ITEM_ID)
            .sum();
        let mut left_size = 0;
        let mut separator = tuples.len() - 1;
        for (i, tuple) in tuples.iter().enumerate() {
            left_size += maxalign(tuple.len()) + SIZE_OF_ITEM_ID;
            if left_size > total / 2 {
                separator = i.max(1).min(tuples.len() - 1);
                break;
            }
        }
        for (i, tuple) in tuples.iter().enumerate() {
            let target = if i < separator { &mut *lpage } else { &mut *rpage };
            target
                .add_item(tuple, None)
                .ok_or_else(|| RumError::internal("entry page split does not fit"))?;
        }
        Ok(())
    }

    fn prepare_downlink(&mut self, lblkno: u32, lpage: &RumPage, rblkno: u32) -> RumResult<()> {
        let last = page_tuple(lpage, lpage.max_offset_number());
        self.entry = form_downlink(self.ks, &last, lblkno)?;
        self.is_delete = false;
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
        for (blkno, page) in [(lblkno, lpage), (rblkno, rpage)] {
            let last = page_tuple(page, page.max_offset_number());
            let downlink = form_downlink(self.ks, &last, blkno)?;
            root.add_item(&downlink, None)
                .ok_or_else(|| RumError::internal("new entry root does not fit"))?;
        }
        Ok(())
    }
}

/// A tuple yielded by [`entry_leaf_iter`] with its position.
pub struct EntryLeafItem<'a> {
    pub blkno: u32,
    pub offset: u16,
    pub tuple: EntryTuple<'a>,
}

/// Walks entry leaves from `start` at `offset` to the right end of the
/// leaf level, holding one share locked page at a time.
pub fn entry_leaf_iter(
    rel: &Relation,
    start: LockedPage,
    offset: u16,
) -> impl LendingIterator
       + for<'a> LendingIteratorඞItem<'a, T = RumResult<EntryLeafItem<'a>>>
       + '_ {
    struct TmpState<'r> {
        rel: &'r Relation,
        page: Option<LockedPage>,
        offset: u16,
        started: bool,
    }

    let state = TmpState {
        rel,
        page: Some(start),
        offset,
        started: false,
    };

    lending_iterator::from_fn::<HKT!(RumResult<EntryLeafItem<'_>>), _, _>(state, |state| {
        if state.started {
            state.offset += 1;
        }
        state.started = true;
        loop {
            let page = state.page.take()?;
            if state.offset >= FIRST_OFFSET_NUMBER && state.offset <= page.max_offset_number() {
                state.page = Some(page);
                break;
            }
            if let Err(err) = state.rel.check_for_interrupts() {
                return Some(Err(err));
            }
            match rum_step(state.rel, page, ScanDirection::Forward) {
                Ok(Some(next)) => {
                    state.page = Some(next);
                    state.offset = FIRST_OFFSET_NUMBER;
                }
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
        let page = state.page.as_ref()?;
        Some(Ok(EntryLeafItem {
            blkno: page.blkno(),
            offset: state.offset,
            tuple: page_tuple(page, state.offset),
        }))
    })
}

/// Whether `page` is an entry leaf.
pub fn is_entry_leaf(page: &RumPage) -> bool {
    page.flags().contains(PageFlags::LEAF) && !page.is_data()
}
