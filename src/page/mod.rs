mod buffer;
mod inspector;
mod xlog;

use bytemuck::{Pod, Zeroable};

pub use buffer::{Buffer, PageReadGuard, PageWriteGuard, Relation};
pub use inspector::{meta_page_info, page_get_data_items, page_get_entries, page_get_stats};
pub use xlog::GenericXLog;

use crate::error::{RumError, RumResult};

pub const RUM_PAGE_SIZE: usize = 8192;
pub const INVALID_BLOCK_NUMBER: u32 = u32::MAX;
pub const INVALID_OFFSET_NUMBER: u16 = 0;
pub const FIRST_OFFSET_NUMBER: u16 = 1;

pub const METAPAGE_BLKNO: u32 = 0;
pub const ROOT_BLKNO: u32 = 1;

pub const PAGE_LAYOUT_VERSION: u16 = 4;
pub const SIZE_OF_PAGE_HEADER: usize = std::mem::size_of::<PageHeaderData>();
pub const SIZE_OF_OPAQUE: usize = std::mem::size_of::<RumPageOpaque>();
pub const SIZE_OF_ITEM_ID: usize = std::mem::size_of::<ItemIdData>();
pub const PAGE_SPECIAL_OFFSET: usize = RUM_PAGE_SIZE - SIZE_OF_OPAQUE;

const CONTENT_SIZE: usize = RUM_PAGE_SIZE - SIZE_OF_PAGE_HEADER - SIZE_OF_OPAQUE;

#[inline]
pub const fn maxalign(len: usize) -> usize {
    (len + 7) & !7
}

#[inline]
pub const fn maxalign_down(len: usize) -> usize {
    len & !7
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const DATA = 1 << 0;
        const LEAF = 1 << 1;
        const DELETED = 1 << 2;
        const META = 1 << 3;
        const LIST = 1 << 4;
        const LIST_FULLROW = 1 << 5;
        const HALF_DEAD = 1 << 6;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageHeaderData {
    pub pd_lsn: u64,
    pub pd_checksum: u16,
    pub pd_flags: u16,
    pub pd_lower: u16,
    pub pd_upper: u16,
    pub pd_special: u16,
    pub pd_pagesize_version: u16,
    pub pd_prune_xid: u32,
}

unsafe impl Zeroable for PageHeaderData {}
unsafe impl Pod for PageHeaderData {}

/// Trailer of every index page.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RumPageOpaque {
    pub leftlink: u32,
    pub rightlink: u32,
    /// Item count on data pages; entry pages use the line pointer count.
    pub maxoff: u16,
    pub freespace: u16,
    pub flags: u16,
    pub epoch: u16,
}

unsafe impl Zeroable for RumPageOpaque {}
unsafe impl Pod for RumPageOpaque {}

/// Line pointer: `lp_off:15, lp_flags:2, lp_len:15`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemIdData(u32);

unsafe impl Zeroable for ItemIdData {}
unsafe impl Pod for ItemIdData {}

pub const LP_UNUSED: u8 = 0;
pub const LP_NORMAL: u8 = 1;

impl ItemIdData {
    pub fn new(off: u16, len: u16) -> Self {
        Self((off as u32 & 0x7fff) | ((LP_NORMAL as u32) << 15) | ((len as u32 & 0x7fff) << 17))
    }
    pub fn lp_off(self) -> usize {
        (self.0 & 0x7fff) as usize
    }
    pub fn lp_flags(self) -> u8 {
        ((self.0 >> 15) & 0x3) as u8
    }
    pub fn lp_len(self) -> usize {
        (self.0 >> 17) as usize
    }
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct RumPage {
    pub header: PageHeaderData,
    content: [u8; CONTENT_SIZE],
    pub opaque: RumPageOpaque,
}

unsafe impl Zeroable for RumPage {}
unsafe impl Pod for RumPage {}

const _: () = assert!(std::mem::size_of::<RumPage>() == RUM_PAGE_SIZE);

impl RumPage {
    /// Formats the page as an empty index page with the given flags.
    pub fn init(&mut self, flags: PageFlags) {
        *self = Zeroable::zeroed();
        self.header.pd_lower = SIZE_OF_PAGE_HEADER as u16;
        self.header.pd_upper = PAGE_SPECIAL_OFFSET as u16;
        self.header.pd_special = PAGE_SPECIAL_OFFSET as u16;
        self.header.pd_pagesize_version = RUM_PAGE_SIZE as u16 | PAGE_LAYOUT_VERSION;
        self.opaque.leftlink = INVALID_BLOCK_NUMBER;
        self.opaque.rightlink = INVALID_BLOCK_NUMBER;
        self.opaque.flags = flags.bits();
        self.opaque.freespace = 0;
    }

    /// Copies a raw page image, as returned by [`Relation::get_raw_page`].
    pub fn from_bytes(raw: &[u8]) -> RumResult<Box<RumPage>> {
        if raw.len() != RUM_PAGE_SIZE {
            return Err(RumError::bad_value("invalid page size").with_detail(format!(
                "Expected {} bytes, got {}.",
                RUM_PAGE_SIZE,
                raw.len()
            )));
        }
        let mut page: Box<RumPage> = bytemuck::zeroed_box();
        page.as_bytes_mut().copy_from_slice(raw);
        Ok(page)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::bytes_of_mut(self)
    }

    pub fn is_new(&self) -> bool {
        self.header.pd_upper == 0
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_retain(self.opaque.flags)
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.opaque.flags |= flags.bits();
    }

    pub fn clear_flags(&mut self, flags: PageFlags) {
        self.opaque.flags &= !flags.bits();
    }

    pub fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    pub fn is_data(&self) -> bool {
        self.flags().contains(PageFlags::DATA)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags().contains(PageFlags::DELETED)
    }

    pub fn is_half_dead(&self) -> bool {
        self.flags().contains(PageFlags::HALF_DEAD)
    }

    pub fn is_rightmost(&self) -> bool {
        self.opaque.rightlink == INVALID_BLOCK_NUMBER
    }

    pub fn is_leftmost(&self) -> bool {
        self.opaque.leftlink == INVALID_BLOCK_NUMBER
    }

    /// Bytes between the page header and the opaque trailer.
    pub fn data(&self) -> &[u8] {
        &self.content
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.content
    }

    pub fn as_ref<T: Pod>(&self) -> &T {
        bytemuck::from_bytes(&self.content[..std::mem::size_of::<T>()])
    }

    pub fn as_mut<T: Pod>(&mut self) -> &mut T {
        bytemuck::from_bytes_mut(&mut self.content[..std::mem::size_of::<T>()])
    }

    // line pointer pages

    pub fn max_offset_number(&self) -> u16 {
        let lower = self.header.pd_lower as usize;
        if lower <= SIZE_OF_PAGE_HEADER {
            0
        } else {
            ((lower - SIZE_OF_PAGE_HEADER) / SIZE_OF_ITEM_ID) as u16
        }
    }

    pub fn item_id(&self, offset: u16) -> ItemIdData {
        debug_assert!(offset >= FIRST_OFFSET_NUMBER && offset <= self.max_offset_number());
        let start = (offset as usize - 1) * SIZE_OF_ITEM_ID;
        *bytemuck::from_bytes(&self.content[start..start + SIZE_OF_ITEM_ID])
    }

    fn set_item_id(&mut self, offset: u16, item_id: ItemIdData) {
        let start = (offset as usize - 1) * SIZE_OF_ITEM_ID;
        self.content[start..start + SIZE_OF_ITEM_ID].copy_from_slice(bytemuck::bytes_of(&item_id));
    }

    pub fn item(&self, offset: u16) -> &[u8] {
        let item_id = self.item_id(offset);
        &self.as_bytes()[item_id.lp_off()..item_id.lp_off() + item_id.lp_len()]
    }

    pub fn item_mut(&mut self, offset: u16) -> &mut [u8] {
        let item_id = self.item_id(offset);
        &mut self.as_bytes_mut()[item_id.lp_off()..item_id.lp_off() + item_id.lp_len()]
    }

    /// Space left for one more item, after accounting for its line pointer.
    pub fn free_space(&self) -> usize {
        let space = self.header.pd_upper as usize - self.header.pd_lower as usize;
        space.saturating_sub(SIZE_OF_ITEM_ID)
    }

    /// Inserts `item` at `offset`, shifting later line pointers. `None`
    /// appends. Returns the offset used, or `None` when it does not fit.
    pub fn add_item(&mut self, item: &[u8], offset: Option<u16>) -> Option<u16> {
        let max = self.max_offset_number();
        let offset = offset.unwrap_or(max + 1);
        if offset == INVALID_OFFSET_NUMBER || offset > max + 1 {
            return None;
        }
        let aligned = maxalign(item.len());
        if self.free_space() < aligned {
            return None;
        }
        let upper = self.header.pd_upper as usize - aligned;
        self.as_bytes_mut()[upper..upper + item.len()].copy_from_slice(item);
        for i in (offset..=max).rev() {
            let moved = self.item_id(i);
            self.set_item_id(i + 1, moved);
        }
        self.header.pd_lower += SIZE_OF_ITEM_ID as u16;
        self.header.pd_upper = upper as u16;
        self.set_item_id(offset, ItemIdData::new(upper as u16, item.len() as u16));
        Some(offset)
    }

    /// Removes the item at `offset` and compacts both the line pointer array
    /// and the item bodies.
    pub fn delete_item(&mut self, offset: u16) {
        let max = self.max_offset_number();
        debug_assert!(offset >= FIRST_OFFSET_NUMBER && offset <= max);
        let victim = self.item_id(offset);
        let (off, size) = (victim.lp_off(), maxalign(victim.lp_len()));
        let upper = self.header.pd_upper as usize;
        self.as_bytes_mut().copy_within(upper..off, upper + size);
        for i in offset..max {
            let moved = self.item_id(i + 1);
            self.set_item_id(i, moved);
        }
        self.header.pd_lower -= SIZE_OF_ITEM_ID as u16;
        self.header.pd_upper += size as u16;
        for i in FIRST_OFFSET_NUMBER..max {
            let item_id = self.item_id(i);
            if item_id.lp_off() < off {
                let shifted = ItemIdData::new((item_id.lp_off() + size) as u16, item_id.lp_len() as u16);
                self.set_item_id(i, shifted);
            }
        }
    }

    /// Replaces the item at `offset` with `item`, returning false when the
    /// replacement does not fit.
    pub fn replace_item(&mut self, offset: u16, item: &[u8]) -> bool {
        let old_len = maxalign(self.item_id(offset).lp_len());
        if self.free_space() + SIZE_OF_ITEM_ID + old_len < maxalign(item.len()) {
            return false;
        }
        self.delete_item(offset);
        self.add_item(item, Some(offset)).is_some()
    }
}

/// Reads `blkno` under a share lock.
pub fn page_read(rel: &Relation, blkno: u32) -> RumResult<PageReadGuard> {
    Ok(rel.read_buffer(blkno)?.lock_share())
}

/// Reads `blkno` under an exclusive lock.
pub fn page_write(rel: &Relation, blkno: u32) -> RumResult<PageWriteGuard> {
    Ok(rel.read_buffer(blkno)?.lock_exclusive())
}

/// Returns an exclusively locked page that nobody else references: either a
/// recycled page from the free space map or a fresh block at the end of the
/// relation. The page content is unspecified.
pub fn rum_new_buffer(rel: &Relation) -> RumResult<PageWriteGuard> {
    while let Some(blkno) = rel.get_free_page() {
        let buffer = rel.read_buffer(blkno)?;
        // a stale map entry or a page someone else is holding: try the next one
        if let Ok(page) = buffer.conditional_lock_exclusive() {
            if page.is_new() || page.is_deleted() {
                return Ok(page);
            }
        }
    }
    let buffer = rel.extend()?;
    Ok(buffer.lock_exclusive())
}

/// Allocates a page through [`rum_new_buffer`] and formats it with `flags`.
pub fn page_alloc_with_fsm(rel: &Relation, flags: PageFlags) -> RumResult<PageWriteGuard> {
    let mut page = rum_new_buffer(rel)?;
    page.init(flags);
    Ok(page)
}

/// Gives `blkno` back to the free space map.
pub fn page_free(rel: &Relation, blkno: u32) {
    rel.record_free_page(blkno);
}
