//! Compressed posting lists.
//!
//! Default order stores each item pointer as a varbyte delta against the
//! previous one: the block increment in 7-bit groups, then the offset in
//! 7-bit groups whose last byte keeps 6 bits and uses bit 6 as the
//! "AddInfo is null" flag. The AddInfo word follows, unaligned, when not
//! null. Alternative order stores raw 6-byte item pointers with the null
//! flag in the high bit of the offset, since items are not sorted by
//! pointer there.

use bytemuck::{Pod, Zeroable};

use super::item::{ItemPointer, ItemPointerData, PostingLayout, RumItem, RumItemData};
use crate::error::{RumError, RumResult};
use crate::page::{
    RumPage, INVALID_OFFSET_NUMBER, RUM_PAGE_SIZE, SIZE_OF_OPAQUE, SIZE_OF_PAGE_HEADER,
};

const HIGHBIT: u8 = 0x80;
pub const SEVENTHBIT: u8 = 0x40;
pub const SIXMASK: u8 = 0x3f;
pub const ALT_ADD_INFO_NULL_FLAG: u16 = 0x8000;

pub const RUM_DATA_LEAF_INDEX_COUNT: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RumDataLeafItemIndex {
    pub iptr: ItemPointerData,
    pub offset_number: u16,
    pub page_offset: u16,
    pub add_info_is_null: u8,
    pub _pad: [u8; 5],
    pub add_info: u64,
}

unsafe impl Zeroable for RumDataLeafItemIndex {}
unsafe impl Pod for RumDataLeafItemIndex {}

const SIZE_OF_RIGHT_BOUND: usize = std::mem::size_of::<RumItemData>();
const SIZE_OF_LEAF_INDEX: usize =
    std::mem::size_of::<RumDataLeafItemIndex>() * RUM_DATA_LEAF_INDEX_COUNT;

/// Bytes available for encoded items on a data leaf page.
pub const RUM_DATA_PAGE_SIZE: usize =
    RUM_PAGE_SIZE - SIZE_OF_PAGE_HEADER - SIZE_OF_RIGHT_BOUND - SIZE_OF_OPAQUE - SIZE_OF_LEAF_INDEX;

/// Offset of the item area inside [`RumPage::data`].
pub const DATA_START: usize = SIZE_OF_RIGHT_BOUND;

impl RumDataLeafItemIndex {
    pub fn item(&self) -> RumItem {
        RumItem {
            iptr: self.iptr.into(),
            add_info_is_null: self.add_info_is_null != 0,
            add_info: self.add_info,
        }
    }
}

fn write_add_info(layout: &PostingLayout, out: &mut Vec<u8>, item: &RumItem) {
    if item.add_info_is_null {
        return;
    }
    let len = layout
        .add_info_type
        .map(|ty| ty.len().max(0) as usize)
        .unwrap_or(8);
    out.extend_from_slice(&item.add_info.to_le_bytes()[..len]);
}

fn add_info_len(layout: &PostingLayout, item: &RumItem) -> usize {
    if item.add_info_is_null {
        0
    } else {
        layout
            .add_info_type
            .map(|ty| ty.len().max(0) as usize)
            .unwrap_or(8)
    }
}

/// Appends the encoding of `item` following `prev`.
pub fn encode_item(layout: &PostingLayout, out: &mut Vec<u8>, item: &RumItem, prev: &ItemPointer) {
    if layout.alternative_order {
        let mut data: ItemPointerData = item.iptr.into();
        if item.add_info_is_null {
            data.ip_posid |= ALT_ADD_INFO_NULL_FLAG;
        }
        out.extend_from_slice(bytemuck::bytes_of(&data));
    } else {
        debug_assert!(item.iptr.block >= prev.block);
        let mut block_incr = item.iptr.block - prev.block;
        loop {
            let more = block_incr >= HIGHBIT as u32;
            out.push((block_incr as u8 & !HIGHBIT) | if more { HIGHBIT } else { 0 });
            if !more {
                break;
            }
            block_incr >>= 7;
        }
        let mut offset = item.iptr.offset;
        loop {
            if offset >= SEVENTHBIT as u16 {
                out.push((offset as u8 & !HIGHBIT) | HIGHBIT);
                offset >>= 7;
            } else {
                out.push(offset as u8 | if item.add_info_is_null { SEVENTHBIT } else { 0 });
                break;
            }
        }
    }
    write_add_info(layout, out, item);
}

/// Size of [`encode_item`] output without producing it.
pub fn encoded_size(layout: &PostingLayout, item: &RumItem, prev: &ItemPointer) -> usize {
    let mut size = add_info_len(layout, item);
    if layout.alternative_order {
        return size + std::mem::size_of::<ItemPointerData>();
    }
    let mut block_incr = item.iptr.block - prev.block;
    loop {
        size += 1;
        if block_incr < HIGHBIT as u32 {
            break;
        }
        block_incr >>= 7;
    }
    let mut offset = item.iptr.offset;
    loop {
        size += 1;
        if offset < SEVENTHBIT as u16 {
            break;
        }
        offset >>= 7;
    }
    size
}

fn truncated() -> RumError {
    RumError::internal("posting list is truncated")
}

fn decode_varbyte_blocknumber(data: &[u8], pos: &mut usize) -> RumResult<u64> {
    let mut val = 0u64;
    for shift in (0..49).step_by(7) {
        let c = *data.get(*pos).ok_or_else(truncated)? as u64;
        *pos += 1;
        if shift == 42 {
            val |= c << shift;
            break;
        }
        val |= (c & 0x7f) << shift;
        if c & 0x80 == 0 {
            break;
        }
    }
    Ok(val)
}

fn decode_varbyte_blocknumber_legacy(data: &[u8], pos: &mut usize) -> RumResult<u64> {
    let mut val = 0u64;
    let mut shift = 0;
    loop {
        let c = *data.get(*pos).ok_or_else(truncated)?;
        *pos += 1;
        val |= ((c & !HIGHBIT) as u64) << shift;
        if c & HIGHBIT == 0 {
            return Ok(val);
        }
        shift += 7;
        if shift > 35 {
            return Err(RumError::internal("invalid block number increment on rumpage"));
        }
    }
}

/// Decodes the item at `*pos` given the previously decoded item pointer.
pub fn decode_item(
    layout: &PostingLayout,
    data: &[u8],
    pos: &mut usize,
    prev: &ItemPointer,
) -> RumResult<RumItem> {
    let mut item = RumItem::default();
    if layout.alternative_order {
        let raw = data
            .get(*pos..*pos + std::mem::size_of::<ItemPointerData>())
            .ok_or_else(truncated)?;
        let mut iptr: ItemPointerData = bytemuck::pod_read_unaligned(raw);
        *pos += raw.len();
        item.add_info_is_null = iptr.ip_posid & ALT_ADD_INFO_NULL_FLAG != 0;
        iptr.ip_posid &= !ALT_ADD_INFO_NULL_FLAG;
        item.iptr = iptr.into();
    } else {
        let incr = if layout.new_item_ptr_decoding {
            decode_varbyte_blocknumber(data, pos)?
        } else {
            decode_varbyte_blocknumber_legacy(data, pos)?
        };
        let block = prev.block as u64 + incr;
        if block >= 1 << 32 {
            return Err(RumError::internal("invalid block number on rumpage"));
        }
        let mut offset: u32 = 0;
        let mut shift = 0;
        loop {
            let v = *data.get(*pos).ok_or_else(truncated)?;
            *pos += 1;
            if v & HIGHBIT != 0 {
                offset |= ((v & !HIGHBIT) as u32) << shift;
            } else {
                offset |= ((v & SIXMASK) as u32) << shift;
                item.add_info_is_null = v & SEVENTHBIT != 0;
                break;
            }
            shift += 7;
            if shift > 14 {
                return Err(RumError::internal("invalid offset on rumpage"));
            }
        }
        item.iptr = ItemPointer::new(block as u32, offset as u16);
    }
    if item.iptr.offset == INVALID_OFFSET_NUMBER {
        if layout.strict_decoding {
            return Err(RumError::internal("invalid offset on rumpage"));
        }
        log::warn!("invalid offset decoded from posting list");
    }
    if !item.add_info_is_null {
        let len = add_info_len(layout, &item);
        let raw = data.get(*pos..*pos + len).ok_or_else(truncated)?;
        let mut word = [0u8; 8];
        word[..len].copy_from_slice(raw);
        item.add_info = u64::from_le_bytes(word);
        *pos += len;
    }
    Ok(item)
}

/// Encodes a sorted run of items starting from the minimum item pointer.
pub fn encode_items(layout: &PostingLayout, items: &[RumItem]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = ItemPointer::MIN;
    for item in items {
        encode_item(layout, &mut out, item, &prev);
        prev = item.iptr;
    }
    out
}

pub fn encoded_items_size(layout: &PostingLayout, items: &[RumItem]) -> usize {
    let mut prev = ItemPointer::MIN;
    items
        .iter()
        .map(|item| {
            let size = encoded_size(layout, item, &prev);
            prev = item.iptr;
            size
        })
        .sum()
}

pub fn decode_items(layout: &PostingLayout, data: &[u8], count: usize) -> RumResult<Vec<RumItem>> {
    let mut items = Vec::with_capacity(count);
    let mut prev = ItemPointer::MIN;
    let mut pos = 0;
    for _ in 0..count {
        let item = decode_item(layout, data, &mut pos, &prev)?;
        prev = item.iptr;
        items.push(item);
    }
    Ok(items)
}

/// Merges two sorted runs. Equal items are kept once, preferring `b`.
pub fn merge_items(layout: &PostingLayout, a: &[RumItem], b: &[RumItem]) -> Vec<RumItem> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match layout.compare(&a[i], &b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(b[j]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

// data leaf pages

pub fn right_bound(page: &RumPage) -> RumItem {
    (*page.as_ref::<RumItemData>()).into()
}

pub fn set_right_bound(page: &mut RumPage, item: RumItem) {
    *page.as_mut::<RumItemData>() = item.into();
}

fn leaf_indexes(page: &RumPage) -> &[RumDataLeafItemIndex] {
    let start = DATA_START + RUM_DATA_PAGE_SIZE;
    bytemuck::cast_slice(&page.data()[start..start + SIZE_OF_LEAF_INDEX])
}

fn leaf_indexes_mut(page: &mut RumPage) -> &mut [RumDataLeafItemIndex] {
    let start = DATA_START + RUM_DATA_PAGE_SIZE;
    bytemuck::cast_slice_mut(&mut page.data_mut()[start..start + SIZE_OF_LEAF_INDEX])
}

/// Encoded bytes in use on a data leaf page.
pub fn leaf_used_space(page: &RumPage) -> usize {
    RUM_DATA_PAGE_SIZE - page.opaque.freespace as usize
}

pub fn leaf_fits(layout: &PostingLayout, items: &[RumItem]) -> bool {
    encoded_items_size(layout, items) <= RUM_DATA_PAGE_SIZE
}

/// Rewrites the item area of a data leaf with `items`, updating `maxoff`,
/// the free space mark and the in-page index. Returns false if they do not
/// fit; the page is untouched in that case.
pub fn write_leaf(layout: &PostingLayout, page: &mut RumPage, items: &[RumItem]) -> bool {
    let encoded = encode_items(layout, items);
    if encoded.len() > RUM_DATA_PAGE_SIZE {
        return false;
    }
    let area = &mut page.data_mut()[DATA_START..DATA_START + RUM_DATA_PAGE_SIZE];
    area[..encoded.len()].copy_from_slice(&encoded);
    area[encoded.len()..].fill(0);
    page.opaque.maxoff = items.len() as u16;
    page.opaque.freespace = (RUM_DATA_PAGE_SIZE - encoded.len()) as u16;
    page.header.pd_lower = (SIZE_OF_PAGE_HEADER + DATA_START + encoded.len()) as u16;
    update_item_indexes(layout, page, items);
    true
}

fn update_item_indexes(layout: &PostingLayout, page: &mut RumPage, items: &[RumItem]) {
    let mut indexes = [RumDataLeafItemIndex::default(); RUM_DATA_LEAF_INDEX_COUNT];
    let step = RUM_DATA_PAGE_SIZE / (RUM_DATA_LEAF_INDEX_COUNT + 1);
    let mut j = 0;
    let mut pos = 0;
    let mut prev = ItemPointer::MIN;
    for (i, item) in items.iter().enumerate() {
        pos += encoded_size(layout, item, &prev);
        prev = item.iptr;
        if j < RUM_DATA_LEAF_INDEX_COUNT && pos >= (j + 1) * step {
            indexes[j] = RumDataLeafItemIndex {
                iptr: item.iptr.into(),
                offset_number: (i + 1) as u16,
                page_offset: pos as u16,
                add_info_is_null: item.add_info_is_null as u8,
                _pad: [0; 5],
                add_info: item.add_info,
            };
            j += 1;
        }
    }
    leaf_indexes_mut(page).copy_from_slice(&indexes);
}

pub fn read_leaf(layout: &PostingLayout, page: &RumPage) -> RumResult<Vec<RumItem>> {
    let area = &page.data()[DATA_START..DATA_START + leaf_used_space(page)];
    decode_items(layout, area, page.opaque.maxoff as usize)
}

/// Decodes the items of a leaf that sort at or after `target`, starting
/// from the closest in-page index entry instead of the first item.
pub fn read_leaf_from(
    layout: &PostingLayout,
    page: &RumPage,
    target: &RumItem,
) -> RumResult<Vec<RumItem>> {
    let maxoff = page.opaque.maxoff as usize;
    let area = &page.data()[DATA_START..DATA_START + leaf_used_space(page)];
    let mut start_pos = 0;
    let mut start_off = 0;
    let mut prev = ItemPointer::MIN;
    if !layout.alternative_order {
        for index in leaf_indexes(page) {
            if index.offset_number == INVALID_OFFSET_NUMBER {
                break;
            }
            let item = index.item();
            if layout.compare(&item, target) != std::cmp::Ordering::Less {
                break;
            }
            start_pos = index.page_offset as usize;
            start_off = index.offset_number as usize;
            prev = item.iptr;
        }
    }
    let mut pos = start_pos;
    let mut out = Vec::new();
    for _ in start_off..maxoff {
        let item = decode_item(layout, area, &mut pos, &prev)?;
        prev = item.iptr;
        if layout.compare(&item, target) != std::cmp::Ordering::Less {
            out.push(item);
        }
    }
    Ok(out)
}

// data internal pages

pub const POSTING_ITEM_SIZE: usize = std::mem::size_of::<super::item::PostingItem>();
pub const MAX_POSTING_ITEMS: usize =
    (RUM_PAGE_SIZE - SIZE_OF_PAGE_HEADER - SIZE_OF_RIGHT_BOUND - SIZE_OF_OPAQUE) / POSTING_ITEM_SIZE;

pub fn posting_items(page: &RumPage) -> &[super::item::PostingItem] {
    let n = page.opaque.maxoff as usize;
    bytemuck::cast_slice(&page.data()[DATA_START..DATA_START + n * POSTING_ITEM_SIZE])
}

pub fn write_posting_items(page: &mut RumPage, items: &[super::item::PostingItem]) {
    debug_assert!(items.len() <= MAX_POSTING_ITEMS);
    let bytes: &[u8] = bytemuck::cast_slice(items);
    let area = &mut page.data_mut()[DATA_START..DATA_START + MAX_POSTING_ITEMS * POSTING_ITEM_SIZE];
    area[..bytes.len()].copy_from_slice(bytes);
    area[bytes.len()..].fill(0);
    page.opaque.maxoff = items.len() as u16;
    page.header.pd_lower = (SIZE_OF_PAGE_HEADER + DATA_START + bytes.len()) as u16;
    page.opaque.freespace = ((MAX_POSTING_ITEMS - items.len()) * POSTING_ITEM_SIZE) as u16;
}
