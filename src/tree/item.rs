use std::cmp::Ordering;
use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::datatype::{Datum, TypeInfo};
use crate::page::INVALID_BLOCK_NUMBER;

/// Heap row identifier. Orders by block, then offset.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ItemPointer {
    pub block: u32,
    pub offset: u16,
}

impl ItemPointer {
    pub const MIN: ItemPointer = ItemPointer {
        block: 0,
        offset: 0,
    };
    pub const MAX: ItemPointer = ItemPointer {
        block: INVALID_BLOCK_NUMBER,
        offset: 0xfffe,
    };
    pub const INVALID: ItemPointer = ItemPointer {
        block: INVALID_BLOCK_NUMBER,
        offset: 0,
    };

    pub const fn new(block: u32, offset: u16) -> Self {
        Self { block, offset }
    }

    pub fn lossy_page(block: u32) -> Self {
        Self {
            block,
            offset: 0xffff,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.offset != 0
    }

    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }

    pub fn is_max(&self) -> bool {
        *self == Self::MAX
    }

    pub fn is_lossy_page(&self) -> bool {
        self.offset == 0xffff && self.block != INVALID_BLOCK_NUMBER
    }
}

impl fmt::Debug for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}

impl fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}

/// Stored form of [`ItemPointer`]: two 16-bit halves of the block number
/// followed by the offset, no padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemPointerData {
    pub bi_hi: u16,
    pub bi_lo: u16,
    pub ip_posid: u16,
}

unsafe impl Zeroable for ItemPointerData {}
unsafe impl Pod for ItemPointerData {}

impl From<ItemPointer> for ItemPointerData {
    fn from(iptr: ItemPointer) -> Self {
        Self {
            bi_hi: (iptr.block >> 16) as u16,
            bi_lo: iptr.block as u16,
            ip_posid: iptr.offset,
        }
    }
}

impl From<ItemPointerData> for ItemPointer {
    fn from(data: ItemPointerData) -> Self {
        Self {
            block: ((data.bi_hi as u32) << 16) | data.bi_lo as u32,
            offset: data.ip_posid,
        }
    }
}

/// A posting: row identifier plus optional additional information.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RumItem {
    pub iptr: ItemPointer,
    pub add_info_is_null: bool,
    pub add_info: u64,
}

impl fmt::Debug for RumItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.add_info_is_null {
            write!(f, "{:?}", self.iptr)
        } else {
            write!(f, "{:?}#{}", self.iptr, self.add_info as i64)
        }
    }
}

impl RumItem {
    pub fn new(iptr: ItemPointer) -> Self {
        Self {
            iptr,
            add_info_is_null: true,
            add_info: 0,
        }
    }

    pub fn with_add_info(iptr: ItemPointer, add_info: Option<u64>) -> Self {
        Self {
            iptr,
            add_info_is_null: add_info.is_none(),
            add_info: add_info.unwrap_or(0),
        }
    }

    pub fn min() -> Self {
        Self::new(ItemPointer::MIN)
    }

    pub fn max() -> Self {
        Self::new(ItemPointer::MAX)
    }

    pub fn invalid() -> Self {
        Self::new(ItemPointer::INVALID)
    }

    pub fn add_info(&self) -> Option<u64> {
        (!self.add_info_is_null).then_some(self.add_info)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RumItemData {
    pub iptr: ItemPointerData,
    pub add_info_is_null: u8,
    pub _pad: u8,
    pub add_info: u64,
}

unsafe impl Zeroable for RumItemData {}
unsafe impl Pod for RumItemData {}

const _: () = assert!(std::mem::size_of::<RumItemData>() == 16);

impl From<RumItem> for RumItemData {
    fn from(item: RumItem) -> Self {
        Self {
            iptr: item.iptr.into(),
            add_info_is_null: item.add_info_is_null as u8,
            _pad: 0,
            add_info: item.add_info,
        }
    }
}

impl From<RumItemData> for RumItem {
    fn from(data: RumItemData) -> Self {
        Self {
            iptr: data.iptr.into(),
            add_info_is_null: data.add_info_is_null != 0,
            add_info: data.add_info,
        }
    }
}

/// Downlink on an internal posting tree page: child block and the largest
/// item stored under it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PostingItem {
    pub child_hi: u16,
    pub child_lo: u16,
    pub _pad: u32,
    pub item: RumItemData,
}

unsafe impl Zeroable for PostingItem {}
unsafe impl Pod for PostingItem {}

const _: () = assert!(std::mem::size_of::<PostingItem>() == 24);

impl PostingItem {
    pub fn new(child: u32, item: RumItem) -> Self {
        Self {
            child_hi: (child >> 16) as u16,
            child_lo: child as u16,
            _pad: 0,
            item: item.into(),
        }
    }

    pub fn child(&self) -> u32 {
        ((self.child_hi as u32) << 16) | self.child_lo as u32
    }

    pub fn set_child(&mut self, child: u32) {
        self.child_hi = (child >> 16) as u16;
        self.child_lo = child as u16;
    }

    pub fn item(&self) -> RumItem {
        self.item.into()
    }
}

/// How postings of one index column are encoded and ordered.
#[derive(Clone, Copy)]
pub struct PostingLayout {
    /// Raw item pointers instead of varbyte deltas.
    pub alternative_order: bool,
    /// Items order by AddInfo first.
    pub order_by_add_info: bool,
    pub add_info_type: Option<TypeInfo>,
    pub add_info_cmp: Option<fn(&Datum, &Datum) -> Ordering>,
    pub strict_decoding: bool,
    pub new_item_ptr_decoding: bool,
}

impl fmt::Debug for PostingLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostingLayout")
            .field("alternative_order", &self.alternative_order)
            .field("order_by_add_info", &self.order_by_add_info)
            .field("add_info_type", &self.add_info_type)
            .finish()
    }
}

impl Default for PostingLayout {
    fn default() -> Self {
        Self {
            alternative_order: false,
            order_by_add_info: false,
            add_info_type: None,
            add_info_cmp: None,
            strict_decoding: false,
            new_item_ptr_decoding: true,
        }
    }
}

impl PostingLayout {
    /// Compares two AddInfo words of this column. A null sorts before any
    /// value, so [`RumItem::min`] stays the smallest item.
    pub fn compare_add_info(&self, a: &RumItem, b: &RumItem) -> Ordering {
        match (a.add_info_is_null, b.add_info_is_null) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => match (self.add_info_type, self.add_info_cmp) {
                (Some(ty), Some(cmp)) => cmp(&ty.from_raw(a.add_info), &ty.from_raw(b.add_info)),
                (Some(ty), None) => {
                    crate::datatype::datum_cmp(&ty.from_raw(a.add_info), &ty.from_raw(b.add_info))
                }
                _ => (a.add_info as i64).cmp(&(b.add_info as i64)),
            },
        }
    }

    pub fn compare(&self, a: &RumItem, b: &RumItem) -> Ordering {
        if self.order_by_add_info {
            let res = self.compare_add_info(a, b);
            if res != Ordering::Equal {
                return res;
            }
        }
        a.iptr.cmp(&b.iptr)
    }

    pub fn has_add_info(&self) -> bool {
        self.add_info_type.is_some()
    }
}
