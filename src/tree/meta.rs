use bytemuck::{Pod, Zeroable};

use crate::error::{RumError, RumResult};
use crate::page::{RumPage, INVALID_BLOCK_NUMBER};

pub const META_VERSION: u32 = 0xC0DE0002;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MetaPageData {
    pub rum_version: u32,
    /// Pending list head and tail. The pending list is not used.
    pub head: u32,
    pub tail: u32,
    pub tail_free_size: u32,
    pub n_pending_pages: u32,
    pub _pad: u32,
    /// 1 once some row produced more than one key for a column, else 0.
    pub n_pending_heap_tuples: i64,
    pub n_total_pages: u32,
    pub n_entry_pages: u32,
    pub n_data_pages: u32,
    pub _pad2: u32,
    pub n_entries: i64,
}

unsafe impl Zeroable for MetaPageData {}
unsafe impl Pod for MetaPageData {}

impl Default for MetaPageData {
    fn default() -> Self {
        MetaPageData {
            rum_version: META_VERSION,
            head: INVALID_BLOCK_NUMBER,
            tail: INVALID_BLOCK_NUMBER,
            tail_free_size: 0,
            n_pending_pages: 0,
            _pad: 0,
            n_pending_heap_tuples: 0,
            n_total_pages: 0,
            n_entry_pages: 0,
            n_data_pages: 0,
            _pad2: 0,
            n_entries: 0,
        }
    }
}

/// Planner statistics kept on the meta page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RumStats {
    pub n_total_pages: u32,
    pub n_entry_pages: u32,
    pub n_data_pages: u32,
    pub n_entries: i64,
}

impl MetaPageData {
    /// Reads the meta page, refusing any other format version.
    pub fn read(page: &RumPage) -> RumResult<MetaPageData> {
        let meta: MetaPageData = *page.as_ref::<MetaPageData>();
        if meta.rum_version != META_VERSION {
            return Err(RumError::internal("unexpected RUM index version. Reindex")
                .with_detail(format!(
                    "Expected version {}, got {}.",
                    META_VERSION, meta.rum_version
                )));
        }
        Ok(meta)
    }

    pub fn is_multi_key(&self) -> bool {
        self.n_pending_heap_tuples > 0
    }

    pub fn stats(&self) -> RumStats {
        RumStats {
            n_total_pages: self.n_total_pages,
            n_entry_pages: self.n_entry_pages,
            n_data_pages: self.n_data_pages,
            n_entries: self.n_entries,
        }
    }

    pub fn set_stats(&mut self, stats: &RumStats) {
        self.n_total_pages = stats.n_total_pages;
        self.n_entry_pages = stats.n_entry_pages;
        self.n_data_pages = stats.n_data_pages;
        self.n_entries = stats.n_entries;
    }
}
