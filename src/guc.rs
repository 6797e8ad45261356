use std::sync::OnceLock;

use serde::Deserialize;

/// Process-wide knobs. Installed once by [`init`] and read by every index
/// handle when it is opened.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RumGucs {
    /// Soft cap on the number of results a bitmap scan returns, 0 for none.
    pub fuzzy_search_limit: i32,
    pub use_new_vacuum_scan: bool,
    /// Caps the number of posting items on intermediate data pages, -1 for none.
    pub data_page_intermediate_split_size: i32,
    pub allow_order_by_raw_keys: bool,
    pub enable_refind_leaf_on_entry_next_item: bool,
    pub throw_error_on_invalid_data_page: bool,
    pub disable_fast_scan: bool,
    pub enable_entry_find_item_on_scan: bool,
    pub enable_parallel_index_build: bool,
    pub parallel_index_workers_override: i32,
    pub skip_retry_on_delete_page: bool,
    pub force_ordered_index_scan: bool,
    pub prefer_ordered_index_scan: bool,
    pub enable_skip_intermediate_entry: bool,
    pub use_new_item_ptr_decoding: bool,
    pub index_term_compression_threshold: i32,
    /// Number of accumulated postings after which a build flushes to the tree.
    pub maintenance_work_mem_items: usize,
}

impl Default for RumGucs {
    fn default() -> Self {
        Self {
            fuzzy_search_limit: 0,
            use_new_vacuum_scan: true,
            data_page_intermediate_split_size: -1,
            allow_order_by_raw_keys: true,
            enable_refind_leaf_on_entry_next_item: true,
            throw_error_on_invalid_data_page: false,
            disable_fast_scan: false,
            enable_entry_find_item_on_scan: true,
            enable_parallel_index_build: false,
            parallel_index_workers_override: -1,
            skip_retry_on_delete_page: true,
            force_ordered_index_scan: false,
            prefer_ordered_index_scan: true,
            enable_skip_intermediate_entry: true,
            use_new_item_ptr_decoding: true,
            index_term_compression_threshold: i32::MAX,
            maintenance_work_mem_items: 1 << 20,
        }
    }
}

impl RumGucs {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn parallel_workers(&self) -> usize {
        if !self.enable_parallel_index_build {
            return 0;
        }
        if self.parallel_index_workers_override > 0 {
            return self.parallel_index_workers_override as usize;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(1)
    }
}

static GUCS: OnceLock<RumGucs> = OnceLock::new();

/// Installs the configuration. Later calls are ignored and return false.
pub fn init(gucs: RumGucs) -> bool {
    let installed = GUCS.set(gucs).is_ok();
    if !installed {
        log::warn!("rum configuration already initialized, ignoring");
    }
    installed
}

pub fn gucs() -> RumGucs {
    GUCS.get().cloned().unwrap_or_default()
}
