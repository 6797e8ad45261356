mod btree;
pub mod data;
pub mod entry;
pub mod item;
pub mod meta;
pub mod posting;

pub use btree::{find_leaf_page, insert_value, rum_step, BtreeStack, LockedPage, RumBtree, StackEntry};
pub use data::{
    collect_posting_tree, create_posting_tree, insert_item_pointers, posting_tree_leaf, DataBtree,
    PostingStart,
};
pub use entry::{
    compare_entries, entry_leaf_iter, form_posting_tree_tuple, form_tuple, page_tuple, EntryBtree,
    EntryKey, EntryKeyspace, EntryLeafItem, EntryTuple, NullCategory, RUM_MAX_ITEM_SIZE,
    RUM_TREE_POSTING,
};
pub use item::{ItemPointer, PostingItem, PostingLayout, RumItem};
pub use meta::{MetaPageData, RumStats, META_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScanDirection {
    Backward,
    NoMovement,
    #[default]
    Forward,
}

impl ScanDirection {
    pub fn is_backward(self) -> bool {
        self == ScanDirection::Backward
    }
}
