use super::state::RumState;
use super::RumIndex;
use crate::datatype::Datum;
use crate::error::{RumError, RumResult};
use crate::page::{page_write, GenericXLog, Relation, METAPAGE_BLKNO, ROOT_BLKNO};
use crate::tree::posting::{encode_items, merge_items};
use crate::tree::{
    find_leaf_page, form_posting_tree_tuple, form_tuple, page_tuple, create_posting_tree,
    insert_item_pointers, insert_value, EntryBtree, EntryKey, ItemPointer, MetaPageData,
    RumItem, RumStats,
};

/// Builds the leaf tuple for `key` holding `items`, moving them to a new
/// posting tree when they do not fit inline.
fn build_entry_tuple(
    rel: &Relation,
    state: &RumState,
    key: &EntryKey,
    items: &[RumItem],
    stats: Option<&mut RumStats>,
) -> RumResult<Vec<u8>> {
    let layout = &state.column(key.attnum).layout;
    let encoded = encode_items(layout, items);
    if let Some(tuple) = form_tuple(state, rel, key, &encoded, items.len() as u16, false)? {
        return Ok(tuple);
    }
    // the key alone has to fit, otherwise the row cannot be indexed at all
    form_tuple(state, rel, key, &[], 0, true)?;
    let root = create_posting_tree(rel, layout, items, state.split_size(), stats)?;
    form_posting_tree_tuple(state, rel, key, root)
}

/// Adds sorted, distinct `items` to the postings of `key`, creating the
/// entry when it does not exist yet.
pub fn entry_insert(
    rel: &Relation,
    state: &RumState,
    key: &EntryKey,
    items: &[RumItem],
    mut stats: Option<&mut RumStats>,
) -> RumResult<()> {
    if let Some(stats) = stats.as_deref_mut() {
        stats.n_entries += 1;
    }
    let mut btree = EntryBtree::new(state, key.clone(), false);
    let (mut stack, leaf) = find_leaf_page(&btree, rel, ROOT_BLKNO)?;
    let mut off = 0;
    let found = btree.find_item(&leaf, &mut off)?;
    let layout = &state.column(key.attnum).layout;

    let entry = if found {
        let tuple = page_tuple(&leaf, off);
        if tuple.is_posting_tree() {
            let root = tuple.posting_tree_root();
            drop(leaf);
            return insert_item_pointers(rel, layout, root, items, state.split_size(), stats);
        }
        let old = tuple.items(state)?;
        let merged = merge_items(layout, &old, items);
        btree.is_delete = true;
        build_entry_tuple(rel, state, key, &merged, stats.as_deref_mut())?
    } else {
        build_entry_tuple(rel, state, key, items, stats.as_deref_mut())?
    };

    btree.entry = entry;
    stack.top_mut().off = off;
    insert_value(&mut btree, rel, ROOT_BLKNO, stack, leaf.into_exclusive()?, stats)
}

/// Marks the index as holding rows with several keys in one column.
pub fn set_multi_key(rel: &Relation) -> RumResult<()> {
    let mut meta = page_write(rel, METAPAGE_BLKNO)?;
    if MetaPageData::read(&meta)?.is_multi_key() {
        return Ok(());
    }
    let mut xlog = GenericXLog::start(rel);
    let idx = xlog.register(&mut meta, false);
    xlog.page_mut(idx).as_mut::<MetaPageData>().n_pending_heap_tuples = 1;
    xlog.finish();
    Ok(())
}

impl RumIndex {
    /// Indexes one heap row. `values` holds one optional value per column.
    pub fn insert(&self, values: &[Option<Datum>], tid: ItemPointer) -> RumResult<()> {
        let state = &*self.state;
        if values.len() != state.natts() as usize {
            return Err(RumError::bad_value(format!(
                "index \"{}\" has {} columns, got {} values",
                self.rel.name(),
                state.natts(),
                values.len()
            )));
        }
        if !tid.is_valid() {
            return Err(RumError::bad_value(format!("invalid item pointer {}", tid)));
        }
        let mut multi_key = false;
        for attnum in 1..=state.natts() {
            let value = values[attnum as usize - 1].as_ref();
            let entries = state.extract_entries(attnum, value)?;
            multi_key |= entries.len() > 1;
            let attached = match (state.add_to_column, state.attach_column) {
                (Some(to), Some(attach)) if to == attnum => values[attach as usize - 1].as_ref(),
                _ => None,
            };
            for (key, add_info) in entries {
                let add_info = attached.or(add_info.as_ref());
                let item = state.make_item(attnum, tid, add_info)?;
                entry_insert(&self.rel, state, &key, &[item], None)?;
            }
        }
        if multi_key {
            set_multi_key(&self.rel)?;
        }
        Ok(())
    }
}
