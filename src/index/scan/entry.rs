//! Entry streams: the postings of one query entry, read lazily in scan
//! order.
//!
//! A stream over a posting tree copies one leaf at a time and keeps that
//! leaf pinned but unlocked, so vacuum cannot delete it underneath the
//! scan while inserts proceed.

use std::cmp::Ordering;

use lending_iterator::LendingIterator;

use crate::datatype::Datum;
use crate::error::RumResult;
use crate::opclass::SearchMode;
use crate::page::{Buffer, Relation, ROOT_BLKNO};
use crate::tree::posting::{read_leaf, read_leaf_from};
use crate::tree::{
    collect_posting_tree, entry_leaf_iter, find_leaf_page, page_tuple, posting_tree_leaf,
    rum_step, EntryBtree, EntryKey, LockedPage, NullCategory, PostingLayout, PostingStart,
    RumItem, ScanDirection,
};

use super::super::state::RumState;

/// Order in which the streams of a scan deliver items.
#[derive(Debug, Clone, Copy)]
pub(super) struct ItemOrder {
    /// Set when items follow the `(AddInfo, item pointer)` order of the
    /// attach-to column.
    pub layout: Option<PostingLayout>,
    pub backward: bool,
}

impl ItemOrder {
    pub fn by_item_pointer() -> Self {
        Self {
            layout: None,
            backward: false,
        }
    }

    pub fn direction(&self) -> ScanDirection {
        if self.backward {
            ScanDirection::Backward
        } else {
            ScanDirection::Forward
        }
    }

    pub fn cmp(&self, a: &RumItem, b: &RumItem) -> Ordering {
        let ord = match &self.layout {
            Some(layout) => layout.compare(a, b),
            None => a.iptr.cmp(&b.iptr),
        };
        if self.backward {
            ord.reverse()
        } else {
            ord
        }
    }

    /// Sorts ascending postings into delivery order.
    fn arrange(&self, items: &mut Vec<RumItem>) {
        if let Some(layout) = &self.layout {
            items.sort_by(|a, b| layout.compare(a, b));
        }
        if self.backward {
            items.reverse();
        }
    }
}

/// What a scan operation needs from the index.
#[derive(Clone, Copy)]
pub(super) struct ScanCtx<'a> {
    pub rel: &'a Relation,
    pub state: &'a RumState,
    pub order: ItemOrder,
}

impl ScanCtx<'_> {
    fn layout(&self, attnum: u16) -> &PostingLayout {
        &self.state.column(attnum).layout
    }
}

/// Lower limit for the items a stream may still deliver.
#[derive(Debug, Clone, Copy)]
struct Bound {
    item: RumItem,
    inclusive: bool,
}

impl Bound {
    fn admits(&self, order: &ItemOrder, item: &RumItem) -> bool {
        match order.cmp(item, &self.item) {
            Ordering::Greater => true,
            Ordering::Equal => self.inclusive,
            Ordering::Less => false,
        }
    }
}

struct TreeCursor {
    root: u32,
    /// Pin on the leaf the current items were copied from.
    buffer: Option<Buffer>,
}

/// Postings of one entry tuple or of a set of collected entries.
pub(super) struct PostingStream {
    attnum: u16,
    items: Vec<RumItem>,
    /// Entry each item was collected from, when tracked.
    keys: Vec<EntryKey>,
    pos: usize,
    tree: Option<TreeCursor>,
    pub predict: u32,
}

impl PostingStream {
    pub fn empty(attnum: u16) -> Self {
        Self {
            attnum,
            items: Vec::new(),
            keys: Vec::new(),
            pos: 0,
            tree: None,
            predict: 0,
        }
    }

    /// A stream over an in-memory list, already in delivery order.
    pub fn list(attnum: u16, items: Vec<RumItem>, keys: Vec<EntryKey>) -> Self {
        Self {
            attnum,
            predict: items.len() as u32,
            items,
            keys,
            pos: 0,
            tree: None,
        }
    }

    /// A stream over the posting tree at `root`, positioned at `mark` when
    /// given.
    pub fn tree(ctx: &ScanCtx<'_>, attnum: u16, root: u32, mark: Option<RumItem>) -> RumResult<Self> {
        let layout = ctx.layout(attnum);
        let start = match mark {
            Some(mark) => PostingStart::At(mark),
            None if ctx.order.backward => PostingStart::Last,
            None => PostingStart::First,
        };
        let (leaf, predict) = posting_tree_leaf(ctx.rel, layout, root, start)?;
        let mut stream = Self::empty(attnum);
        stream.predict = predict;
        stream.tree = Some(TreeCursor { root, buffer: None });
        let bound = mark.map(|item| Bound {
            item,
            inclusive: true,
        });
        stream.fill_from(ctx, leaf, bound)?;
        Ok(stream)
    }

    /// Drops the items that sort before `mark` in delivery order.
    pub fn position_at(&mut self, order: &ItemOrder, mark: &RumItem) {
        let rest = &self.items[self.pos..];
        self.pos += rest.partition_point(|item| order.cmp(item, mark) == Ordering::Less);
    }

    /// Key of the item returned last, when keys are tracked.
    pub fn last_key(&self) -> Option<&EntryKey> {
        self.pos.checked_sub(1).and_then(|i| self.keys.get(i))
    }

    /// Copies the items of `page` admitted by `bound`, moving on in scan
    /// direction while a leaf has none.
    fn fill_from(
        &mut self,
        ctx: &ScanCtx<'_>,
        mut page: LockedPage,
        bound: Option<Bound>,
    ) -> RumResult<()> {
        let layout = *ctx.layout(self.attnum);
        loop {
            let mut items = match bound {
                Some(bound) if !ctx.order.backward => read_leaf_from(&layout, &page, &bound.item)?,
                _ => read_leaf(&layout, &page)?,
            };
            if ctx.order.backward {
                items.reverse();
            }
            if let Some(bound) = bound {
                items.retain(|item| bound.admits(&ctx.order, item));
            }
            if !items.is_empty() {
                log::trace!(
                    "scan entry moved to posting leaf {} with {} items",
                    page.blkno(),
                    items.len()
                );
                self.items = items;
                self.pos = 0;
                if let Some(tree) = self.tree.as_mut() {
                    tree.buffer = Some(page.unlock());
                }
                return Ok(());
            }
            ctx.rel.check_for_interrupts()?;
            match rum_step(ctx.rel, page, ctx.order.direction())? {
                Some(next) => page = next,
                None => {
                    self.items.clear();
                    self.pos = 0;
                    self.tree = None;
                    return Ok(());
                }
            }
        }
    }

    fn next_leaf(&mut self, ctx: &ScanCtx<'_>, last: RumItem) -> RumResult<()> {
        let Some(tree) = self.tree.as_mut() else {
            self.items.clear();
            self.pos = 0;
            return Ok(());
        };
        let bound = Some(Bound {
            item: last,
            inclusive: false,
        });
        if ctx.state.gucs.enable_refind_leaf_on_entry_next_item {
            let root = tree.root;
            tree.buffer = None;
            let (leaf, _) = posting_tree_leaf(ctx.rel, ctx.layout(self.attnum), root, PostingStart::At(last))?;
            return self.fill_from(ctx, leaf, bound);
        }
        let Some(buffer) = tree.buffer.take() else {
            self.tree = None;
            self.items.clear();
            self.pos = 0;
            return Ok(());
        };
        let current = LockedPage::Share(buffer.lock_share());
        match rum_step(ctx.rel, current, ctx.order.direction())? {
            Some(next) => self.fill_from(ctx, next, bound),
            None => {
                self.tree = None;
                self.items.clear();
                self.pos = 0;
                Ok(())
            }
        }
    }

    /// Next item in delivery order, `None` at the end.
    pub fn next(&mut self, ctx: &ScanCtx<'_>) -> RumResult<Option<RumItem>> {
        if self.pos >= self.items.len() {
            let Some(&last) = self.items.last() else {
                return Ok(None);
            };
            self.next_leaf(ctx, last)?;
            if self.pos >= self.items.len() {
                return Ok(None);
            }
        }
        let item = self.items[self.pos];
        self.pos += 1;
        Ok(Some(item))
    }

    /// First item at or after `target` in delivery order.
    pub fn skip_to(&mut self, ctx: &ScanCtx<'_>, target: &RumItem) -> RumResult<Option<RumItem>> {
        let order = ctx.order;
        let rest = &self.items[self.pos..];
        let idx = rest.partition_point(|item| order.cmp(item, target) == Ordering::Less);
        if idx < rest.len() {
            self.pos += idx;
            return self.next(ctx);
        }
        let Some(tree) = self.tree.as_mut() else {
            self.pos = self.items.len();
            return Ok(None);
        };
        let root = tree.root;
        tree.buffer = None;
        let (leaf, _) = posting_tree_leaf(ctx.rel, ctx.layout(self.attnum), root, PostingStart::At(*target))?;
        self.fill_from(
            ctx,
            leaf,
            Some(Bound {
                item: *target,
                inclusive: true,
            }),
        )?;
        self.next(ctx)
    }
}

/// The definition of a query entry, as extracted from a scan key.
#[derive(Debug, Clone)]
pub(super) struct EntryDef {
    pub attnum: u16,
    pub strategy: u16,
    pub search_mode: SearchMode,
    pub query_key: Option<Datum>,
    pub category: NullCategory,
    pub partial: bool,
    pub extra: Option<Datum>,
}

impl EntryDef {
    pub fn entry_key(&self) -> EntryKey {
        EntryKey::new(self.attnum, self.query_key.clone(), self.category)
    }

    /// Whether the entry stands for a range of index entries rather than
    /// one.
    fn collects(&self) -> bool {
        self.partial || self.category == NullCategory::EmptyQuery
    }
}

pub(super) struct ScanEntry {
    pub def: EntryDef,
    /// Start at `mark` and follow AddInfo order.
    pub use_mark: bool,
    pub mark: RumItem,
    /// Remember the index key of every item for ordering by key.
    pub use_cur_key: bool,
    pub cur: RumItem,
    pub cur_key: Option<EntryKey>,
    pub finished: bool,
    pub pre_value: bool,
    stream: PostingStream,
}

impl ScanEntry {
    pub fn new(def: EntryDef) -> Self {
        let attnum = def.attnum;
        Self {
            def,
            use_mark: false,
            mark: RumItem::min(),
            use_cur_key: false,
            cur: RumItem::min(),
            cur_key: None,
            finished: false,
            pre_value: false,
            stream: PostingStream::empty(attnum),
        }
    }

    /// Can be shared by another key asking for the same entry.
    pub fn same_as(&self, state: &RumState, def: &EntryDef) -> RumResult<bool> {
        let mine = &self.def;
        if mine.extra.is_some()
            || def.extra.is_some()
            || mine.partial != def.partial
            || mine.strategy != def.strategy
            || mine.search_mode != def.search_mode
            || mine.attnum != def.attnum
        {
            return Ok(false);
        }
        Ok(crate::tree::compare_entries(state, &mine.entry_key(), &def.entry_key())? == Ordering::Equal)
    }

    pub fn predict(&self) -> u32 {
        self.stream.predict
    }

    fn reset(&mut self) {
        self.cur = RumItem::min();
        self.cur_key = None;
        self.finished = false;
        self.stream = PostingStream::empty(self.def.attnum);
    }

    /// Locates the entry and opens its postings.
    pub fn start(&mut self, ctx: &ScanCtx<'_>) -> RumResult<()> {
        self.reset();
        if self.def.collects() {
            self.stream = collect_matches(ctx, self)?;
        } else {
            self.stream = self.open_exact(ctx)?;
            if self.use_cur_key {
                self.cur_key = Some(self.def.entry_key());
            }
        }
        if self.use_mark {
            let mark = self.mark;
            self.stream.position_at(&ctx.order, &mark);
        }
        log::trace!(
            "scan entry on column {} started, predicted {} items",
            self.def.attnum,
            self.stream.predict
        );
        Ok(())
    }

    fn open_exact(&self, ctx: &ScanCtx<'_>) -> RumResult<PostingStream> {
        let attnum = self.def.attnum;
        let btree = EntryBtree::new(ctx.state, self.def.entry_key(), true);
        let (_, leaf) = find_leaf_page(&btree, ctx.rel, ROOT_BLKNO)?;
        let mut off = 0;
        if !btree.find_item(&leaf, &mut off)? {
            return Ok(PostingStream::empty(attnum));
        }
        let tuple = page_tuple(&leaf, off);
        if tuple.is_posting_tree() {
            let root = tuple.posting_tree_root();
            drop(leaf);
            let layout = &ctx.state.column(attnum).layout;
            if ctx.order.layout.is_none() && layout.order_by_add_info {
                // stored in AddInfo order, the scan wants item pointer order
                let mut items = collect_posting_tree(ctx.rel, layout, root)?;
                items.sort_by(|a, b| a.iptr.cmp(&b.iptr));
                ctx.order.arrange(&mut items);
                return Ok(PostingStream::list(attnum, items, Vec::new()));
            }
            let mark = self.use_mark.then_some(self.mark);
            return PostingStream::tree(ctx, attnum, root, mark);
        }
        let mut items = tuple.items(ctx.state)?;
        drop(leaf);
        if ctx.order.layout.is_none() {
            items.sort_by(|a, b| a.iptr.cmp(&b.iptr));
        }
        ctx.order.arrange(&mut items);
        Ok(PostingStream::list(attnum, items, Vec::new()))
    }

    pub fn next(&mut self, ctx: &ScanCtx<'_>) -> RumResult<()> {
        if self.finished {
            return Ok(());
        }
        match self.stream.next(ctx)? {
            Some(item) => self.set_current(item),
            None => self.finished = true,
        }
        Ok(())
    }

    /// Moves to the first item at or after `target`.
    pub fn skip_to(&mut self, ctx: &ScanCtx<'_>, target: &RumItem) -> RumResult<()> {
        if self.finished {
            return Ok(());
        }
        match self.stream.skip_to(ctx, target)? {
            Some(item) => self.set_current(item),
            None => self.finished = true,
        }
        Ok(())
    }

    fn set_current(&mut self, item: RumItem) {
        self.cur = item;
        if let Some(key) = self.stream.last_key() {
            self.cur_key = Some(key.clone());
        }
    }
}

/// Gathers the postings of every index entry a partial or empty query
/// entry covers into one list, one item per row.
fn collect_matches(ctx: &ScanCtx<'_>, entry: &ScanEntry) -> RumResult<PostingStream> {
    let def = &entry.def;
    let attnum = def.attnum;
    if def.partial && def.category != NullCategory::NormKey {
        return Ok(PostingStream::empty(attnum));
    }
    let opclass = ctx.state.opclass(attnum);
    let layout = ctx.state.column(attnum).layout;
    let start = if def.partial {
        def.entry_key()
    } else {
        EntryKey::new(attnum, None, NullCategory::EmptyQuery)
    };
    let btree = EntryBtree::new(ctx.state, start, true);
    let (_, leaf) = find_leaf_page(&btree, ctx.rel, ROOT_BLKNO)?;
    let mut off = 0;
    btree.find_item(&leaf, &mut off)?;

    let mut collected: Vec<(RumItem, EntryKey)> = Vec::new();
    let mut roots: Vec<(u32, EntryKey)> = Vec::new();
    {
        let mut iter = entry_leaf_iter(ctx.rel, leaf, off);
        while let Some(next) = iter.next() {
            let next = next?;
            let tuple = next.tuple;
            if tuple.attnum(ctx.state.one_col) != attnum {
                break;
            }
            let key = tuple.entry_key(ctx.state)?;
            if def.partial {
                let (Some(query), Some(idatum)) = (def.query_key.as_ref(), key.key.as_ref()) else {
                    break;
                };
                let compare_partial = opclass.compare_partial.as_ref().ok_or_else(|| {
                    crate::error::RumError::not_supported(
                        "Compare with prefix expressions isn't supported",
                    )
                })?;
                let cmp = compare_partial(query, idatum, def.strategy, def.extra.as_ref())?;
                if cmp > 0 {
                    break;
                }
                if cmp < 0 {
                    continue;
                }
            } else if def.search_mode == SearchMode::All && key.category == NullCategory::NullItem {
                break;
            }
            if tuple.is_posting_tree() {
                roots.push((tuple.posting_tree_root(), key));
            } else {
                for item in tuple.items(ctx.state)? {
                    collected.push((item, key.clone()));
                }
            }
        }
    }
    for (root, key) in roots {
        ctx.rel.check_for_interrupts()?;
        for item in collect_posting_tree(ctx.rel, &layout, root)? {
            collected.push((item, key.clone()));
        }
    }

    collected.sort_by(|a, b| a.0.iptr.cmp(&b.0.iptr));
    let mut merged: Vec<(RumItem, EntryKey)> = Vec::with_capacity(collected.len());
    for (item, key) in collected {
        match merged.last_mut() {
            Some(last) if last.0.iptr == item.iptr => {
                if let Some(join) = opclass.join_add_info.as_ref() {
                    if let (Some(a), Some(b)) = (
                        ctx.state.add_info_datum(attnum, &last.0),
                        ctx.state.add_info_datum(attnum, &item),
                    ) {
                        last.0 = ctx.state.make_item(attnum, item.iptr, Some(&join(&a, &b)))?;
                    }
                }
            }
            _ => merged.push((item, key)),
        }
    }
    if let Some(layout) = &ctx.order.layout {
        merged.sort_by(|a, b| layout.compare(&a.0, &b.0));
    }
    if ctx.order.backward {
        merged.reverse();
    }
    let (items, keys): (Vec<RumItem>, Vec<EntryKey>) = merged.into_iter().unzip();
    let keys = if entry.use_cur_key { keys } else { Vec::new() };
    log::debug!(
        "collected {} items for a {} entry on column {}",
        items.len(),
        if def.partial { "partial" } else { "full" },
        attnum
    );
    Ok(PostingStream::list(attnum, items, keys))
}
