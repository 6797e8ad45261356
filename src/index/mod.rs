//! The access method: index handle, build, insert, scan and vacuum.

mod am;
mod build;
mod insert;
mod options;
mod scan;
mod state;
mod vacuum;

use std::sync::Arc;

pub use am::{AmCapabilities, BuildPhase, IndexProperty, RUM_CAPABILITIES};
pub use insert::entry_insert;
pub use options::RumOptions;
pub use scan::{ExplainInfo, RumScan, ScanKeyData, ScanResult, ScanType, TidBitmap};
pub use state::{IndexColumn, RumColumn, RumState};

use crate::datatype::Datum;
use crate::error::RumResult;
use crate::guc::{self, RumGucs};
use crate::page::{page_read, Relation, METAPAGE_BLKNO};
use crate::tree::{ItemPointer, MetaPageData};

/// A heap row handed to [`RumIndex::build`]: one optional value per
/// index column.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapTuple {
    pub tid: ItemPointer,
    pub values: Vec<Option<Datum>>,
}

impl HeapTuple {
    pub fn new(tid: ItemPointer, values: Vec<Option<Datum>>) -> Self {
        Self { tid, values }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexBuildResult {
    pub heap_tuples: usize,
    /// Entries extracted, placeholders for null and empty values included.
    pub index_tuples: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexBulkDeleteResult {
    pub num_pages: u32,
    pub num_index_tuples: u64,
    pub tuples_removed: u64,
    pub pages_deleted: u32,
    pub pages_free: u32,
    /// The tuple count was not measured by this pass.
    pub estimated_count: bool,
}

/// An open index: its block storage plus the column definitions.
#[derive(Debug, Clone)]
pub struct RumIndex {
    rel: Relation,
    state: Arc<RumState>,
}

impl RumIndex {
    /// Defines a new, still unformatted index using the process wide
    /// configuration.
    pub fn create(name: &str, columns: Vec<IndexColumn>, options: &RumOptions) -> RumResult<Self> {
        Self::create_with_gucs(name, columns, options, guc::gucs())
    }

    pub fn create_with_gucs(
        name: &str,
        columns: Vec<IndexColumn>,
        options: &RumOptions,
        gucs: RumGucs,
    ) -> RumResult<Self> {
        let state = RumState::new(columns, options, gucs)?;
        Ok(Self {
            rel: Relation::new(name),
            state: Arc::new(state),
        })
    }

    /// Attaches to the formatted index stored in `rel`.
    pub fn open(rel: Relation, columns: Vec<IndexColumn>, options: &RumOptions) -> RumResult<Self> {
        let state = RumState::new(columns, options, guc::gucs())?;
        MetaPageData::read(&*page_read(&rel, METAPAGE_BLKNO)?)?;
        Ok(Self {
            rel,
            state: Arc::new(state),
        })
    }

    pub fn relation(&self) -> &Relation {
        &self.rel
    }

    pub fn state(&self) -> &RumState {
        &self.state
    }

    pub fn meta(&self) -> RumResult<MetaPageData> {
        MetaPageData::read(&*page_read(&self.rel, METAPAGE_BLKNO)?)
    }
}
