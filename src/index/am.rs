use super::RumIndex;

/// Fixed capabilities the access method reports to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmCapabilities {
    pub can_order: bool,
    pub can_order_by_op: bool,
    pub can_backward: bool,
    pub can_unique: bool,
    pub can_multi_col: bool,
    pub optional_key: bool,
    pub search_array: bool,
    pub search_nulls: bool,
    pub storage: bool,
    pub clusterable: bool,
    pub pred_locks: bool,
    pub can_parallel: bool,
    pub can_mark_restore: bool,
}

pub const RUM_CAPABILITIES: AmCapabilities = AmCapabilities {
    can_order: false,
    can_order_by_op: true,
    can_backward: false,
    can_unique: false,
    can_multi_col: true,
    optional_key: true,
    search_array: false,
    search_nulls: false,
    storage: true,
    clusterable: false,
    pred_locks: true,
    can_parallel: false,
    can_mark_restore: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexProperty {
    DistanceOrderable,
    Orderable,
    Returnable,
    SearchArray,
    SearchNulls,
}

/// Progress phases of an index build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Initialize,
    TableScan,
    SortWorkers,
    MergeWorkers,
    Sort,
    Merge,
}

impl BuildPhase {
    pub fn name(self) -> &'static str {
        match self {
            BuildPhase::Initialize => "initializing",
            BuildPhase::TableScan => "scanning table",
            BuildPhase::SortWorkers => "sorting tuples (workers)",
            BuildPhase::MergeWorkers => "merging tuples (workers)",
            BuildPhase::Sort => "sorting tuples",
            BuildPhase::Merge => "merging tuples",
        }
    }
}

impl RumIndex {
    /// Answers column level property inquiries. `None` leaves the answer
    /// to the generic rules of the host.
    pub fn property(&self, attnum: u16, prop: IndexProperty) -> Option<bool> {
        if attnum == 0 || attnum > self.state.natts() {
            return None;
        }
        match prop {
            IndexProperty::DistanceOrderable => Some(self.state.opclass(attnum).can_ordering()),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> AmCapabilities {
        RUM_CAPABILITIES
    }
}
