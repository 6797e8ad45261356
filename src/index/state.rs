use std::cmp::Ordering;

use super::options::{resolve, RumOptions};
use crate::datatype::{Datum, TypeInfo};
use crate::error::{RumError, RumResult};
use crate::guc::RumGucs;
use crate::opclass::RumOpClass;
use crate::tree::{compare_entries, EntryKey, EntryKeyspace, ItemPointer, NullCategory, PostingLayout, RumItem};

/// Definition of one index column.
#[derive(Debug, Clone)]
pub struct IndexColumn {
    pub name: String,
    /// Type of the heap values; only matters for the attach column.
    pub type_info: TypeInfo,
    pub opclass: RumOpClass,
}

impl IndexColumn {
    pub fn new(name: &str, type_info: TypeInfo, opclass: RumOpClass) -> Self {
        Self {
            name: name.to_string(),
            type_info,
            opclass,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RumColumn {
    pub name: String,
    pub type_info: TypeInfo,
    pub opclass: RumOpClass,
    pub layout: PostingLayout,
    pub add_info_type: Option<TypeInfo>,
}

/// Everything an operation needs to know about the index definition.
#[derive(Debug, Clone)]
pub struct RumState {
    pub columns: Vec<RumColumn>,
    pub one_col: bool,
    pub attach_column: Option<u16>,
    pub add_to_column: Option<u16>,
    pub alternative_order: bool,
    pub gucs: RumGucs,
}

impl RumState {
    pub fn new(columns: Vec<IndexColumn>, options: &RumOptions, gucs: RumGucs) -> RumResult<Self> {
        if columns.is_empty() {
            return Err(RumError::bad_value("index must have at least one column"));
        }
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let resolved = resolve(options, &names)?;

        let attach_type = resolved
            .attach_column
            .map(|attnum| columns[attnum as usize - 1].type_info);
        let mut out = Vec::with_capacity(columns.len());
        for (i, column) in columns.into_iter().enumerate() {
            let attnum = i as u16 + 1;
            let mut add_info_type = column.opclass.add_info_type();
            if resolved.add_to_column == Some(attnum) {
                if add_info_type.is_some() {
                    return Err(RumError::bad_value("AddTo could should not have AddInfo"));
                }
                let attach_type = attach_type
                    .ok_or_else(|| RumError::internal("attach column is not resolved"))?;
                if resolved.alternative_order && !attach_type.by_val() {
                    return Err(RumError::not_supported(
                        "doesn't support order index over pass-by-reference column",
                    ));
                }
                add_info_type = Some(attach_type);
            }
            if let Some(ty) = add_info_type {
                if !ty.by_val() {
                    return Err(RumError::not_supported(format!(
                        "{} is not supported as additional info type for column \"{}\"",
                        ty.name(),
                        column.name
                    )));
                }
            }
            let layout = PostingLayout {
                alternative_order: resolved.alternative_order,
                order_by_add_info: resolved.alternative_order
                    && resolved.add_to_column == Some(attnum),
                add_info_type,
                add_info_cmp: None,
                strict_decoding: gucs.throw_error_on_invalid_data_page,
                new_item_ptr_decoding: gucs.use_new_item_ptr_decoding,
            };
            out.push(RumColumn {
                name: column.name,
                type_info: column.type_info,
                opclass: column.opclass,
                layout,
                add_info_type,
            });
        }

        Ok(Self {
            one_col: out.len() == 1,
            columns: out,
            attach_column: resolved.attach_column,
            add_to_column: resolved.add_to_column,
            alternative_order: resolved.alternative_order,
            gucs,
        })
    }

    pub fn column(&self, attnum: u16) -> &RumColumn {
        &self.columns[attnum as usize - 1]
    }

    pub fn opclass(&self, attnum: u16) -> &RumOpClass {
        &self.column(attnum).opclass
    }

    pub fn natts(&self) -> u16 {
        self.columns.len() as u16
    }

    pub fn split_size(&self) -> Option<usize> {
        (self.gucs.data_page_intermediate_split_size > 0)
            .then_some(self.gucs.data_page_intermediate_split_size as usize)
    }

    /// Entries of one column value, sorted and without duplicates. A null
    /// value and a value without keys get placeholder entries.
    pub fn extract_entries(
        &self,
        attnum: u16,
        value: Option<&Datum>,
    ) -> RumResult<Vec<(EntryKey, Option<Datum>)>> {
        let Some(value) = value else {
            return Ok(vec![(EntryKey::new(attnum, None, NullCategory::NullItem), None)]);
        };
        let extracted = (self.opclass(attnum).extract_value)(value)?;
        if extracted.is_empty() {
            return Ok(vec![(EntryKey::new(attnum, None, NullCategory::EmptyItem), None)]);
        }
        let mut entries: Vec<(EntryKey, Option<Datum>)> = extracted
            .into_iter()
            .map(|e| {
                let category = if e.key.is_some() {
                    NullCategory::NormKey
                } else {
                    NullCategory::NullKey
                };
                (EntryKey::new(attnum, e.key, category), e.add_info)
            })
            .collect();
        if entries.len() > 1 {
            let mut error = None;
            entries.sort_by(|a, b| {
                compare_entries(self, &a.0, &b.0).unwrap_or_else(|e| {
                    error.get_or_insert(e);
                    Ordering::Equal
                })
            });
            if let Some(e) = error {
                return Err(e);
            }
            let mut deduped: Vec<(EntryKey, Option<Datum>)> = Vec::with_capacity(entries.len());
            for entry in entries {
                if let Some(last) = deduped.last() {
                    if compare_entries(self, &last.0, &entry.0)? == Ordering::Equal {
                        continue;
                    }
                }
                deduped.push(entry);
            }
            entries = deduped;
        }
        Ok(entries)
    }

    /// Builds the posting for a heap row of column `attnum`.
    pub fn make_item(&self, attnum: u16, tid: ItemPointer, add_info: Option<&Datum>) -> RumResult<RumItem> {
        let Some(add_info) = add_info else {
            return Ok(RumItem::new(tid));
        };
        let column = self.column(attnum);
        let ty = column.add_info_type.ok_or_else(|| {
            RumError::internal(format!(
                "additional information attribute \"{}\" is not found in index",
                column.name
            ))
        })?;
        Ok(RumItem::with_add_info(tid, Some(ty.to_raw(add_info)?)))
    }

    pub fn add_info_datum(&self, attnum: u16, item: &RumItem) -> Option<Datum> {
        let ty = self.column(attnum).add_info_type?;
        item.add_info().map(|raw| ty.from_raw(raw))
    }
}

impl EntryKeyspace for RumState {
    fn one_col(&self) -> bool {
        self.one_col
    }

    fn key_type(&self, attnum: u16) -> TypeInfo {
        self.opclass(attnum).key_type
    }

    fn compare_keys(&self, attnum: u16, a: &Datum, b: &Datum) -> RumResult<Ordering> {
        self.opclass(attnum).compare(a, b)
    }

    fn layout(&self, attnum: u16) -> &PostingLayout {
        &self.column(attnum).layout
    }
}
