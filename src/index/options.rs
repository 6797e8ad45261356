use serde::Deserialize;

use crate::error::{RumError, RumResult};

/// Index reloptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RumOptions {
    /// Column whose values are stored as AddInfo.
    pub attach: Option<String>,
    /// Column whose postings carry the attached values.
    pub to: Option<String>,
    /// Order the postings of `to` by `(AddInfo, item pointer)`.
    pub order_by_attach: bool,
}

impl RumOptions {
    pub fn from_json(text: &str) -> RumResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| RumError::bad_value(format!("invalid index options: {}", e)))
    }

    pub fn attach(attach: &str, to: &str, order_by_attach: bool) -> Self {
        Self {
            attach: Some(attach.to_string()),
            to: Some(to.to_string()),
            order_by_attach,
        }
    }
}

/// Column numbers the options resolve to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ResolvedOptions {
    pub attach_column: Option<u16>,
    pub add_to_column: Option<u16>,
    pub alternative_order: bool,
}

/// Resolves column names to attribute numbers, 1-based.
pub(crate) fn resolve(options: &RumOptions, columns: &[&str]) -> RumResult<ResolvedOptions> {
    let find = |name: &str| -> RumResult<u16> {
        columns
            .iter()
            .position(|&column| column == name)
            .map(|i| i as u16 + 1)
            .ok_or_else(|| {
                RumError::bad_value(format!("attribute \"{}\" is not found in index", name))
            })
    };

    let attach_column = options.attach.as_deref().map(find).transpose()?;
    let add_to_column = options.to.as_deref().map(find).transpose()?;

    if let (Some(attach), Some(to)) = (attach_column, add_to_column) {
        if attach == to {
            return Err(RumError::bad_value(format!(
                "column \"{}\" and attached column cannot be the same",
                options.to.as_deref().unwrap_or_default()
            )));
        }
    }
    if attach_column.is_some() != add_to_column.is_some() {
        return Err(RumError::bad_value(
            "AddTo and OrderBy columns should be defined both",
        ));
    }
    if options.order_by_attach && attach_column.is_none() {
        return Err(RumError::bad_value(
            "to use alternative ordering AddTo and OrderBy should be defined",
        ));
    }

    Ok(ResolvedOptions {
        attach_column,
        add_to_column,
        alternative_order: options.order_by_attach,
    })
}
