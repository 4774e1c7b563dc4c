//! Canonical column layout shared by every risk report export.
//!
//! Report files differ in which columns they actually carry. Every scanned row
//! is normalized onto [`CANONICAL_COLUMNS`] so filters, projections and cursors
//! always address the same column set regardless of the physical header.

use serde::{Deserialize, Serialize};

use crate::error::{RiskError, RiskResult};

/// Column carrying the critical-report flag derived from the file name.
pub const IS_CRITICAL_COLUMN: &str = "IsCritical";

/// Column carrying the report type label.
pub const REPORT_TYPE_COLUMN: &str = "ReportType";

/// Column whose values are collected as group examples in summaries.
pub const EXAMPLE_COLUMN: &str = "User Name";

/// Column holding the last execution date used by date-range filters.
pub const LAST_EXECUTED_COLUMN: &str = "Last Executed On";

/// Canonical column order.
pub const CANONICAL_COLUMNS: [&str; 17] = [
    "User ID",
    "User Name",
    "User Group",
    "Access Risk ID",
    "Risk Description",
    "Role ID",
    "Risk Level",
    "Function",
    "Function Description",
    "System",
    "Action",
    "Action Description",
    "Last Executed On",
    "Business Process",
    "Composite/Business Role Description",
    REPORT_TYPE_COLUMN,
    IS_CRITICAL_COLUMN,
];

/// Projection used when a query does not request columns.
pub const DEFAULT_COLUMNS: [&str; 10] = [
    "User ID",
    "User Name",
    "Role ID",
    "Risk Level",
    "Action",
    "Action Description",
    "System",
    "Last Executed On",
    IS_CRITICAL_COLUMN,
    REPORT_TYPE_COLUMN,
];

/// Columns a summary may group by.
pub const SUMMARY_GROUP_COLUMNS: [&str; 5] =
    ["Role ID", "User Name", "Risk Level", "Action", "System"];

/// Value type of a canonical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Utf8,
    Boolean,
}

/// Declared type of a canonical column.
#[must_use]
pub fn column_kind(name: &str) -> ColumnKind {
    if name == IS_CRITICAL_COLUMN {
        ColumnKind::Boolean
    } else {
        ColumnKind::Utf8
    }
}

/// Position of a canonical column in [`CANONICAL_COLUMNS`].
#[must_use]
pub fn column_index(name: &str) -> Option<usize> {
    CANONICAL_COLUMNS.iter().position(|c| *c == name)
}

/// Resolves a user supplied column name case-insensitively.
pub fn canonicalize_column(name: &str) -> RiskResult<&'static str> {
    let key = name.trim();
    CANONICAL_COLUMNS
        .iter()
        .find(|c| c.eq_ignore_ascii_case(key))
        .copied()
        .ok_or_else(|| RiskError::invalid_query(format!("unknown column: {name}")))
}

/// Resolves requested columns, preserving their order.
///
/// An empty request selects [`DEFAULT_COLUMNS`].
pub fn canonicalize_columns<S: AsRef<str>>(columns: &[S]) -> RiskResult<Vec<&'static str>> {
    if columns.is_empty() {
        return Ok(DEFAULT_COLUMNS.to_vec());
    }
    columns
        .iter()
        .map(|c| canonicalize_column(c.as_ref()))
        .collect()
}

/// One column of a report's row schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    /// Whether the physical file carries the column. Absent columns read as null.
    pub present: bool,
}

/// Typed column layout of a report file after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSchema {
    pub columns: Vec<ColumnSpec>,
}

impl RowSchema {
    /// Builds the normalized schema from a physical header row.
    ///
    /// `ReportType` and `IsCritical` are always present because they are
    /// derived from the report identity, not read from the file.
    pub fn from_header<S: AsRef<str>>(header: &[S]) -> Self {
        let columns = CANONICAL_COLUMNS
            .iter()
            .map(|name| {
                let derived = *name == REPORT_TYPE_COLUMN || *name == IS_CRITICAL_COLUMN;
                ColumnSpec {
                    name: (*name).to_string(),
                    kind: column_kind(name),
                    present: derived || header.iter().any(|h| h.as_ref().trim() == *name),
                }
            })
            .collect();
        Self { columns }
    }

    /// Schema of files read back to back: a column is present if any file has it.
    pub fn union<'a>(schemas: impl IntoIterator<Item = &'a RowSchema>) -> Self {
        let mut merged = Self::from_header::<&str>(&[]);
        for schema in schemas {
            for (column, other) in merged.columns.iter_mut().zip(&schema.columns) {
                column.present |= other.present;
            }
        }
        merged
    }

    /// Column names in canonical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Canonical columns the physical file does not carry.
    pub fn missing(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !c.present)
            .map(|c| c.name.as_str())
            .collect()
    }
}
