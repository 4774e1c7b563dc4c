use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::RowSchema;

/// Named category of report export tracked independently for "latest file" resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportType(String);

impl ReportType {
    pub const ACTIONS: &'static str = "actions";
    pub const CRIT_ACTIONS: &'static str = "crit_actions";
    pub const PERMS: &'static str = "perms";
    pub const CRIT_PERMS: &'static str = "crit_perms";
    /// Family of `actions` and `crit_actions`.
    pub const ALL_ACTIONS: &'static str = "all_actions";
    /// Family of `perms` and `crit_perms`.
    pub const ALL_PERMS: &'static str = "all_perms";

    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReportType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ReportType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ReportType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One physical report file as observed by the locator.
///
/// Immutable once observed. A replacement file with different content is a
/// distinct `ReportFile` even when it serves the same report type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFile {
    pub report_type: ReportType,
    pub location: PathBuf,
    /// Hex SHA-256 of the file contents.
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    /// Generation time embedded in the file name, when the name carries one.
    pub stamped_at: Option<NaiveDateTime>,
    pub size_bytes: u64,
    pub row_schema: RowSchema,
}

impl ReportFile {
    /// File name without extension, used to derive the critical flag.
    #[must_use]
    pub fn stem(&self) -> String {
        self.location
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Critical exports carry `crit` in their file name.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.stem().to_ascii_lowercase().contains("crit")
    }
}

/// One member file of a snapshot with the label its rows carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMember {
    pub file: Arc<ReportFile>,
    pub label: String,
}

/// What a query reads for one report type.
///
/// A plain report type has a single member. A report family lists the
/// current file of every member type, read back to back in member order;
/// its `content_hash` digests the member hashes, so it changes whenever any
/// member changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSnapshot {
    pub report_type: ReportType,
    pub content_hash: String,
    pub members: Vec<SnapshotMember>,
}

impl ReportSnapshot {
    /// Snapshot of a single file; it shares the file's hash.
    #[must_use]
    pub fn single(file: Arc<ReportFile>, label: impl Into<String>) -> Self {
        Self {
            report_type: file.report_type.clone(),
            content_hash: file.content_hash.clone(),
            members: vec![SnapshotMember {
                file,
                label: label.into(),
            }],
        }
    }

    /// Columns present in any member.
    #[must_use]
    pub fn row_schema(&self) -> RowSchema {
        RowSchema::union(self.members.iter().map(|m| &m.file.row_schema))
    }

    /// Member file locations in read order.
    #[must_use]
    pub fn locations(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|m| m.file.location.display().to_string())
            .collect()
    }
}
