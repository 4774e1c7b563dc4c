//! Lazy query engine over risk report exports.
//!
//! The [`QueryExecutor`] resolves the current snapshot of a report type through
//! the storage locator, scans it lazily under a deadline and hands out opaque
//! cursors for the remaining rows.

pub mod cursor;
pub mod deadline;
pub mod executor;
pub mod filter;
pub mod reader;
pub mod scan;
pub mod summary;

pub use cursor::{
    filter_fingerprint, ordering_fingerprint, Cursor, CursorMode, Keyset, SortMark, CURSOR_VERSION,
};
pub use deadline::Deadline;
pub use executor::{QueryExecutor, SchemaInfo, Stage};
pub use filter::CompiledFilter;
pub use reader::{Row, RowReader};
pub use scan::{Aggregation, LazyScan, RowPage, ScanEngine};
pub use summary::SummaryMerger;
