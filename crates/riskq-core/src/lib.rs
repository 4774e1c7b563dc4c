//! Core domain types for the RiskQ report query engine.

pub mod config;
pub mod error;
pub mod query;
pub mod report;
pub mod schema;

pub use config::{
    CacheConfig, QueryConfig, RemoteConfig, ReportTypeConfig, RetryConfig, RiskqConfig,
    SourceConfig,
};
pub use error::{ErrorKind, RiskError, RiskResult};
pub use query::{
    FilterOp, FilterPredicate, FilterValue, OrderKey, QueryResult, QuerySpec, QueryStatus, Record,
    RiskFilters, SortDirection, SummaryGroup, SummaryResult,
};
pub use report::{ReportFile, ReportSnapshot, ReportType, SnapshotMember};
pub use schema::{ColumnKind, ColumnSpec, RowSchema};
