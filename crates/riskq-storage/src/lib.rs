//! Report resolution for RiskQ.
//!
//! - [`catalog`]: report type naming rules and report families
//! - [`hashing`]: content identity of report files
//! - [`memo`]: TTL-bounded single-flight memo of the latest file per type
//! - [`locator`]: local-folder or remote-cache resolution
//! - [`remote_cache`]: background-refreshed copies of remote exports

pub mod catalog;
pub mod hashing;
pub mod locator;
pub mod memo;
pub mod remote_cache;

pub use catalog::{NameMatch, ReportCatalog, ReportNaming};
pub use hashing::{combined_hash, content_hash, observe_file, observe_file_async};
pub use locator::{ReportLocator, SourceKind};
pub use memo::{LatestFileMemo, MemoEntry};
pub use remote_cache::{build_object_store, RefreshOutcome, RemoteCacheEntry, RemoteRefreshCache};
