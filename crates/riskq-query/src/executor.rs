//! Query Executor
//!
//! Runs one request through `Resolving → ValidatingCursor → Scanning →
//! Emitting`. The deadline starts when scanning starts; a scan cut short by
//! the deadline is emitted as a `partial` result carrying a resume cursor,
//! even when it gathered no rows yet.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use riskq_core::schema::{canonicalize_column, canonicalize_columns, SUMMARY_GROUP_COLUMNS};
use riskq_core::{
    QueryConfig, QueryResult, QuerySpec, ReportSnapshot, ReportType, RiskError,
    RiskResult, RowSchema, SummaryResult,
};
use riskq_storage::ReportLocator;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cursor::{Cursor, CursorMode};
use crate::deadline::Deadline;
use crate::filter::CompiledFilter;
use crate::scan::{Aggregation, ScanEngine};

/// Stage of a request, reported in debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    ValidatingCursor,
    Scanning,
    Emitting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "resolving",
            Self::ValidatingCursor => "validating_cursor",
            Self::Scanning => "scanning",
            Self::Emitting => "emitting",
        };
        f.write_str(name)
    }
}

/// Column layout of the current snapshot of a report type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaInfo {
    pub report_type: ReportType,
    pub content_hash: String,
    /// Member files in read order; one entry unless the type is a family.
    pub locations: Vec<String>,
    pub schema: RowSchema,
}

/// Orchestrates locator, scan engine and cursor codec per request.
pub struct QueryExecutor {
    locator: Arc<ReportLocator>,
    engine: ScanEngine,
    deadline: Duration,
    config: QueryConfig,
}

impl QueryExecutor {
    pub fn new(locator: Arc<ReportLocator>, config: QueryConfig) -> Self {
        Self {
            locator,
            engine: ScanEngine::new(config.batch_size),
            deadline: config.deadline(),
            config,
        }
    }

    /// Overrides the per-request scan budget.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn locator(&self) -> &Arc<ReportLocator> {
        &self.locator
    }

    pub fn engine(&self) -> &ScanEngine {
        &self.engine
    }

    /// Row fetch: one page of matching rows.
    pub async fn execute(&self, spec: &QuerySpec, cursor: Option<&str>) -> RiskResult<QueryResult> {
        let started = Instant::now();
        self.validate_rows_spec(spec)?;

        let (snapshot, resume) = self.prepare(spec, cursor, CursorMode::Rows).await?;
        let start = resume.map(|c| c.keyset()).unwrap_or_default();
        let offset = start.position;

        debug!(report_type = %spec.report_type, offset, stage = %Stage::Scanning, "Scanning report");
        let deadline = Deadline::start(self.deadline);
        let scan = self
            .engine
            .scan(Arc::clone(&snapshot))
            .filters(spec.filters.iter().cloned())
            .select(spec.columns.iter().cloned())
            .order_by(spec.order_by.iter().cloned());
        let limit = spec.limit;
        let page = run_blocking(move || scan.resume_rows(start, limit, &deadline)).await?;

        debug!(report_type = %spec.report_type, stage = %Stage::Emitting, "Emitting rows");
        let next_cursor = if page.is_partial() {
            Some(Cursor::resume(&snapshot, spec, page.next)?.encode()?)
        } else {
            None
        };
        let result = QueryResult::new(page.rows, next_cursor, started.elapsed(), &snapshot, page.rows_scanned);

        info!(
            report_type = %spec.report_type,
            filters = spec.filters.len(),
            offset,
            rows = result.rows.len(),
            rows_scanned = result.rows_scanned,
            status = ?result.status,
            deadline_hit = page.deadline_hit,
            elapsed_ms = result.elapsed_ms,
            "Query executed"
        );
        Ok(result)
    }

    /// Group-by summary with top-N groups.
    pub async fn summarize(&self, spec: &QuerySpec, cursor: Option<&str>) -> RiskResult<SummaryResult> {
        let group_by = spec
            .group_by
            .as_deref()
            .ok_or_else(|| RiskError::invalid_query("summary requires a group-by column"))?;
        let column = canonicalize_column(group_by)?;
        if !SUMMARY_GROUP_COLUMNS.contains(&column) {
            return Err(RiskError::invalid_query(format!(
                "cannot group by {column}; expected one of {}",
                SUMMARY_GROUP_COLUMNS.join(", ")
            )));
        }
        self.aggregate(spec, column, cursor).await
    }

    /// Value counts of any canonical column, for filter pickers.
    pub async fn facets(
        &self,
        report_type: &ReportType,
        column: &str,
        n: usize,
        cursor: Option<&str>,
    ) -> RiskResult<SummaryResult> {
        let column = canonicalize_column(column)?;
        let spec = QuerySpec::new(report_type.clone()).group_by(column).top(n);
        self.aggregate(&spec, column, cursor).await
    }

    /// Columns of the current report snapshot, without scanning rows.
    pub async fn schema(&self, report_type: &ReportType) -> RiskResult<SchemaInfo> {
        let snapshot = self.locator.snapshot(report_type).await?;
        Ok(SchemaInfo {
            report_type: snapshot.report_type.clone(),
            content_hash: snapshot.content_hash.clone(),
            locations: snapshot.locations(),
            schema: self.engine.schema(&snapshot),
        })
    }

    async fn aggregate(
        &self,
        spec: &QuerySpec,
        column: &'static str,
        cursor: Option<&str>,
    ) -> RiskResult<SummaryResult> {
        let started = Instant::now();
        if spec.top == 0 || spec.top > self.config.max_top {
            return Err(RiskError::invalid_query(format!(
                "top must be within 1..={}",
                self.config.max_top
            )));
        }
        CompiledFilter::compile(&spec.filters)?;

        let (snapshot, resume) = self.prepare(spec, cursor, CursorMode::Summary).await?;
        let offset = resume.map_or(0, |c| c.offset);

        debug!(report_type = %spec.report_type, offset, stage = %Stage::Scanning, "Aggregating report");
        let deadline = Deadline::start(self.deadline);
        let scan = self
            .engine
            .scan(Arc::clone(&snapshot))
            .filters(spec.filters.iter().cloned());
        let mut aggregation: Aggregation =
            run_blocking(move || scan.aggregate(column, offset, &deadline)).await?;

        debug!(report_type = %spec.report_type, stage = %Stage::Emitting, "Emitting summary");
        // Only a single call that saw the whole snapshot knows the true top N
        let truncated = if offset == 0 && aggregation.exhausted {
            aggregation.truncate(spec.top)
        } else {
            false
        };
        let next_cursor = if aggregation.exhausted {
            None
        } else {
            Some(Cursor::new(&snapshot, spec, aggregation.next_offset, CursorMode::Summary)?.encode()?)
        };

        let result = SummaryResult::new(
            aggregation.groups,
            next_cursor,
            started.elapsed(),
            &snapshot,
            column,
            aggregation.rows_scanned,
            aggregation.rows_matched,
            truncated,
        );

        info!(
            report_type = %spec.report_type,
            group_by = column,
            filters = spec.filters.len(),
            offset,
            groups = result.groups.len(),
            rows_scanned = result.rows_scanned,
            rows_matched = result.rows_matched,
            status = ?result.status,
            elapsed_ms = result.elapsed_ms,
            "Summary executed"
        );
        Ok(result)
    }

    /// Resolving and cursor validation shared by all scanning requests.
    async fn prepare(
        &self,
        spec: &QuerySpec,
        cursor: Option<&str>,
        mode: CursorMode,
    ) -> RiskResult<(Arc<ReportSnapshot>, Option<Cursor>)> {
        debug!(report_type = %spec.report_type, stage = %Stage::Resolving, "Resolving report");
        let snapshot = self.locator.snapshot(&spec.report_type).await?;

        let Some(token) = cursor.filter(|t| !t.trim().is_empty()) else {
            return Ok((snapshot, None));
        };

        debug!(report_type = %spec.report_type, stage = %Stage::ValidatingCursor, "Validating cursor");
        let cursor = Cursor::decode(token)?;
        if let Err(e) = cursor.validate(&snapshot, spec, mode) {
            warn!(
                report_type = %spec.report_type,
                content_hash = %snapshot.content_hash,
                error = %e,
                "Rejected stale cursor"
            );
            return Err(e);
        }
        Ok((snapshot, Some(cursor)))
    }

    fn validate_rows_spec(&self, spec: &QuerySpec) -> RiskResult<()> {
        if spec.limit == 0 || spec.limit > self.config.max_limit {
            return Err(RiskError::invalid_query(format!(
                "limit must be within 1..={}",
                self.config.max_limit
            )));
        }
        canonicalize_columns(&spec.columns)?;
        for key in &spec.order_by {
            canonicalize_column(&key.column)?;
        }
        CompiledFilter::compile(&spec.filters)?;
        Ok(())
    }
}

async fn run_blocking<T, F>(scan: F) -> RiskResult<T>
where
    F: FnOnce() -> RiskResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(scan)
        .await
        .map_err(|e| RiskError::internal(format!("scan task failed: {e}")))?
}
