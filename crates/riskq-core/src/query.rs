//! Query request and result types exchanged with the routing layer.

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::report::{ReportSnapshot, ReportType};
use crate::schema::LAST_EXECUTED_COLUMN;

/// Page size used when a request does not specify one.
pub const DEFAULT_LIMIT: usize = 50;

/// Number of summary groups returned when a request does not specify one.
pub const DEFAULT_TOP: usize = 20;

/// Field-keyed output record, in projection order.
pub type Record = serde_json::Map<String, Value>;

/// Comparison applied by a [`FilterPredicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// Case-insensitive equality.
    Eq,
    /// Case-insensitive inequality.
    Ne,
    /// Case-insensitive substring match.
    Contains,
    /// Case-insensitive membership in a list.
    In,
    /// Greater than or equal (dates, then numbers, then text).
    Gte,
    /// Less than or equal (dates, then numbers, then text).
    Lte,
}

impl FilterOp {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Contains => "contains",
            Self::In => "in",
            Self::Gte => "gte",
            Self::Lte => "lte",
        }
    }
}

/// Right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(String),
    Many(Vec<String>),
}

impl FilterValue {
    /// All operand values; a single value yields a one-element list.
    #[must_use]
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::One(v) => vec![v.as_str()],
            Self::Many(vs) => vs.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::One(value)
    }
}

/// `(field, operator, value)` filter. Holds when any listed field satisfies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub fields: Vec<String>,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl FilterPredicate {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<FilterValue>) -> Self {
        Self {
            fields: vec![field.into()],
            op,
            value: value.into(),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(field, FilterOp::Eq, FilterValue::One(value.into()))
    }

    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(field, FilterOp::Contains, FilterValue::One(value.into()))
    }

    pub fn one_of<I, S>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            field,
            FilterOp::In,
            FilterValue::Many(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Predicate that holds when any of `fields` satisfies it.
    pub fn any_of<I, S>(fields: I, op: FilterOp, value: impl Into<FilterValue>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            op,
            value: value.into(),
        }
    }
}

/// The named filters exposed by the risk endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFilters {
    /// Substring over `User ID` and `User Name`.
    pub user: Option<String>,
    pub role: Option<String>,
    pub risk_level: Option<String>,
    pub system: Option<String>,
    pub action: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl RiskFilters {
    /// Translates the named filters into predicates; empty values are skipped.
    #[must_use]
    pub fn into_predicates(self) -> Vec<FilterPredicate> {
        let mut predicates = Vec::new();
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        if let Some(user) = present(self.user) {
            predicates.push(FilterPredicate::any_of(
                ["User ID", "User Name"],
                FilterOp::Contains,
                user,
            ));
        }
        for (column, value) in [
            ("Role ID", self.role),
            ("Risk Level", self.risk_level),
            ("System", self.system),
            ("Action", self.action),
        ] {
            if let Some(value) = present(value) {
                predicates.push(FilterPredicate::equals(column, value));
            }
        }
        if let Some(from) = self.date_from {
            predicates.push(FilterPredicate::new(
                LAST_EXECUTED_COLUMN,
                FilterOp::Gte,
                from.format("%Y-%m-%d").to_string(),
            ));
        }
        if let Some(to) = self.date_to {
            predicates.push(FilterPredicate::new(
                LAST_EXECUTED_COLUMN,
                FilterOp::Lte,
                to.format("%Y-%m-%d").to_string(),
            ));
        }
        predicates
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One ordering key; keys apply in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderKey {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Validated request handed to the query executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub report_type: ReportType,
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
    /// Requested projection; empty means the default column set.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub order_by: Vec<OrderKey>,
    pub limit: usize,
    /// Number of groups kept by a summary.
    pub top: usize,
}

impl QuerySpec {
    pub fn new(report_type: impl Into<ReportType>) -> Self {
        Self {
            report_type: report_type.into(),
            filters: Vec::new(),
            columns: Vec::new(),
            group_by: None,
            order_by: Vec::new(),
            limit: DEFAULT_LIMIT,
            top: DEFAULT_TOP,
        }
    }

    #[must_use]
    pub fn filter(mut self, predicate: FilterPredicate) -> Self {
        self.filters.push(predicate);
        self
    }

    #[must_use]
    pub fn filters(mut self, predicates: impl IntoIterator<Item = FilterPredicate>) -> Self {
        self.filters.extend(predicates);
        self
    }

    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderKey {
            column: column.into(),
            direction,
        });
        self
    }

    #[must_use]
    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group_by = Some(column.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn top(mut self, top: usize) -> Self {
        self.top = top;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Complete,
    Partial,
}

/// Page of rows produced by the executor.
///
/// `status` is derived from `next_cursor`: a partial result always carries a
/// cursor and a complete one never does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Record>,
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub elapsed_ms: u64,
    pub report_type: ReportType,
    pub content_hash: String,
    pub rows_scanned: u64,
}

impl QueryResult {
    pub fn new(
        rows: Vec<Record>,
        next_cursor: Option<String>,
        elapsed: Duration,
        snapshot: &ReportSnapshot,
        rows_scanned: u64,
    ) -> Self {
        Self {
            rows,
            status: status_for(&next_cursor),
            next_cursor,
            elapsed_ms: elapsed.as_millis() as u64,
            report_type: snapshot.report_type.clone(),
            content_hash: snapshot.content_hash.clone(),
            rows_scanned,
        }
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.status == QueryStatus::Partial
    }
}

/// Aggregated group of a summary or facet request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryGroup {
    pub group: Value,
    pub count: u64,
    #[serde(default)]
    pub examples: Vec<String>,
    /// Raw row position where the group first appeared; breaks count ties.
    #[serde(default)]
    pub first_seen: u64,
}

impl SummaryGroup {
    /// Count descending, then first appearance.
    #[must_use]
    pub fn rank(&self, other: &Self) -> std::cmp::Ordering {
        other
            .count
            .cmp(&self.count)
            .then(self.first_seen.cmp(&other.first_seen))
    }
}

/// Group-by result; partial results hold the aggregate over the rows scanned so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub groups: Vec<SummaryGroup>,
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub elapsed_ms: u64,
    pub report_type: ReportType,
    pub content_hash: String,
    pub group_by: String,
    /// Raw rows consumed by this call.
    pub rows_scanned: u64,
    /// Rows that satisfied the filters among those scanned.
    pub rows_matched: u64,
    /// Whether `groups` was cut to the requested top-N.
    pub truncated: bool,
}

impl SummaryResult {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        groups: Vec<SummaryGroup>,
        next_cursor: Option<String>,
        elapsed: Duration,
        snapshot: &ReportSnapshot,
        group_by: &str,
        rows_scanned: u64,
        rows_matched: u64,
        truncated: bool,
    ) -> Self {
        Self {
            groups,
            status: status_for(&next_cursor),
            next_cursor,
            elapsed_ms: elapsed.as_millis() as u64,
            report_type: snapshot.report_type.clone(),
            content_hash: snapshot.content_hash.clone(),
            group_by: group_by.to_string(),
            rows_scanned,
            rows_matched,
            truncated,
        }
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.status == QueryStatus::Partial
    }
}

fn status_for(next_cursor: &Option<String>) -> QueryStatus {
    if next_cursor.is_some() {
        QueryStatus::Partial
    } else {
        QueryStatus::Complete
    }
}
