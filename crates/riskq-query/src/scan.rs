//! Lazy Scan Engine
//!
//! A [`LazyScan`] accumulates filters, projection and ordering without touching
//! the snapshot. Only the terminal operations ([`LazyScan::fetch_rows`],
//! [`LazyScan::resume_rows`] and [`LazyScan::aggregate`]) stream the report,
//! and they keep bounded state:
//!
//! - unordered row fetch skips to a raw row position without decoding, then
//!   stops after `limit` matches plus the next one
//! - ordered row fetch keeps the best `limit + 1` rows past the last emitted
//!   one in a heap; a page completes only after a full pass
//! - aggregation keeps one counter per group
//!
//! The deadline is checked once per batch. A scan stopped by it reports the
//! raw row it reached, so even a batch without matches counts as progress.
//! All operations are blocking and meant to run on the blocking thread pool.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use riskq_core::schema::{
    canonicalize_column, canonicalize_columns, column_index, column_kind, ColumnKind,
    EXAMPLE_COLUMN,
};
use riskq_core::{
    FilterPredicate, OrderKey, Record, ReportSnapshot, RiskError, RiskResult, RowSchema,
    SortDirection, SummaryGroup,
};
use serde_json::Value;

use crate::cursor::{Keyset, SortMark};
use crate::deadline::Deadline;
use crate::filter::{parse_date, CompiledFilter};
use crate::reader::{Row, RowReader};

/// Example values kept per summary group.
pub const MAX_GROUP_EXAMPLES: usize = 3;

/// Factory of lazy scans over report snapshots.
#[derive(Debug, Clone)]
pub struct ScanEngine {
    batch_size: usize,
}

impl ScanEngine {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn scan(&self, snapshot: Arc<ReportSnapshot>) -> LazyScan {
        LazyScan {
            snapshot,
            batch_size: self.batch_size,
            filters: Vec::new(),
            columns: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Column names and types of a report, without scanning it.
    pub fn schema(&self, snapshot: &ReportSnapshot) -> RowSchema {
        snapshot.row_schema()
    }

    /// Most frequent values of one column over the whole snapshot.
    ///
    /// Values are truncated to `n` groups only when the deadline allowed a
    /// full pass.
    pub fn facets(
        &self,
        snapshot: Arc<ReportSnapshot>,
        column: &str,
        n: usize,
        deadline: &Deadline,
    ) -> RiskResult<Aggregation> {
        let mut aggregation = self.scan(snapshot).aggregate(column, 0, deadline)?;
        if aggregation.exhausted {
            aggregation.truncate(n);
        }
        Ok(aggregation)
    }
}

impl Default for ScanEngine {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Deferred scan of one report snapshot.
#[derive(Debug, Clone)]
pub struct LazyScan {
    snapshot: Arc<ReportSnapshot>,
    batch_size: usize,
    filters: Vec<FilterPredicate>,
    columns: Vec<String>,
    order: Vec<OrderKey>,
}

/// One page of a row fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPage {
    pub rows: Vec<Record>,
    /// More matching rows exist past this page.
    pub has_more: bool,
    /// The deadline stopped the scan before the page was complete.
    pub deadline_hit: bool,
    /// Where a follow-up page resumes.
    pub next: Keyset,
    /// Rows read by this call, after the starting position.
    pub rows_scanned: u64,
}

impl RowPage {
    pub fn is_partial(&self) -> bool {
        self.has_more || self.deadline_hit
    }
}

/// Group counts over a run of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    /// Groups by count descending, ties by earliest raw row.
    pub groups: Vec<SummaryGroup>,
    /// Rows read by this call, after the starting offset.
    pub rows_scanned: u64,
    pub rows_matched: u64,
    /// Raw row position reached; aggregation resumes here.
    pub next_offset: u64,
    /// The snapshot was read to the end.
    pub exhausted: bool,
}

impl Aggregation {
    /// Keeps the first `n` groups. Returns whether any group was dropped.
    pub fn truncate(&mut self, n: usize) -> bool {
        let truncated = self.groups.len() > n;
        self.groups.truncate(n);
        truncated
    }
}

impl LazyScan {
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

    /// Projection; an empty list selects the default columns.
    #[must_use]
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn order_by(mut self, keys: impl IntoIterator<Item = OrderKey>) -> Self {
        self.order.extend(keys);
        self
    }

    /// First page of up to `limit` matching rows, scanning from raw row `offset`.
    pub fn fetch_rows(self, offset: u64, limit: usize, deadline: &Deadline) -> RiskResult<RowPage> {
        self.resume_rows(Keyset::at(offset), limit, deadline)
    }

    /// Next page of up to `limit` matching rows in requested order.
    pub fn resume_rows(self, start: Keyset, limit: usize, deadline: &Deadline) -> RiskResult<RowPage> {
        let filter = CompiledFilter::compile(&self.filters)?;
        let projection = resolve_projection(&self.columns)?;
        let order = resolve_order(&self.order)?;
        let mut reader = RowReader::open(&self.snapshot)?;

        let window = Window {
            filter: &filter,
            projection: &projection,
            limit,
            batch_size: self.batch_size,
            deadline,
        };
        if order.is_empty() {
            fetch_in_file_order(&mut reader, &window, start.position)
        } else {
            fetch_ordered(&self.snapshot, &mut reader, &window, &order, start)
        }
    }

    /// Counts matching rows per value of `column`, starting at raw row `offset`.
    ///
    /// At least one batch is consumed before the deadline is honored.
    pub fn aggregate(self, column: &str, offset: u64, deadline: &Deadline) -> RiskResult<Aggregation> {
        let column = canonicalize_column(column)?;
        let column_idx = position_of(column)?;
        let example_idx = position_of(EXAMPLE_COLUMN)?;
        let boolean = column_kind(column) == ColumnKind::Boolean;

        let filter = CompiledFilter::compile(&self.filters)?;
        let mut reader = RowReader::open(&self.snapshot)?;
        let skipped = reader.skip_rows(offset)?;

        let mut groups: Vec<SummaryGroup> = Vec::new();
        let mut slots: HashMap<Option<String>, usize> = HashMap::new();
        let mut rows_matched = 0u64;
        let mut in_batch = 0usize;

        let exhausted = loop {
            let seq = reader.position();
            let Some(row) = reader.next_row()? else {
                break true;
            };

            if filter.matches(&row) {
                rows_matched += 1;
                let key = row.get(column_idx).map(str::to_string);
                let slot = *slots.entry(key).or_insert_with_key(|key| {
                    groups.push(SummaryGroup {
                        group: group_value(key.as_deref(), boolean),
                        count: 0,
                        examples: Vec::new(),
                        first_seen: seq,
                    });
                    groups.len() - 1
                });

                let group = &mut groups[slot];
                group.count += 1;
                if group.examples.len() < MAX_GROUP_EXAMPLES {
                    if let Some(example) = row.get(example_idx) {
                        group.examples.push(example.to_string());
                    }
                }
            }

            in_batch += 1;
            if in_batch == self.batch_size {
                in_batch = 0;
                if deadline.expired() && !reader.at_end()? {
                    break false;
                }
            }
        };

        groups.sort_by(SummaryGroup::rank);

        Ok(Aggregation {
            groups,
            rows_scanned: reader.position() - skipped,
            rows_matched,
            next_offset: reader.position(),
            exhausted,
        })
    }
}

/// Page shape shared by both row fetch strategies.
struct Window<'a> {
    filter: &'a CompiledFilter,
    projection: &'a [(usize, &'static str)],
    limit: usize,
    batch_size: usize,
    deadline: &'a Deadline,
}

fn position_of(column: &str) -> RiskResult<usize> {
    column_index(column).ok_or_else(|| RiskError::internal(format!("column without position: {column}")))
}

fn resolve_projection(columns: &[String]) -> RiskResult<Vec<(usize, &'static str)>> {
    canonicalize_columns(columns)?
        .into_iter()
        .map(|name| Ok((position_of(name)?, name)))
        .collect()
}

fn resolve_order(keys: &[OrderKey]) -> RiskResult<Vec<(usize, SortDirection)>> {
    keys.iter()
        .map(|key| {
            let name = canonicalize_column(&key.column)?;
            Ok((position_of(name)?, key.direction))
        })
        .collect()
}

fn group_value(key: Option<&str>, boolean: bool) -> Value {
    match key {
        None => Value::Null,
        Some(cell) if boolean => Value::Bool(cell.eq_ignore_ascii_case("true")),
        Some(cell) => Value::String(cell.to_string()),
    }
}

fn fetch_in_file_order(reader: &mut RowReader, window: &Window<'_>, offset: u64) -> RiskResult<RowPage> {
    let skipped = reader.skip_rows(offset)?;
    let mut rows = Vec::with_capacity(window.limit.min(window.batch_size));
    let mut in_batch = 0usize;

    let page = |rows: Vec<Record>, has_more: bool, deadline_hit: bool, next: u64| RowPage {
        rows,
        has_more,
        deadline_hit,
        next: Keyset::at(next),
        rows_scanned: next - skipped,
    };

    loop {
        let seq = reader.position();
        let Some(row) = reader.next_row()? else {
            return Ok(page(rows, false, false, reader.position()));
        };

        if window.filter.matches(&row) {
            if rows.len() == window.limit {
                // The follow-up page starts at this row
                return Ok(page(rows, true, false, seq));
            }
            rows.push(row.project(window.projection));
        }

        in_batch += 1;
        if in_batch == window.batch_size {
            in_batch = 0;
            if window.deadline.expired() && !reader.at_end()? {
                return Ok(page(rows, false, true, reader.position()));
            }
        }
    }
}

fn fetch_ordered(
    snapshot: &ReportSnapshot,
    reader: &mut RowReader,
    window: &Window<'_>,
    order: &[(usize, SortDirection)],
    start: Keyset,
) -> RiskResult<RowPage> {
    let directions: Arc<[SortDirection]> = order.iter().map(|(_, d)| *d).collect();
    let capacity = window.limit.saturating_add(1);
    let ranked = |cells: Vec<Option<String>>, seq: u64, row: Option<Row>| Ranked::new(cells, seq, Arc::clone(&directions), row);

    let after_mark = start.after.clone();
    let after = start.after.map(|mark| ranked(mark.keys, mark.seq, None));
    let mut heap: BinaryHeap<Ranked> = BinaryHeap::new();
    for mark in start.candidates {
        offer(&mut heap, ranked(mark.keys, mark.seq, None), capacity);
    }

    let skipped = reader.skip_rows(start.position)?;
    let mut in_batch = 0usize;

    loop {
        let seq = reader.position();
        let Some(row) = reader.next_row()? else {
            break;
        };

        if window.filter.matches(&row) {
            let cells = order.iter().map(|(idx, _)| row.get(*idx).map(str::to_string)).collect();
            let candidate = ranked(cells, seq, Some(row));
            if after.as_ref().map_or(true, |after| candidate > *after) {
                offer(&mut heap, candidate, capacity);
            }
        }

        in_batch += 1;
        if in_batch == window.batch_size {
            in_batch = 0;
            if window.deadline.expired() && !reader.at_end()? {
                return Ok(RowPage {
                    rows: Vec::new(),
                    has_more: false,
                    deadline_hit: true,
                    next: Keyset {
                        after: after_mark,
                        candidates: heap.iter().map(Ranked::mark).collect(),
                        position: reader.position(),
                    },
                    rows_scanned: reader.position() - skipped,
                });
            }
        }
    }

    let rows_scanned = reader.position() - skipped;
    let mut best = heap.into_sorted_vec();
    let has_more = best.len() > window.limit;
    best.truncate(window.limit);
    reread_carried(snapshot, &mut best)?;

    let next = Keyset {
        after: best.last().map(Ranked::mark),
        ..Keyset::default()
    };
    let rows = best
        .into_iter()
        .map(|entry| {
            entry
                .row
                .map(|row| row.project(window.projection))
                .ok_or_else(|| RiskError::internal(format!("row {} vanished from the report", entry.seq)))
        })
        .collect::<RiskResult<Vec<_>>>()?;

    Ok(RowPage {
        rows,
        has_more,
        deadline_hit: false,
        next,
        rows_scanned,
    })
}

/// Keeps the `capacity` smallest entries; the worst one sits on top.
fn offer(heap: &mut BinaryHeap<Ranked>, candidate: Ranked, capacity: usize) {
    if heap.len() < capacity {
        heap.push(candidate);
    } else if heap.peek().is_some_and(|worst| candidate < *worst) {
        heap.pop();
        heap.push(candidate);
    }
}

/// Loads rows of candidates carried over from an earlier, interrupted call.
///
/// Only their sort marks travel in the cursor, so they are read again by raw
/// position in one forward pass.
fn reread_carried(snapshot: &ReportSnapshot, entries: &mut [Ranked]) -> RiskResult<()> {
    let mut wanted: Vec<u64> = entries.iter().filter(|e| e.row.is_none()).map(|e| e.seq).collect();
    if wanted.is_empty() {
        return Ok(());
    }
    wanted.sort_unstable();

    let mut reader = RowReader::open(snapshot)?;
    let mut found = HashMap::with_capacity(wanted.len());
    for seq in wanted {
        reader.skip_rows(seq - reader.position())?;
        if let Some(row) = reader.next_row()? {
            found.insert(seq, row);
        }
    }
    for entry in entries.iter_mut().filter(|e| e.row.is_none()) {
        entry.row = found.remove(&entry.seq);
    }
    Ok(())
}

/// Sort key of one cell.
///
/// Mixed columns order numbers before dates before text.
#[derive(Debug, Clone, PartialEq)]
enum SortValue {
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl SortValue {
    fn parse(cell: &str) -> Self {
        if let Some(n) = cell.trim().parse::<f64>().ok().filter(|n| n.is_finite()) {
            Self::Number(n)
        } else if let Some(d) = parse_date(cell) {
            Self::Date(d)
        } else {
            Self::Text(cell.to_string())
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Number(_) => 0,
            Self::Date(_) => 1,
            Self::Text(_) => 2,
        }
    }

    fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Ascending puts nulls last; descending is the exact reverse.
fn compare_keys(a: &Option<SortValue>, b: &Option<SortValue>, direction: SortDirection) -> Ordering {
    let ordering = match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.total_cmp(b),
    };
    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

/// Heap entry; smaller ranks first, raw row position breaks ties.
///
/// `row` is `None` for a candidate restored from a cursor.
struct Ranked {
    cells: Vec<Option<String>>,
    keys: Vec<Option<SortValue>>,
    seq: u64,
    directions: Arc<[SortDirection]>,
    row: Option<Row>,
}

impl Ranked {
    fn new(cells: Vec<Option<String>>, seq: u64, directions: Arc<[SortDirection]>, row: Option<Row>) -> Self {
        Self {
            keys: cells.iter().map(|c| c.as_deref().map(SortValue::parse)).collect(),
            cells,
            seq,
            directions,
            row,
        }
    }

    fn mark(&self) -> SortMark {
        SortMark {
            keys: self.cells.clone(),
            seq: self.seq,
        }
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.keys
            .iter()
            .zip(&other.keys)
            .zip(self.directions.iter())
            .map(|((a, b), direction)| compare_keys(a, b, *direction))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

#[cfg(test)]
mod tests {
    use super::*;
    use riskq_core::{FilterOp, ReportFile, ReportType};
    use std::path::Path;
    use std::time::Duration;

    const HEADER: &str = "User ID\tUser Name\tRisk Level\tSystem\tLast Executed On\n";

    fn report(dir: &Path, name: &str, body: &str) -> Arc<ReportSnapshot> {
        let path = dir.join(name);
        std::fs::write(&path, format!("{HEADER}{body}")).unwrap();
        let file = ReportFile {
            report_type: ReportType::from("actions"),
            location: path,
            content_hash: "h".into(),
            last_modified: chrono::Utc::now(),
            stamped_at: None,
            size_bytes: 0,
            row_schema: RowSchema::from_header(&["User ID"]),
        };
        Arc::new(ReportSnapshot::single(Arc::new(file), "Action"))
    }

    fn user_ids(page: &RowPage) -> Vec<&str> {
        page.rows
            .iter()
            .map(|r| r["User ID"].as_str().unwrap_or("<null>"))
            .collect()
    }

    fn sample(dir: &Path) -> Arc<ReportSnapshot> {
        report(
            dir,
            "RS_Action_Lvl.txt",
            "U1\tAlice\tHigh\tPRD\t2024-03-01\n\
             U2\tBob\tLow\tQAS\t2024-01-15\n\
             U3\tCarol\tHigh\tPRD\t\n\
             U4\t\tMedium\tDEV\t2024-02-10\n\
             U5\tEve\tHigh\tQAS\t2023-12-31\n",
        )
    }

    #[test]
    fn test_unordered_pages_follow_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScanEngine::new(2);
        let snapshot = sample(dir.path());

        let first = engine
            .scan(Arc::clone(&snapshot))
            .filter(FilterPredicate::equals("Risk Level", "high"))
            .fetch_rows(0, 2, &Deadline::unbounded())
            .unwrap();
        assert_eq!(user_ids(&first), vec!["U1", "U3"]);
        assert!(first.has_more);
        // Resumes at the raw row of the next match
        assert_eq!(first.next, Keyset::at(4));

        let second = engine
            .scan(snapshot)
            .filter(FilterPredicate::equals("Risk Level", "high"))
            .resume_rows(first.next, 2, &Deadline::unbounded())
            .unwrap();
        assert_eq!(user_ids(&second), vec!["U5"]);
        assert!(!second.is_partial());
        assert_eq!(second.rows_scanned, 1);
    }

    #[test]
    fn test_offset_skips_raw_rows() {
        let dir = tempfile::tempdir().unwrap();
        let page = ScanEngine::new(2)
            .scan(sample(dir.path()))
            .fetch_rows(3, 10, &Deadline::unbounded())
            .unwrap();
        assert_eq!(user_ids(&page), vec!["U4", "U5"]);
        assert_eq!(page.rows_scanned, 2);
        assert_eq!(page.next, Keyset::at(5));

        let past_end = ScanEngine::new(2)
            .scan(sample(dir.path()))
            .fetch_rows(40, 10, &Deadline::unbounded())
            .unwrap();
        assert!(past_end.rows.is_empty());
        assert!(!past_end.is_partial());
    }

    #[test]
    fn test_default_projection_and_derived_columns() {
        let dir = tempfile::tempdir().unwrap();
        let page = ScanEngine::default()
            .scan(sample(dir.path()))
            .fetch_rows(0, 1, &Deadline::unbounded())
            .unwrap();

        let record = &page.rows[0];
        let keys: Vec<_> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, riskq_core::schema::DEFAULT_COLUMNS.to_vec());
        assert_eq!(record["ReportType"], Value::String("Action".into()));
        assert_eq!(record["IsCritical"], Value::Bool(false));
        assert_eq!(record["Role ID"], Value::Null);
    }

    #[test]
    fn test_ordering_with_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScanEngine::new(2);
        let snapshot = sample(dir.path());
        let by_date = |direction| OrderKey {
            column: "last executed on".into(),
            direction,
        };

        let asc = engine
            .scan(Arc::clone(&snapshot))
            .order_by([by_date(SortDirection::Asc)])
            .fetch_rows(0, 10, &Deadline::unbounded())
            .unwrap();
        assert_eq!(user_ids(&asc), vec!["U5", "U2", "U4", "U1", "U3"]);
        assert!(!asc.has_more);

        let desc = engine
            .scan(Arc::clone(&snapshot))
            .order_by([by_date(SortDirection::Desc)])
            .fetch_rows(0, 2, &Deadline::unbounded())
            .unwrap();
        assert_eq!(user_ids(&desc), vec!["U3", "U1"]);
        assert!(desc.has_more);
        let after = desc.next.after.clone().unwrap();
        assert_eq!(after.keys, vec![Some("2024-03-01".to_string())]);
        assert_eq!(after.seq, 0);

        let next = engine
            .scan(snapshot)
            .order_by([by_date(SortDirection::Desc)])
            .resume_rows(desc.next, 2, &Deadline::unbounded())
            .unwrap();
        assert_eq!(user_ids(&next), vec!["U4", "U2"]);
        assert!(next.has_more);
    }

    #[test]
    fn test_multi_key_order_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let page = ScanEngine::new(1)
            .scan(sample(dir.path()))
            .order_by([
                OrderKey {
                    column: "System".into(),
                    direction: SortDirection::Desc,
                },
                OrderKey {
                    column: "Risk Level".into(),
                    direction: SortDirection::Asc,
                },
            ])
            .fetch_rows(0, 5, &Deadline::unbounded())
            .unwrap();
        assert_eq!(user_ids(&page), vec!["U5", "U2", "U1", "U3", "U4"]);
    }

    #[test]
    fn test_ordered_fetch_checkpoints_on_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..10).map(|i| format!("U{i}\tUser {}\tHigh\tPRD\t\n", 9 - i)).collect();
        let snapshot = report(dir.path(), "RS_Action_Lvl.txt", &body);
        let expired = Deadline::start(Duration::ZERO);
        let by_name = [OrderKey {
            column: "User Name".into(),
            direction: SortDirection::Asc,
        }];
        let scan = || ScanEngine::new(3).scan(Arc::clone(&snapshot)).order_by(by_name.clone());

        // Each interrupted call reads one batch and keeps its best rows
        let first = scan().fetch_rows(0, 2, &expired).unwrap();
        assert!(first.deadline_hit);
        assert!(first.rows.is_empty());
        assert_eq!(first.next.position, 3);
        assert_eq!(first.next.candidates.len(), 3);

        let mut next = first.next;
        let page = loop {
            let page = scan().resume_rows(next.clone(), 2, &expired).unwrap();
            if !page.deadline_hit {
                break page;
            }
            assert!(page.next.candidates.len() <= 3);
            next = page.next;
        };
        // Candidates from earlier calls are read back for the page
        assert_eq!(user_ids(&page), vec!["U9", "U8"]);
        assert!(page.has_more);
        assert_eq!(page.next.position, 0);
        assert!(page.next.candidates.is_empty());
    }

    #[test]
    fn test_deadline_allows_pages_without_matches() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..50)
            .map(|i| {
                let level = if i == 45 { "High" } else { "Low" };
                format!("U{i}\tUser\t{level}\tPRD\t\n")
            })
            .collect();
        let snapshot = report(dir.path(), "RS_Action_Lvl.txt", &body);
        let expired = Deadline::start(Duration::ZERO);
        let scan = || ScanEngine::new(4).scan(Arc::clone(&snapshot)).filter(FilterPredicate::equals("Risk Level", "High"));

        let page = scan().fetch_rows(10, 20, &expired).unwrap();
        assert!(page.deadline_hit);
        assert!(page.is_partial());
        assert!(page.rows.is_empty());
        assert_eq!(page.rows_scanned, 4);
        assert_eq!(page.next, Keyset::at(14));

        let aggregation = ScanEngine::new(4)
            .scan(snapshot)
            .aggregate("Risk Level", 0, &expired)
            .unwrap();
        assert!(!aggregation.exhausted);
        assert_eq!(aggregation.rows_scanned, 4);
        assert_eq!(aggregation.next_offset, 4);
    }

    #[test]
    fn test_deadline_on_last_batch_completes() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..8).map(|i| format!("U{i}\tUser\tHigh\tPRD\t\n")).collect();
        let snapshot = report(dir.path(), "RS_Action_Lvl.txt", &body);
        let expired = Deadline::start(Duration::ZERO);

        let page = ScanEngine::new(4).scan(Arc::clone(&snapshot)).fetch_rows(4, 10, &expired).unwrap();
        assert_eq!(page.rows.len(), 4);
        assert!(!page.is_partial());

        let aggregation = ScanEngine::new(4)
            .scan(snapshot)
            .aggregate("System", 4, &expired)
            .unwrap();
        assert!(aggregation.exhausted);
        assert_eq!(aggregation.next_offset, 8);
    }

    #[test]
    fn test_aggregate_counts_and_examples() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScanEngine::new(2);
        let snapshot = sample(dir.path());

        let aggregation = engine
            .scan(Arc::clone(&snapshot))
            .aggregate("risk level", 0, &Deadline::unbounded())
            .unwrap();
        assert!(aggregation.exhausted);
        assert_eq!(aggregation.rows_matched, 5);

        let high = &aggregation.groups[0];
        assert_eq!(high.group, Value::String("High".into()));
        assert_eq!(high.count, 3);
        assert_eq!(high.examples, vec!["Alice", "Carol", "Eve"]);
        assert_eq!(high.first_seen, 0);

        // Ties keep first-encounter order; a null example is skipped
        let rest: Vec<_> = aggregation.groups[1..]
            .iter()
            .map(|g| (g.group.clone(), g.count, g.examples.len(), g.first_seen))
            .collect();
        assert_eq!(
            rest,
            vec![
                (Value::String("Low".into()), 1, 1, 1),
                (Value::String("Medium".into()), 1, 0, 3),
            ]
        );

        let resumed = engine
            .scan(snapshot)
            .filter(FilterPredicate::new("System", FilterOp::Ne, "PRD"))
            .aggregate("System", 3, &Deadline::unbounded())
            .unwrap();
        assert_eq!(resumed.rows_scanned, 2);
        assert_eq!(resumed.rows_matched, 2);
        assert_eq!(resumed.next_offset, 5);
        // Positions stay absolute after a resume
        assert_eq!(resumed.groups[0].first_seen, 3);
    }

    #[test]
    fn test_batch_ties_rank_by_first_row() {
        let dir = tempfile::tempdir().unwrap();
        // The first batch alone favours B, the whole file is a tie won by A
        let snapshot = report(
            dir.path(),
            "RS_Action_Lvl.txt",
            "U1\tA\tHigh\tA\t\nU2\tB\tHigh\tB\t\nU3\tC\tHigh\tB\t\n\
             U4\tD\tHigh\tA\t\nU5\tE\tHigh\tA\t\nU6\tF\tHigh\tB\t\n",
        );
        let second = ScanEngine::new(3)
            .scan(Arc::clone(&snapshot))
            .aggregate("System", 3, &Deadline::unbounded())
            .unwrap();
        assert_eq!(second.groups[0].group, Value::String("A".into()));
        assert_eq!(second.groups[0].first_seen, 3);

        let full = ScanEngine::new(3)
            .facets(snapshot, "System", 1, &Deadline::unbounded())
            .unwrap();
        assert_eq!(full.groups.len(), 1);
        assert_eq!(full.groups[0].group, Value::String("A".into()));
    }

    #[test]
    fn test_facets_truncate_after_full_pass() {
        let dir = tempfile::tempdir().unwrap();
        let facets = ScanEngine::new(2)
            .facets(sample(dir.path()), "System", 2, &Deadline::unbounded())
            .unwrap();
        let values: Vec<_> = facets.groups.iter().map(|g| g.group.clone()).collect();
        assert_eq!(values, vec![Value::String("PRD".into()), Value::String("QAS".into())]);
    }

    #[test]
    fn test_unknown_columns_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = sample(dir.path());
        let engine = ScanEngine::default();

        let err = engine
            .scan(Arc::clone(&snapshot))
            .select(["Salary"])
            .fetch_rows(0, 1, &Deadline::unbounded())
            .unwrap_err();
        assert!(matches!(err, RiskError::InvalidQuery(_)));

        let err = engine
            .scan(snapshot)
            .aggregate("Salary", 0, &Deadline::unbounded())
            .unwrap_err();
        assert!(matches!(err, RiskError::InvalidQuery(_)));
    }
}
