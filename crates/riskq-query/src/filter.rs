//! Compiled filter predicates.
//!
//! Predicates are compiled once per scan: field names resolve to canonical
//! column positions and operands are lower-cased, so evaluating a row does no
//! allocation beyond the lower-cased cell.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use riskq_core::schema::{canonicalize_column, column_index};
use riskq_core::{FilterOp, FilterPredicate, RiskError, RiskResult};

use crate::reader::Row;

const DATE_FORMATS: [&str; 6] = ["%Y-%m-%d", "%Y%m%d", "%d.%m.%Y", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y"];
const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d.%m.%Y %H:%M:%S"];

/// Parses the date formats found in report exports. Time parts are dropped.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(value, f).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.date_naive()))
}

fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Orders two cells for range predicates: dates, then numbers, then text.
fn compare_cells(cell: &str, operand: &str) -> Ordering {
    if let (Some(a), Some(b)) = (parse_date(cell), parse_date(operand)) {
        return a.cmp(&b);
    }
    if let (Some(a), Some(b)) = (parse_number(cell), parse_number(operand)) {
        return a.total_cmp(&b);
    }
    cell.to_lowercase().cmp(&operand.to_lowercase())
}

#[derive(Debug, Clone)]
struct CompiledPredicate {
    columns: Vec<usize>,
    op: FilterOp,
    /// Lower-cased operands.
    values: Vec<String>,
}

impl CompiledPredicate {
    fn compile(predicate: &FilterPredicate) -> RiskResult<Self> {
        if predicate.fields.is_empty() {
            return Err(RiskError::invalid_query("filter names no field"));
        }

        let columns = predicate
            .fields
            .iter()
            .map(|field| {
                let name = canonicalize_column(field)?;
                column_index(name)
                    .ok_or_else(|| RiskError::internal(format!("column without position: {name}")))
            })
            .collect::<RiskResult<Vec<_>>>()?;

        let values: Vec<String> = predicate
            .value
            .values()
            .into_iter()
            .map(|v| v.trim().to_lowercase())
            .collect();

        match predicate.op {
            FilterOp::In if values.is_empty() => {
                return Err(RiskError::invalid_query("`in` filter needs at least one value"));
            }
            FilterOp::In => {}
            op if values.len() != 1 => {
                return Err(RiskError::invalid_query(format!(
                    "`{}` filter takes exactly one value",
                    op.as_str()
                )));
            }
            _ => {}
        }

        Ok(Self {
            columns,
            op: predicate.op,
            values,
        })
    }

    fn matches(&self, row: &Row) -> bool {
        self.columns
            .iter()
            .filter_map(|&idx| row.get(idx))
            .any(|cell| self.matches_cell(cell))
    }

    fn matches_cell(&self, cell: &str) -> bool {
        let operand = self.values[0].as_str();
        match self.op {
            FilterOp::Eq => cell.trim().to_lowercase() == operand,
            FilterOp::Ne => cell.trim().to_lowercase() != operand,
            FilterOp::Contains => cell.to_lowercase().contains(operand),
            FilterOp::In => {
                let cell = cell.trim().to_lowercase();
                self.values.iter().any(|v| *v == cell)
            }
            FilterOp::Gte => compare_cells(cell, operand) != Ordering::Less,
            FilterOp::Lte => compare_cells(cell, operand) != Ordering::Greater,
        }
    }
}

/// Conjunction of predicates over normalized rows.
#[derive(Debug, Clone, Default)]
pub struct CompiledFilter {
    predicates: Vec<CompiledPredicate>,
}

impl CompiledFilter {
    pub fn compile(predicates: &[FilterPredicate]) -> RiskResult<Self> {
        let predicates = predicates
            .iter()
            .map(CompiledPredicate::compile)
            .collect::<RiskResult<Vec<_>>>()?;
        Ok(Self { predicates })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Whether every predicate holds. Null cells never satisfy a predicate.
    pub fn matches(&self, row: &Row) -> bool {
        self.predicates.iter().all(|p| p.matches(row))
    }
}
