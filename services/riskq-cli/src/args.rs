//! Command-line argument types and their translation into query specs.

use chrono::NaiveDate;
use clap::{Args, Subcommand};
use riskq_core::{
    FilterOp, FilterPredicate, OrderKey, QueryConfig, QuerySpec, RiskError, RiskFilters,
    RiskResult, SortDirection,
};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch one page of matching rows
    Query(QueryArgs),
    /// Count matching rows per group and return the top groups
    Summary(SummaryArgs),
    /// Show the column layout of the current report file(s)
    Schema {
        /// Report type (actions, crit_actions, perms, crit_perms, all_actions, all_perms, ...)
        report_type: String,
    },
    /// Most frequent values of one column
    Facets(FacetArgs),
    /// Fetch the newest remote copy of a report type now
    Refresh {
        /// Report type; all configured types when omitted
        report_type: Option<String>,
    },
}

/// Named risk filters plus free-form `--filter` expressions.
#[derive(Args, Debug, Default)]
pub struct FilterArgs {
    /// Filter expression: `Field=value`, `Field!=value`, `Field~=value`
    /// (contains), `Field>=value`, `Field<=value`; `Field=a|b` matches any
    /// of the listed values
    #[arg(long = "filter", value_name = "EXPR")]
    pub filters: Vec<String>,

    /// Substring of the user id or user name
    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub role: Option<String>,

    #[arg(long)]
    pub risk_level: Option<String>,

    #[arg(long)]
    pub system: Option<String>,

    #[arg(long)]
    pub action: Option<String>,

    /// Earliest `Last Executed On` date (YYYY-MM-DD)
    #[arg(long)]
    pub date_from: Option<NaiveDate>,

    /// Latest `Last Executed On` date (YYYY-MM-DD)
    #[arg(long)]
    pub date_to: Option<NaiveDate>,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    pub report_type: String,

    #[command(flatten)]
    pub filters: FilterArgs,

    /// Comma-separated output columns
    #[arg(long, value_delimiter = ',')]
    pub columns: Vec<String>,

    /// Ordering key `Column[:asc|:desc]`, repeatable
    #[arg(long = "order", value_name = "KEY")]
    pub order: Vec<String>,

    /// Page size
    #[arg(long)]
    pub limit: Option<usize>,

    /// Cursor returned by the previous page
    #[arg(long)]
    pub cursor: Option<String>,
}

#[derive(Args, Debug)]
pub struct SummaryArgs {
    pub report_type: String,

    #[command(flatten)]
    pub filters: FilterArgs,

    /// Column to group by
    #[arg(long, default_value = "Risk Level")]
    pub group_by: String,

    /// Number of groups to return
    #[arg(long)]
    pub top: Option<usize>,

    #[arg(long)]
    pub cursor: Option<String>,
}

#[derive(Args, Debug)]
pub struct FacetArgs {
    pub report_type: String,

    #[arg(long)]
    pub column: String,

    #[arg(long)]
    pub top: Option<usize>,

    #[arg(long)]
    pub cursor: Option<String>,
}

impl FilterArgs {
    pub fn predicates(&self) -> RiskResult<Vec<FilterPredicate>> {
        let named = RiskFilters {
            user: self.user.clone(),
            role: self.role.clone(),
            risk_level: self.risk_level.clone(),
            system: self.system.clone(),
            action: self.action.clone(),
            date_from: self.date_from,
            date_to: self.date_to,
        };
        let mut predicates = named.into_predicates();
        for expr in &self.filters {
            predicates.push(parse_filter(expr)?);
        }
        Ok(predicates)
    }
}

impl QueryArgs {
    pub fn spec(&self, defaults: &QueryConfig) -> RiskResult<QuerySpec> {
        let mut spec = QuerySpec::new(self.report_type.as_str())
            .filters(self.filters.predicates()?)
            .columns(self.columns.iter().map(|c| c.trim()).filter(|c| !c.is_empty()))
            .limit(self.limit.unwrap_or(defaults.default_limit));
        for key in &self.order {
            let key = parse_order(key)?;
            spec = spec.order_by(key.column, key.direction);
        }
        Ok(spec)
    }
}

impl SummaryArgs {
    pub fn spec(&self, defaults: &QueryConfig) -> RiskResult<QuerySpec> {
        Ok(QuerySpec::new(self.report_type.as_str())
            .filters(self.filters.predicates()?)
            .group_by(self.group_by.as_str())
            .top(self.top.unwrap_or(defaults.default_top)))
    }
}

/// Parses one `--filter` expression.
pub fn parse_filter(expr: &str) -> RiskResult<FilterPredicate> {
    let invalid = || RiskError::invalid_query(format!("invalid filter expression: {expr}"));

    let eq = expr.find('=').ok_or_else(invalid)?;
    let (field_end, op) = match expr[..eq].chars().last() {
        Some('!') => (eq - 1, FilterOp::Ne),
        Some('~') => (eq - 1, FilterOp::Contains),
        Some('>') => (eq - 1, FilterOp::Gte),
        Some('<') => (eq - 1, FilterOp::Lte),
        _ => (eq, FilterOp::Eq),
    };

    let field = expr[..field_end].trim();
    let value = expr[eq + 1..].trim();
    if field.is_empty() {
        return Err(invalid());
    }

    if op == FilterOp::Eq && value.contains('|') {
        let values = value.split('|').map(str::trim).filter(|v| !v.is_empty());
        return Ok(FilterPredicate::one_of(field, values));
    }
    Ok(FilterPredicate::new(field, op, value))
}

/// Parses `Column`, `Column:asc` or `Column:desc`.
pub fn parse_order(key: &str) -> RiskResult<OrderKey> {
    let (column, direction) = match key.rsplit_once(':') {
        Some((column, dir)) if dir.eq_ignore_ascii_case("asc") => (column, SortDirection::Asc),
        Some((column, dir)) if dir.eq_ignore_ascii_case("desc") => (column, SortDirection::Desc),
        _ => (key, SortDirection::Asc),
    };
    let column = column.trim();
    if column.is_empty() {
        return Err(RiskError::invalid_query(format!("invalid order key: {key}")));
    }
    Ok(OrderKey {
        column: column.to_string(),
        direction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskq_core::FilterValue;

    #[test]
    fn test_parse_filter_operators() {
        let cases = [
            ("Risk Level=High", FilterOp::Eq, "High"),
            ("System != PRD", FilterOp::Ne, "PRD"),
            ("User Name~=ali", FilterOp::Contains, "ali"),
            ("Last Executed On>=2024-01-01", FilterOp::Gte, "2024-01-01"),
            ("Last Executed On<=01.02.2024", FilterOp::Lte, "01.02.2024"),
            ("Action=", FilterOp::Eq, ""),
        ];
        for (expr, op, value) in cases {
            let predicate = parse_filter(expr).unwrap();
            assert_eq!(predicate.op, op, "{expr}");
            assert_eq!(predicate.value, FilterValue::One(value.to_string()), "{expr}");
        }
        assert_eq!(parse_filter("System != PRD").unwrap().fields, vec!["System"]);
    }

    #[test]
    fn test_parse_filter_lists_and_errors() {
        let predicate = parse_filter("Risk Level=High|Critical").unwrap();
        assert_eq!(predicate.op, FilterOp::In);
        assert_eq!(predicate.value.values(), vec!["High", "Critical"]);

        assert!(parse_filter("Risk Level").is_err());
        assert!(parse_filter("=High").is_err());
        assert!(parse_filter("!=High").is_err());
    }

    #[test]
    fn test_parse_order() {
        assert_eq!(parse_order("User ID").unwrap().direction, SortDirection::Asc);
        let key = parse_order("Last Executed On:DESC").unwrap();
        assert_eq!(key.column, "Last Executed On");
        assert_eq!(key.direction, SortDirection::Desc);
        assert!(parse_order(":desc").is_err());
    }

    #[test]
    fn test_query_spec_from_args() {
        let args = QueryArgs {
            report_type: "actions".into(),
            filters: FilterArgs {
                filters: vec!["System=PRD".into()],
                risk_level: Some("High".into()),
                ..FilterArgs::default()
            },
            columns: vec!["User ID".into(), " ".into()],
            order: vec!["User ID:desc".into()],
            limit: None,
            cursor: None,
        };
        let spec = args.spec(&QueryConfig::default()).unwrap();
        assert_eq!(spec.limit, QueryConfig::default().default_limit);
        assert_eq!(spec.filters.len(), 2);
        assert_eq!(spec.columns, vec!["User ID"]);
        assert_eq!(spec.order_by[0].direction, SortDirection::Desc);
    }
}
