use clap::Parser;
use riskq_core::{ReportType, RiskError, RiskResult, RiskqConfig};
use riskq_query::QueryExecutor;
use riskq_storage::{RefreshOutcome, ReportLocator};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod args;

use args::Command;

#[derive(Parser, Debug)]
#[command(name = "riskq")]
#[command(about = "Query the latest risk-report exports", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to RISKQ_CONFIG, ./config/riskq, /etc/riskq/riskq)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Local report folder, overriding the configured source
    #[arg(long, env = "RISKQ_REPORTS", global = true)]
    reports: Option<String>,

    /// Scan budget per request in milliseconds
    #[arg(long, global = true)]
    deadline_ms: Option<u64>,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();

    match run(&cli).await {
        Ok(output) => {
            print_json(&output, cli.pretty);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, kind = e.kind().as_str(), "Request failed");
            print_json(
                &json!({ "error": e.kind().as_str(), "message": e.to_string() }),
                cli.pretty,
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> RiskResult<Value> {
    let mut config = match &cli.config {
        Some(path) => RiskqConfig::from_file(path),
        None => RiskqConfig::load(),
    }
    .map_err(|e| RiskError::internal(format!("failed to load configuration: {e}")))?;

    if let Some(reports) = &cli.reports {
        config.source.raw_local_path = Some(reports.clone());
    }

    let locator = Arc::new(ReportLocator::from_config(&config)?);
    let mut executor = QueryExecutor::new(Arc::clone(&locator), config.query.clone());
    if let Some(ms) = cli.deadline_ms {
        executor = executor.with_deadline(Duration::from_millis(ms));
    }

    match &cli.command {
        Command::Query(args) => {
            let spec = args.spec(&config.query)?;
            prefetch(&locator, &spec.report_type).await;
            to_json(&executor.execute(&spec, args.cursor.as_deref()).await?)
        }
        Command::Summary(args) => {
            let spec = args.spec(&config.query)?;
            prefetch(&locator, &spec.report_type).await;
            to_json(&executor.summarize(&spec, args.cursor.as_deref()).await?)
        }
        Command::Schema { report_type } => {
            let report_type = ReportType::from(report_type.as_str());
            prefetch(&locator, &report_type).await;
            to_json(&executor.schema(&report_type).await?)
        }
        Command::Facets(args) => {
            let report_type = ReportType::from(args.report_type.as_str());
            prefetch(&locator, &report_type).await;
            let top = args.top.unwrap_or(config.query.default_top);
            let facets = executor
                .facets(&report_type, &args.column, top, args.cursor.as_deref())
                .await?;
            to_json(&facets)
        }
        Command::Refresh { report_type } => refresh(&locator, report_type.as_deref()).await,
    }
}

/// One-shot fetch so a remote-backed request has a copy to read.
///
/// A family refreshes each of its members.
async fn prefetch(locator: &ReportLocator, report_type: &ReportType) {
    let Some(cache) = locator.remote_cache() else {
        return;
    };
    let members = match locator.catalog().family(report_type) {
        Some(members) => members.to_vec(),
        None => vec![report_type.clone()],
    };
    for member in &members {
        if let Err(e) = cache.refresh(member).await {
            warn!(report_type = %member, error = %e, "Refresh before query failed");
        }
    }
}

async fn refresh(locator: &ReportLocator, only: Option<&str>) -> RiskResult<Value> {
    let Some(cache) = locator.remote_cache() else {
        return Err(RiskError::invalid_query(
            "refresh needs a remote source; the configured source is a local folder",
        ));
    };

    let report_types = match only {
        Some(name) => vec![ReportType::from(name)],
        None => cache.report_types().to_vec(),
    };

    let mut results = serde_json::Map::new();
    for report_type in report_types {
        let outcome = match cache.refresh(&report_type).await {
            Ok(RefreshOutcome::Downloaded(entry)) => {
                info!(report_type = %report_type, key = %entry.remote_key, "Downloaded report");
                json!({ "status": "downloaded", "entry": entry })
            }
            Ok(RefreshOutcome::Unchanged) => json!({ "status": "unchanged" }),
            Ok(RefreshOutcome::AlreadyInFlight) => json!({ "status": "in_flight" }),
            Err(e) => json!({ "status": "failed", "error": e.kind().as_str(), "message": e.to_string() }),
        };
        results.insert(report_type.to_string(), outcome);
    }
    Ok(Value::Object(results))
}

fn to_json<T: serde::Serialize>(value: &T) -> RiskResult<Value> {
    Ok(serde_json::to_value(value)?)
}

fn print_json(value: &Value, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to render output: {e}"),
    }
}

/// Logs go to stderr so stdout carries only JSON.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
