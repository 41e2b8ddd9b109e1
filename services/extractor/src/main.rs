//! Extractor - Pulls monthly indicator values and pivots them per facility
//!
//! Responsibilities:
//! - Resolve the organisation unit hierarchy (levels 2 to 5)
//! - Fetch analytics for every indicator, in size-bounded chunks
//! - Pivot long rows into one row per facility and month
//! - Replace the refreshed months in the combined history
//! - Write monthly snapshots, combined JSON/CSV and run metadata
//!
//! Usage:
//!   # Scheduled run (last 3 months, current month included):
//!   cargo run --bin extractor -- --months 3
//!
//!   # Rebuild everything since a given month:
//!   cargo run --bin extractor -- --backfill --start 202401
//!
//! Credentials come from DHIS2_BASE_URL, DHIS2_USERNAME and DHIS2_PASSWORD
//! (a local .env file is honoured).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use extractor::{
    init_tracing, run_extraction, Credentials, Dhis2Client, IndicatorCatalog, Period,
    PipelineError, RunOptions, RunSummary, RunWindow,
};

#[derive(Parser, Debug)]
#[command(name = "extractor", about = "Refreshes the monthly facility indicator dataset")]
struct Args {
    /// First month of the series (YYYYMM)
    #[arg(long, default_value = "202501")]
    start: Period,

    /// Refresh the last N months, current month included
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    months: u32,

    /// Fetch every month from --start to the current month and ignore history
    #[arg(long, default_value = "false")]
    backfill: bool,

    /// Output folder
    #[arg(long, default_value = "docs/data")]
    out: PathBuf,

    /// Maximum length of the joined indicator list per request
    #[arg(long, default_value_t = 6500)]
    dx_chunk_chars: usize,

    /// Pause between chunk requests, in seconds
    #[arg(long, default_value_t = 0.2)]
    sleep: f64,

    /// Indicator list and rename table
    #[arg(long, default_value = "config/indicators.json")]
    indicators: PathBuf,

    /// Timeout for a single analytics request, in seconds
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

async fn run(args: Args) -> Result<RunSummary> {
    let credentials = Credentials::from_env()?;
    let catalog = IndicatorCatalog::load(&args.indicators)?;
    let request_delay = Duration::try_from_secs_f64(args.sleep)
        .map_err(|e| PipelineError::Config(format!("invalid --sleep {}: {e}", args.sleep)))?;

    let window = if args.backfill {
        RunWindow::Backfill
    } else {
        RunWindow::Rolling(args.months)
    };
    let options = RunOptions {
        start: args.start,
        window,
        out_dir: args.out,
        chunk_chars: args.dx_chunk_chars,
        request_delay,
    };

    let client = Dhis2Client::new(&credentials, Duration::from_secs(args.timeout_secs))
        .context("Failed to build HTTP client")?;

    let summary = run_extraction(&client, &catalog, &options, Utc::now()).await?;
    Ok(summary)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(summary) => {
            println!(
                "OK: {} records; refreshed {:?}",
                summary.records,
                summary.period_labels()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            let code = err
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
