//! Writes the leaf organisation unit hierarchy as `ou_map.json.gz`.
//!
//! Usage:
//!   cargo run --bin build_ou_map -- --out docs/data

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use extractor::hierarchy::load_hierarchy;
use extractor::store::DataStore;
use extractor::{init_tracing, Credentials, Dhis2Client, PipelineError};

#[derive(Parser, Debug)]
#[command(name = "build_ou_map", about = "Exports leaf org units with their ancestor names")]
struct Args {
    /// Output folder
    #[arg(long, default_value = "docs/data")]
    out: PathBuf,

    /// Timeout for a single listing request, in seconds
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,
}

async fn run(args: Args) -> Result<usize> {
    let credentials = Credentials::from_env()?;
    let client = Dhis2Client::new(&credentials, Duration::from_secs(args.timeout_secs))
        .context("Failed to build HTTP client")?;

    let table = load_hierarchy(&client).await?;
    DataStore::new(&args.out).write_ou_map(&table, Utc::now())?;
    Ok(table.len())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(count) => {
            println!("OK: ou_map.json.gz generated for {count} OU level 5");
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
