//! One extraction run: plan periods, resolve the hierarchy, fetch and pivot
//! each period, merge into history and persist.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::client::AnalyticsSource;
use crate::config::{IndicatorCatalog, RunOptions};
use crate::error::{PipelineError, Result};
use crate::fetch::fetch_period_observations;
use crate::hierarchy::load_hierarchy;
use crate::period::{plan_periods, Period};
use crate::pivot::{pivot_observations, PivotedRow};
use crate::store::{merge_refreshed, timestamp, DataStore, RunMetadata};

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub periods: Vec<Period>,
    /// Rows produced for the refreshed periods.
    pub rows_refreshed: usize,
    /// Rows in the combined dataset after the merge.
    pub records: usize,
    pub content_hash: String,
}

impl RunSummary {
    pub fn period_labels(&self) -> Vec<String> {
        self.periods.iter().map(Period::to_string).collect()
    }
}

/// Run the pipeline against `source` as of `now`.
///
/// Periods are processed one at a time, in order. Nothing is written until
/// every period has been fetched, and every artifact is rendered and staged
/// before any of them replaces its predecessor, so a failed fetch or a failed
/// write leaves the output directory as it was.
pub async fn run_extraction<S>(
    source: &S,
    catalog: &IndicatorCatalog,
    options: &RunOptions,
    now: DateTime<Utc>,
) -> Result<RunSummary>
where
    S: AnalyticsSource + ?Sized,
{
    let current = Period::from_date(now.date_naive());
    if options.start > current {
        return Err(PipelineError::Config(format!(
            "start period {} is after the current month {current}",
            options.start
        )));
    }
    let periods = plan_periods(options.start, current, options.window);
    info!(
        periods = ?periods.iter().map(Period::to_string).collect::<Vec<_>>(),
        backfill = options.window.is_backfill(),
        indicators = catalog.indicators().len(),
        catalog_version = %catalog.version,
        "planned run"
    );

    let hierarchy = load_hierarchy(source).await?;

    let mut refreshed: Vec<(Period, Vec<PivotedRow>)> = Vec::with_capacity(periods.len());
    for &period in &periods {
        let observations = fetch_period_observations(
            source,
            period,
            catalog.indicators(),
            options.chunk_chars,
            options.request_delay,
        )
        .await?;
        let rows = pivot_observations(observations, catalog, &hierarchy);
        info!(%period, rows = rows.len(), "pivoted period");
        refreshed.push((period, rows));
    }

    let store = DataStore::new(&options.out_dir);
    let prior = if options.window.is_backfill() {
        Vec::new()
    } else {
        store.load_combined()
    };
    let prior_len = prior.len();

    let mut batch = store.batch();
    for (period, rows) in &refreshed {
        batch.monthly(*period, rows)?;
    }

    let rows_refreshed: usize = refreshed.iter().map(|(_, rows)| rows.len()).sum();
    let fresh: Vec<PivotedRow> = refreshed.into_iter().flat_map(|(_, rows)| rows).collect();
    let combined = merge_refreshed(prior, &periods, fresh);

    let content_hash = batch.combined(&combined)?;
    batch.combined_csv(&combined)?;

    let summary = RunSummary {
        periods,
        rows_refreshed,
        records: combined.len(),
        content_hash,
    };
    batch.meta(&RunMetadata {
        generated_at: timestamp(now),
        periods_refreshed: summary.period_labels(),
        records: summary.records,
        content_hash: summary.content_hash.clone(),
    })?;
    batch.commit()?;

    info!(
        prior = prior_len,
        refreshed = summary.rows_refreshed,
        records = summary.records,
        out = %store.root().display(),
        "wrote combined dataset"
    );
    Ok(summary)
}
