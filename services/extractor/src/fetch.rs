//! Chunked retrieval of long-format observations.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::client::{AnalyticsResponse, AnalyticsSource};
use crate::error::{PipelineError, Result};
use crate::period::Period;

/// Analytics scope selecting every leaf-level unit.
pub const LEAF_SCOPE: &str = "LEVEL-5";

/// Separator between identifiers in a request dimension.
const SEPARATOR_LEN: usize = 1;

/// One `(indicator, period, org unit, value)` row.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub indicator: String,
    pub period: Period,
    pub org_unit: String,
    pub value: Option<f64>,
}

/// Split `items` into contiguous runs whose `;`-joined length stays within
/// `max_chars`. An item longer than the budget gets a chunk of its own.
pub fn chunk_indicators(items: &[String], max_chars: usize) -> Vec<&[String]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut len = 0;

    for (i, item) in items.iter().enumerate() {
        let item_len = item.chars().count();
        if i > start && len + SEPARATOR_LEN + item_len > max_chars {
            chunks.push(&items[start..i]);
            start = i;
            len = item_len;
        } else if i > start {
            len += SEPARATOR_LEN + item_len;
        } else {
            len = item_len;
        }
    }
    if start < items.len() {
        chunks.push(&items[start..]);
    }
    chunks
}

/// Interpret a cell as a number. Unparseable or non-finite values are absent.
pub fn parse_value(cell: &Value) -> Option<f64> {
    let value = match cell {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

/// Turn an analytics payload into observations, skipping malformed rows.
pub fn parse_observations(response: AnalyticsResponse) -> Vec<Observation> {
    let rows = response.rows.unwrap_or_default();
    let mut observations = Vec::with_capacity(rows.len());

    for row in rows {
        let (Some(dx), Some(pe), Some(ou), Some(cell)) = (
            row.first().and_then(Value::as_str),
            row.get(1).and_then(Value::as_str),
            row.get(2).and_then(Value::as_str),
            row.get(3),
        ) else {
            debug!(?row, "skipping malformed analytics row");
            continue;
        };
        let Ok(period) = pe.parse::<Period>() else {
            debug!(period = pe, "skipping analytics row with invalid period");
            continue;
        };

        observations.push(Observation {
            indicator: dx.to_string(),
            period,
            org_unit: ou.to_string(),
            value: parse_value(cell),
        });
    }
    observations
}

/// Retrieve all observations for `period`, one request per indicator chunk.
///
/// Requests run one after another with `delay` between them. The first failing
/// chunk aborts the period.
pub async fn fetch_period_observations<S>(
    source: &S,
    period: Period,
    indicators: &[String],
    max_chars: usize,
    delay: Duration,
) -> Result<Vec<Observation>>
where
    S: AnalyticsSource + ?Sized,
{
    let chunks = chunk_indicators(indicators, max_chars);
    let total = chunks.len();
    let mut observations = Vec::new();

    for (i, chunk) in chunks.into_iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = source
            .analytics(chunk, period, LEAF_SCOPE)
            .await
            .map_err(|source| PipelineError::Fetch {
                context: format!("period {period}, chunk {}/{total}", i + 1),
                source,
            })?;
        let parsed = parse_observations(response);
        debug!(%period, chunk = i + 1, total, indicators = chunk.len(), rows = parsed.len(), "fetched chunk");
        observations.extend(parsed);
    }

    info!(%period, chunks = total, observations = observations.len(), "fetched period");
    Ok(observations)
}
