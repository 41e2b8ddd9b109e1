//! On-disk artifacts: monthly snapshots, the combined dataset, its gzip CSV
//! export and run metadata.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::hierarchy::HierarchyTable;
use crate::period::Period;
use crate::pivot::{sort_rows, PivotedRow, FIXED_COLUMNS};

const MONTHLY_DIR: &str = "monthly";
const COMBINED_JSON: &str = "combined.json";
const COMBINED_CSV_GZ: &str = "combined.csv.gz";
const COMBINED_META: &str = "combined.meta.json";
const OU_MAP_JSON_GZ: &str = "ou_map.json.gz";
const OU_MAP_META: &str = "ou_map.meta.json";

/// Metadata written next to the combined dataset, replaced on every run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    pub generated_at: String,
    pub periods_refreshed: Vec<String>,
    pub records: usize,
    pub content_hash: String,
}

#[derive(Debug, Serialize)]
struct OuMapMetadata {
    generated_at: String,
    count_ou_level5: usize,
}

#[derive(Debug, Serialize)]
struct OuMapEntry<'a> {
    #[serde(rename = "Org2")]
    org2: &'a str,
    #[serde(rename = "Org3")]
    org3: &'a str,
    #[serde(rename = "Org4")]
    org4: &'a str,
    #[serde(rename = "Org5")]
    org5: &'a str,
}

/// UTC timestamp with second precision, e.g. `2025-03-01T06:00:00Z`.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Replace the partitions of `periods` in `prior` with `fresh`.
///
/// Every prior row whose month falls in `periods` is dropped, whatever its
/// content; rows of other months are kept untouched. The result is sorted
/// canonically.
pub fn merge_refreshed(
    prior: Vec<PivotedRow>,
    periods: &[Period],
    fresh: Vec<PivotedRow>,
) -> Vec<PivotedRow> {
    let refreshed: HashSet<String> = periods.iter().map(Period::month_prefix).collect();
    let mut merged: Vec<PivotedRow> = prior
        .into_iter()
        .filter(|row| !refreshed.contains(row.month_prefix()))
        .collect();
    merged.extend(fresh);
    sort_rows(&mut merged);
    merged
}

/// Output directory of a run.
#[derive(Debug, Clone)]
pub struct DataStore {
    root: PathBuf,
}

impl DataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn combined_path(&self) -> PathBuf {
        self.root.join(COMBINED_JSON)
    }

    pub fn combined_csv_path(&self) -> PathBuf {
        self.root.join(COMBINED_CSV_GZ)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join(COMBINED_META)
    }

    pub fn monthly_path(&self, period: Period) -> PathBuf {
        self.root.join(MONTHLY_DIR).join(format!("{period}.json"))
    }

    /// Previously persisted dataset. A missing or unreadable file yields an
    /// empty history.
    pub fn load_combined(&self) -> Vec<PivotedRow> {
        let path = self.combined_path();
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "cannot read history, starting fresh");
                }
                return Vec::new();
            }
        };
        match serde_json::from_slice(&content) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt history, starting fresh");
                Vec::new()
            }
        }
    }

    /// Start a set of writes that land together on [`ArtifactBatch::commit`].
    pub fn batch(&self) -> ArtifactBatch<'_> {
        ArtifactBatch {
            store: self,
            staged: Vec::new(),
        }
    }

    /// Persist the leaf hierarchy as `ou_map.json.gz` plus its metadata.
    pub fn write_ou_map(&self, table: &HierarchyTable, at: DateTime<Utc>) -> Result<()> {
        let entries: BTreeMap<&str, OuMapEntry<'_>> = table
            .iter()
            .map(|(id, rec)| {
                let entry = OuMapEntry {
                    org2: rec.level2.as_deref().unwrap_or(""),
                    org3: rec.level3.as_deref().unwrap_or(""),
                    org4: rec.level4.as_deref().unwrap_or(""),
                    org5: rec.level5.as_deref().unwrap_or(""),
                };
                (id.as_str(), entry)
            })
            .collect();

        let path = self.root.join(OU_MAP_JSON_GZ);
        let json = to_json(&path, &entries)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).map_err(|e| PipelineError::io(&path, e))?;
        let gz = encoder.finish().map_err(|e| PipelineError::io(&path, e))?;

        let meta_path = self.root.join(OU_MAP_META);
        let meta = OuMapMetadata {
            generated_at: timestamp(at),
            count_ou_level5: table.len(),
        };
        let meta_bytes = to_json(&meta_path, &meta)?;

        let mut batch = self.batch();
        batch.stage(path.clone(), &gz)?;
        batch.stage(meta_path, &meta_bytes)?;
        batch.commit()?;
        info!(path = %path.display(), leaves = table.len(), "wrote hierarchy map");
        Ok(())
    }
}

/// Artifacts written to temporary files beside their destinations.
///
/// Nothing is visible until [`commit`](Self::commit) renames them into place;
/// dropping the batch discards the temporary files.
pub struct ArtifactBatch<'a> {
    store: &'a DataStore,
    staged: Vec<(PathBuf, NamedTempFile)>,
}

impl ArtifactBatch<'_> {
    pub fn monthly(&mut self, period: Period, rows: &[PivotedRow]) -> Result<()> {
        let path = self.store.monthly_path(period);
        let bytes = to_json(&path, rows)?;
        self.stage(path, &bytes)
    }

    /// Stage `combined.json` and return the digest of its bytes.
    pub fn combined(&mut self, rows: &[PivotedRow]) -> Result<String> {
        let path = self.store.combined_path();
        let bytes = to_json(&path, rows)?;
        self.stage(path, &bytes)?;
        Ok(content_hash(&bytes))
    }

    pub fn combined_csv(&mut self, rows: &[PivotedRow]) -> Result<()> {
        let path = self.store.combined_csv_path();
        let bytes = csv_gz(rows)?;
        self.stage(path, &bytes)
    }

    pub fn meta(&mut self, meta: &RunMetadata) -> Result<()> {
        let path = self.store.meta_path();
        let bytes = to_json(&path, meta)?;
        self.stage(path, &bytes)
    }

    fn stage(&mut self, path: PathBuf, bytes: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| PipelineError::io(dir, e))?;
        tmp.write_all(bytes).map_err(|e| PipelineError::io(&path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| PipelineError::io(&path, e))?;
        debug!(path = %path.display(), bytes = bytes.len(), "staged artifact");
        self.staged.push((path, tmp));
        Ok(())
    }

    /// Rename every staged file into place, in staging order.
    pub fn commit(self) -> Result<usize> {
        let count = self.staged.len();
        for (path, tmp) in self.staged {
            tmp.persist(&path).map_err(|e| PipelineError::io(&path, e.error))?;
        }
        Ok(count)
    }
}

fn to_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PipelineError::json(path, e))
}

/// `sha256:<hex>` digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Header of the CSV export: fixed columns, then every indicator label seen
/// in `rows`, alphabetically.
pub fn csv_header(rows: &[PivotedRow]) -> Vec<String> {
    let labels: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.values.iter().map(|(label, _)| label.as_str()))
        .filter(|label| !FIXED_COLUMNS.contains(label))
        .collect();
    FIXED_COLUMNS
        .iter()
        .copied()
        .chain(labels)
        .map(str::to_string)
        .collect()
}

/// Render a value the way `combined.json` does: `12.0`, `2.5`, `1e21`.
fn format_number(value: f64) -> String {
    serde_json::Number::from_f64(value)
        .map(|n| n.to_string())
        .unwrap_or_default()
}

fn csv_gz(rows: &[PivotedRow]) -> Result<Vec<u8>> {
    let header = csv_header(rows);
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut writer = csv::Writer::from_writer(encoder);
    writer.write_record(&header)?;

    for row in rows {
        let values: HashMap<&str, Option<f64>> = row
            .values
            .iter()
            .map(|(label, v)| (label.as_str(), *v))
            .collect();
        let name = |n: &Option<String>| n.clone().unwrap_or_default();
        let mut record = vec![
            name(&row.hierarchy.level2),
            name(&row.hierarchy.level3),
            name(&row.hierarchy.level4),
            name(&row.hierarchy.level5),
            row.period.clone(),
        ];
        record.extend(header[FIXED_COLUMNS.len()..].iter().map(|label| {
            values
                .get(label.as_str())
                .copied()
                .flatten()
                .map(format_number)
                .unwrap_or_default()
        }));
        writer.write_record(&record)?;
    }

    let encoder = writer
        .into_inner()
        .map_err(|e| PipelineError::Csv(csv::Error::from(e.into_error())))?;
    encoder
        .finish()
        .map_err(|e| PipelineError::Csv(csv::Error::from(e)))
}
