//! Run configuration: credentials from the environment and the indicator
//! catalog from its data file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::period::{Period, RunWindow};
use crate::pivot::FIXED_COLUMNS;

/// Where the API lives and who we are. All three values must be non-empty.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut missing = Vec::new();
        let mut read = |key: &'static str| match lookup(key).filter(|v| !v.trim().is_empty()) {
            Some(v) => v,
            None => {
                missing.push(key);
                String::new()
            }
        };

        let creds = Self {
            base_url: read("DHIS2_BASE_URL"),
            username: read("DHIS2_USERNAME"),
            password: read("DHIS2_PASSWORD"),
        };

        if missing.is_empty() {
            Ok(creds)
        } else {
            Err(PipelineError::Config(format!(
                "missing secrets: {}",
                missing.join(", ")
            )))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    version: String,
    #[serde(default)]
    indicators: Vec<String>,
    #[serde(default)]
    rename: HashMap<String, String>,
}

/// Expected indicator identifiers, in column order, and their display labels.
#[derive(Debug, Clone)]
pub struct IndicatorCatalog {
    pub version: String,
    indicators: Vec<String>,
    rename: HashMap<String, String>,
}

impl IndicatorCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read indicator file {}: {e}", path.display()))
        })?;
        let file: CatalogFile = serde_json::from_str(&content).map_err(|e| {
            PipelineError::Config(format!("cannot parse indicator file {}: {e}", path.display()))
        })?;
        Self::new(file.version, file.indicators, file.rename)
    }

    pub fn new(
        version: String,
        indicators: Vec<String>,
        rename: HashMap<String, String>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut expected = Vec::with_capacity(indicators.len());
        for raw in indicators {
            let id = raw.trim();
            if id.is_empty() {
                continue;
            }
            if !seen.insert(id.to_string()) {
                warn!(indicator = id, "duplicate indicator in catalog, keeping first");
                continue;
            }
            expected.push(id.to_string());
        }

        if expected.is_empty() {
            return Err(PipelineError::Config("indicator list is empty".into()));
        }

        let catalog = Self {
            version,
            indicators: expected,
            rename,
        };

        let mut labels: BTreeMap<&str, &str> = BTreeMap::new();
        for id in &catalog.indicators {
            let label = catalog.label(id);
            if FIXED_COLUMNS.contains(&label) {
                return Err(PipelineError::Config(format!(
                    "indicator {id} is labelled {label:?}, which is a reserved column"
                )));
            }
            if let Some(other) = labels.insert(label, id) {
                return Err(PipelineError::Config(format!(
                    "indicators {other} and {id} share the label {label:?}"
                )));
            }
        }

        Ok(catalog)
    }

    pub fn indicators(&self) -> &[String] {
        &self.indicators
    }

    /// Display label for `id`; unmapped identifiers keep their raw id.
    pub fn label<'a>(&'a self, id: &'a str) -> &'a str {
        self.rename.get(id).map(String::as_str).unwrap_or(id)
    }
}

/// Parameters of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub start: Period,
    pub window: RunWindow,
    pub out_dir: PathBuf,
    /// Budget for the `;`-joined indicator list of one request.
    pub chunk_chars: usize,
    /// Pause between consecutive chunk requests.
    pub request_delay: Duration,
}
