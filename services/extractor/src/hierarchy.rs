//! Resolution of leaf organisation units to the names of their ancestors.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::client::AnalyticsSource;
use crate::error::{PipelineError, Result};

/// Shallowest level resolved as an ancestor.
pub const TOP_LEVEL: u32 = 2;
/// Deepest level handled; analytics rows are reported at this level.
pub const LEAF_LEVEL: u32 = 5;

/// An organisation unit as listed by the metadata API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrgUnit {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub level: Option<u32>,
    /// Materialised ancestor path, `/root/.../self`.
    #[serde(default)]
    pub path: Option<String>,
}

/// Ancestor names of one leaf unit. Missing ancestors stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyRecord {
    pub level2: Option<String>,
    pub level3: Option<String>,
    pub level4: Option<String>,
    pub level5: Option<String>,
}

impl HierarchyRecord {
    /// Names in level order, absent names as empty strings.
    pub fn sort_key(&self) -> [&str; 4] {
        [
            self.level2.as_deref().unwrap_or(""),
            self.level3.as_deref().unwrap_or(""),
            self.level4.as_deref().unwrap_or(""),
            self.level5.as_deref().unwrap_or(""),
        ]
    }
}

/// Leaf unit id -> ancestor names.
pub type HierarchyTable = BTreeMap<String, HierarchyRecord>;

/// Build a record for every leaf unit found in `units`.
///
/// Units with the same id replace earlier ones. A leaf whose path is missing
/// or partial simply gets `None` for the levels that cannot be resolved.
pub fn resolve_hierarchy(units: impl IntoIterator<Item = OrgUnit>) -> HierarchyTable {
    let table: HashMap<String, OrgUnit> = units.into_iter().map(|u| (u.id.clone(), u)).collect();

    table
        .values()
        .filter(|unit| unit.level == Some(LEAF_LEVEL))
        .map(|leaf| {
            let path: Vec<&str> = leaf
                .path
                .as_deref()
                .unwrap_or("")
                .split('/')
                .filter(|part| !part.is_empty())
                .collect();

            let name_at = |level: u32| {
                path.iter()
                    .filter_map(|id| table.get(*id))
                    .find(|unit| unit.level == Some(level))
                    .and_then(|unit| unit.name.clone())
            };

            let record = HierarchyRecord {
                level2: name_at(2),
                level3: name_at(3),
                level4: name_at(4),
                level5: leaf.name.clone(),
            };
            (leaf.id.clone(), record)
        })
        .collect()
}

/// Fetch every unit from level 2 to the leaf level and resolve the leaves.
pub async fn load_hierarchy<S>(source: &S) -> Result<HierarchyTable>
where
    S: AnalyticsSource + ?Sized,
{
    let mut units = Vec::new();
    for level in TOP_LEVEL..=LEAF_LEVEL {
        let batch = source
            .org_units_at_level(level)
            .await
            .map_err(|source| PipelineError::Fetch {
                context: format!("organisation units at level {level}"),
                source,
            })?;
        info!(level, count = batch.len(), "loaded organisation units");
        units.extend(batch);
    }

    let table = resolve_hierarchy(units);
    info!(leaves = table.len(), "resolved hierarchy");
    Ok(table)
}
