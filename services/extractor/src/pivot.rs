//! Long-to-wide pivot of observations.
//!
//! Responsibilities:
//! - Group observations by (org unit, period)
//! - Sum duplicate (org unit, period, indicator) values
//! - Emit one column per expected indicator, renamed to its label
//! - Sort rows by hierarchy names then period
//!
//! Same observations + same catalog = same rows, in the same order.

use std::collections::HashMap;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::IndicatorCatalog;
use crate::fetch::Observation;
use crate::hierarchy::{HierarchyRecord, HierarchyTable};
use crate::period::Period;

pub const LEVEL2_COLUMN: &str = "Level 2 Org Unit";
pub const LEVEL3_COLUMN: &str = "Level 3 Org Unit";
pub const LEVEL4_COLUMN: &str = "Level 4 Org Unit";
pub const LEVEL5_COLUMN: &str = "Level 5 Org Unit";
pub const PERIOD_COLUMN: &str = "Period";

/// Columns that precede the indicator columns in every row.
pub const FIXED_COLUMNS: [&str; 5] = [
    LEVEL2_COLUMN,
    LEVEL3_COLUMN,
    LEVEL4_COLUMN,
    LEVEL5_COLUMN,
    PERIOD_COLUMN,
];

/// One (org unit, period) row in wide form.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotedRow {
    pub hierarchy: HierarchyRecord,
    /// First day of the month, `YYYY-MM-01`.
    pub period: String,
    /// `(label, value)` in column order.
    pub values: Vec<(String, Option<f64>)>,
}

impl PivotedRow {
    /// `YYYY-MM` partition the row belongs to.
    pub fn month_prefix(&self) -> &str {
        self.period.get(..7).unwrap_or(&self.period)
    }

    pub fn value(&self, label: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(l, _)| l == label)
            .and_then(|(_, v)| *v)
    }

    pub fn has_column(&self, label: &str) -> bool {
        self.values.iter().any(|(l, _)| l == label)
    }

    fn sort_key(&self) -> ([&str; 4], &str) {
        (self.hierarchy.sort_key(), self.period.as_str())
    }
}

impl Serialize for PivotedRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(FIXED_COLUMNS.len() + self.values.len()))?;
        map.serialize_entry(LEVEL2_COLUMN, &self.hierarchy.level2)?;
        map.serialize_entry(LEVEL3_COLUMN, &self.hierarchy.level3)?;
        map.serialize_entry(LEVEL4_COLUMN, &self.hierarchy.level4)?;
        map.serialize_entry(LEVEL5_COLUMN, &self.hierarchy.level5)?;
        map.serialize_entry(PERIOD_COLUMN, &self.period)?;
        for (label, value) in &self.values {
            map.serialize_entry(label, value)?;
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct StoredRow {
    #[serde(rename = "Level 2 Org Unit", default)]
    level2: Option<String>,
    #[serde(rename = "Level 3 Org Unit", default)]
    level3: Option<String>,
    #[serde(rename = "Level 4 Org Unit", default)]
    level4: Option<String>,
    #[serde(rename = "Level 5 Org Unit", default)]
    level5: Option<String>,
    #[serde(rename = "Period", default)]
    period: Option<String>,
    #[serde(flatten)]
    values: serde_json::Map<String, Value>,
}

impl<'de> Deserialize<'de> for PivotedRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stored = StoredRow::deserialize(deserializer)?;
        Ok(PivotedRow {
            hierarchy: HierarchyRecord {
                level2: stored.level2,
                level3: stored.level3,
                level4: stored.level4,
                level5: stored.level5,
            },
            period: stored.period.unwrap_or_default(),
            values: stored
                .values
                .into_iter()
                .map(|(label, v)| (label, v.as_f64()))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    org_unit: String,
    period: Period,
}

/// Per-period accumulator. Groups keep first-seen order.
#[derive(Debug, Default)]
struct Accumulator {
    index: HashMap<GroupKey, usize>,
    groups: Vec<(GroupKey, HashMap<String, Option<f64>>)>,
}

impl Accumulator {
    fn add(&mut self, obs: Observation) {
        let key = GroupKey {
            org_unit: obs.org_unit,
            period: obs.period,
        };
        let slot = match self.index.get(&key) {
            Some(&i) => i,
            None => {
                self.groups.push((key.clone(), HashMap::new()));
                self.index.insert(key, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        let cell = self.groups[slot].1.entry(obs.indicator).or_insert(None);
        *cell = sum_values(*cell, obs.value);
    }
}

/// Absent only contributes when nothing else is present.
fn sum_values(current: Option<f64>, incoming: Option<f64>) -> Option<f64> {
    match (current, incoming) {
        (Some(a), Some(b)) => Some(a + b),
        (Some(a), None) => Some(a),
        (None, v) => v,
    }
}

/// Pivot one batch of observations into sorted wide rows.
///
/// Observations for indicators outside the catalog are dropped; catalog
/// indicators with no observation appear with an absent value.
pub fn pivot_observations(
    observations: impl IntoIterator<Item = Observation>,
    catalog: &IndicatorCatalog,
    hierarchy: &HierarchyTable,
) -> Vec<PivotedRow> {
    let mut acc = Accumulator::default();
    for obs in observations {
        acc.add(obs);
    }

    let mut rows: Vec<PivotedRow> = acc
        .groups
        .into_iter()
        .map(|(key, mut cells)| PivotedRow {
            hierarchy: hierarchy.get(&key.org_unit).cloned().unwrap_or_default(),
            period: key.period.stamp(),
            values: catalog
                .indicators()
                .iter()
                .map(|id| (catalog.label(id).to_string(), cells.remove(id).flatten()))
                .collect(),
        })
        .collect();

    sort_rows(&mut rows);
    rows
}

/// Stable sort by level 2..5 names then period, absent names first.
pub fn sort_rows(rows: &mut [PivotedRow]) {
    rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(ids: &[&str], rename: &[(&str, &str)]) -> IndicatorCatalog {
        IndicatorCatalog::new(
            "test".into(),
            ids.iter().map(|s| s.to_string()).collect(),
            rename
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
        .unwrap()
    }

    fn obs(dx: &str, pe: &str, ou: &str, value: Option<f64>) -> Observation {
        Observation {
            indicator: dx.into(),
            period: pe.parse().unwrap(),
            org_unit: ou.into(),
            value,
        }
    }

    fn hierarchy() -> HierarchyTable {
        let mut table = HierarchyTable::new();
        table.insert(
            "F1".into(),
            HierarchyRecord {
                level2: Some("Kinshasa".into()),
                level3: Some("Gombe".into()),
                level4: Some("Aire 1".into()),
                level5: Some("CS Alpha".into()),
            },
        );
        table.insert(
            "F2".into(),
            HierarchyRecord {
                level2: Some("Equateur".into()),
                level3: Some("Mbandaka".into()),
                level4: Some("Aire 2".into()),
                level5: Some("CS Beta".into()),
            },
        );
        table
    }

    // -------------------------------------------------------------------------
    // DETERMINISM
    // -------------------------------------------------------------------------

    #[test]
    fn test_pivot_determinism() {
        let cat = catalog(&["a", "b"], &[("a", "Alpha")]);
        let input = vec![
            obs("a", "202501", "F1", Some(1.0)),
            obs("b", "202501", "F2", Some(2.0)),
            obs("a", "202501", "F2", Some(3.0)),
        ];
        let baseline = pivot_observations(input.clone(), &cat, &hierarchy());
        for _ in 0..10 {
            assert_eq!(pivot_observations(input.clone(), &cat, &hierarchy()), baseline);
        }
    }

    // -------------------------------------------------------------------------
    // AGGREGATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_duplicates_are_summed() {
        let cat = catalog(&["a"], &[]);
        let rows = pivot_observations(
            vec![
                obs("a", "202501", "F1", Some(2.0)),
                obs("a", "202501", "F1", Some(3.5)),
                obs("a", "202501", "F1", Some(4.0)),
            ],
            &cat,
            &hierarchy(),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("a"), Some(9.5));
    }

    #[test]
    fn test_absent_plus_present_is_present() {
        let cat = catalog(&["a", "b"], &[]);
        let rows = pivot_observations(
            vec![
                obs("a", "202501", "F1", None),
                obs("a", "202501", "F1", Some(5.0)),
                obs("b", "202501", "F1", Some(7.0)),
                obs("b", "202501", "F1", None),
            ],
            &cat,
            &hierarchy(),
        );
        assert_eq!(rows[0].value("a"), Some(5.0));
        assert_eq!(rows[0].value("b"), Some(7.0));
    }

    #[test]
    fn test_absent_only_stays_absent() {
        let cat = catalog(&["a"], &[]);
        let rows = pivot_observations(
            vec![obs("a", "202501", "F1", None), obs("a", "202501", "F1", None)],
            &cat,
            &hierarchy(),
        );
        assert!(rows[0].has_column("a"));
        assert_eq!(rows[0].value("a"), None);
    }

    #[test]
    fn test_sum_values_table() {
        assert_eq!(sum_values(None, None), None);
        assert_eq!(sum_values(None, Some(1.0)), Some(1.0));
        assert_eq!(sum_values(Some(1.0), None), Some(1.0));
        assert_eq!(sum_values(Some(1.0), Some(2.0)), Some(3.0));
    }

    // -------------------------------------------------------------------------
    // COLUMN SET
    // -------------------------------------------------------------------------

    #[test]
    fn test_every_row_has_every_expected_column() {
        let cat = catalog(&["a", "b", "c"], &[("b", "Beta")]);
        let rows = pivot_observations(
            vec![
                obs("a", "202501", "F1", Some(1.0)),
                obs("c", "202501", "F2", Some(1.0)),
                obs("zzz", "202501", "F2", Some(99.0)),
            ],
            &cat,
            &hierarchy(),
        );
        for row in &rows {
            let labels: Vec<&str> = row.values.iter().map(|(l, _)| l.as_str()).collect();
            assert_eq!(labels, vec!["a", "Beta", "c"]);
        }
    }

    #[test]
    fn test_unmapped_indicator_keeps_raw_id() {
        let cat = catalog(&["raw.id"], &[]);
        let rows = pivot_observations(vec![obs("raw.id", "202501", "F1", Some(1.0))], &cat, &hierarchy());
        assert_eq!(rows[0].values[0].0, "raw.id");
    }

    #[test]
    fn test_unknown_org_unit_has_absent_names() {
        let cat = catalog(&["a"], &[]);
        let rows = pivot_observations(vec![obs("a", "202501", "GHOST", Some(1.0))], &cat, &hierarchy());
        assert_eq!(rows[0].hierarchy, HierarchyRecord::default());
        assert_eq!(rows[0].period, "2025-01-01");
    }

    // -------------------------------------------------------------------------
    // SORTING
    // -------------------------------------------------------------------------

    #[test]
    fn test_rows_sorted_by_hierarchy() {
        let cat = catalog(&["a"], &[]);
        let rows = pivot_observations(
            vec![
                obs("a", "202501", "F1", Some(1.0)),
                obs("a", "202501", "F2", Some(1.0)),
            ],
            &cat,
            &hierarchy(),
        );
        let names: Vec<_> = rows.iter().map(|r| r.hierarchy.level2.clone().unwrap()).collect();
        assert_eq!(names, vec!["Equateur", "Kinshasa"]);
    }

    #[test]
    fn test_absent_level2_sorts_first() {
        let cat = catalog(&["a"], &[]);
        let rows = pivot_observations(
            vec![
                obs("a", "202501", "F1", Some(1.0)),
                obs("a", "202501", "GHOST", Some(1.0)),
            ],
            &cat,
            &hierarchy(),
        );
        assert_eq!(rows[0].hierarchy.level2, None);
        assert_eq!(rows[1].hierarchy.level2.as_deref(), Some("Kinshasa"));
    }

    #[test]
    fn test_period_breaks_ties() {
        let cat = catalog(&["a"], &[]);
        let rows = pivot_observations(
            vec![
                obs("a", "202502", "F1", Some(1.0)),
                obs("a", "202501", "F1", Some(1.0)),
            ],
            &cat,
            &hierarchy(),
        );
        let periods: Vec<_> = rows.iter().map(|r| r.period.as_str()).collect();
        assert_eq!(periods, vec!["2025-01-01", "2025-02-01"]);
    }

    // -------------------------------------------------------------------------
    // RECORD FORMAT
    // -------------------------------------------------------------------------

    #[test]
    fn test_row_serializes_fixed_columns_first() {
        let cat = catalog(&["b", "a"], &[("a", "Alpha")]);
        let rows = pivot_observations(vec![obs("a", "202503", "F1", Some(2.0))], &cat, &hierarchy());
        let json = serde_json::to_string(&rows[0]).unwrap();
        assert_eq!(
            json,
            r#"{"Level 2 Org Unit":"Kinshasa","Level 3 Org Unit":"Gombe","Level 4 Org Unit":"Aire 1","Level 5 Org Unit":"CS Alpha","Period":"2025-03-01","b":null,"Alpha":2.0}"#
        );
    }

    #[test]
    fn test_stored_row_reloads_unchanged() {
        let text = r#"{"Level 2 Org Unit":null,"Level 3 Org Unit":"Z","Level 4 Org Unit":null,"Level 5 Org Unit":"F","Period":"2024-12-01","Zeta":1.5,"Alpha":null}"#;
        let row: PivotedRow = serde_json::from_str(text).unwrap();
        assert_eq!(row.month_prefix(), "2024-12");
        assert_eq!(row.values[0], ("Zeta".to_string(), Some(1.5)));
        assert_eq!(serde_json::to_string(&row).unwrap(), text);
    }

    #[test]
    fn test_month_prefix_of_short_period() {
        let row = PivotedRow {
            hierarchy: HierarchyRecord::default(),
            period: "2025".into(),
            values: Vec::new(),
        };
        assert_eq!(row.month_prefix(), "2025");
    }
}
