//! Merge cached records back into dataset rows
//!
//! Field-fill policy:
//! - **Preserve** rules fill a column from the record only when the row's
//!   value is blank. With a resolved record, a missing field fills the blank
//!   with the sentinel; with a null record the column is left alone.
//! - **Derived** rules always overwrite the column, writing the sentinel when
//!   the record is null or lacks the field.
//!
//! Rows with a blank key are left untouched. After filling, rows are
//! deduplicated by key, keeping the first occurrence.

use crate::dataset::Dataset;
use crate::error::Result;
use crate::services::cache::RecordCache;
use crate::types::{Key, Record};
use keyfill_common::{FieldRule, MergeConfig};
use serde::Serialize;
use std::collections::BTreeSet;

/// Counters for one merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Rows before deduplication
    pub rows: usize,
    /// Rows filled from a resolved record
    pub filled: usize,
    /// Rows with a key but no resolved record (sentinels only)
    pub unresolved: usize,
    /// Rows dropped as later duplicates of a key
    pub duplicates_removed: usize,
}

/// Applies a field-fill policy to a dataset
#[derive(Debug, Clone)]
pub struct Merger {
    policy: MergeConfig,
}

impl Merger {
    pub fn new(policy: MergeConfig) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MergeConfig {
        &self.policy
    }

    /// Derived rules in effect for a dataset holding `keys`
    ///
    /// An empty configured list expands to every field of the resolved
    /// records for `keys`, sorted, minus fields already claimed by preserve
    /// rules. Cache entries for other keys are ignored.
    pub fn derived_rules(&self, keys: &[Key], cache: &RecordCache) -> Vec<FieldRule> {
        if !self.policy.derived.is_empty() {
            return self.policy.derived.clone();
        }

        let preserved: BTreeSet<&str> = self.policy.preserve.iter().map(|r| r.column.as_str()).collect();
        let fields: BTreeSet<String> = keys
            .iter()
            .filter_map(|key| cache.get(key).flatten())
            .flat_map(|record| record.into_keys())
            .collect();

        fields
            .into_iter()
            .filter(|field| !preserved.contains(field.as_str()))
            .map(FieldRule::new)
            .collect()
    }

    /// Fill every row from the cache, then drop later duplicates of each key
    pub fn merge(&self, dataset: &mut Dataset, cache: &RecordCache) -> Result<MergeReport> {
        let key_idx = dataset.key_column_index(&self.policy.key_column)?;
        let keys = dataset.distinct_keys(&self.policy.key_column)?;
        let sentinel = self.policy.sentinel.as_str();

        let preserve: Vec<(usize, String)> = self
            .policy
            .preserve
            .iter()
            .map(|rule| (dataset.ensure_column(&rule.column), rule.source_field().to_string()))
            .collect();
        let derived: Vec<(usize, String)> = self
            .derived_rules(&keys, cache)
            .iter()
            .map(|rule| (dataset.ensure_column(&rule.column), rule.source_field().to_string()))
            .collect();

        let mut report = MergeReport {
            rows: dataset.len(),
            ..MergeReport::default()
        };

        for row in dataset.rows_mut() {
            let Some(key) = row.get(key_idx).and_then(Key::parse) else {
                continue;
            };
            let record: Option<Record> = cache.get(&key).flatten();

            match &record {
                Some(record) => {
                    for (column, field) in &preserve {
                        if row.is_blank(*column) {
                            row.set(*column, field_or(record, field, sentinel));
                        }
                    }
                    report.filled += 1;
                }
                None => report.unresolved += 1,
            }

            for (column, field) in &derived {
                let value = match &record {
                    Some(record) => field_or(record, field, sentinel),
                    None => sentinel.to_string(),
                };
                row.set(*column, value);
            }
        }

        let removed = dataset.deduplicate_by_key(&self.policy.key_column)?;
        report.duplicates_removed = removed.len();

        tracing::info!(
            rows = report.rows,
            filled = report.filled,
            unresolved = report.unresolved,
            duplicates_removed = report.duplicates_removed,
            "Merged cached records into dataset"
        );
        Ok(report)
    }
}

fn field_or(record: &Record, field: &str, sentinel: &str) -> String {
    record
        .get(field)
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| sentinel.to_string())
}
