//! Deduplicator
//!
//! Two records are duplicates when they differ in at most `max_mismatches` of
//! the configured descriptive fields, compared case-insensitively after
//! trimming. The first occurrence wins. Comparison is quadratic in the number
//! of records; fine for the few thousand records a country holds, not beyond.

use crate::config::DedupConfig;
use crate::model::{Dataset, Record};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub records_removed: usize,
    pub threads_removed: usize,
}

impl DedupReport {
    pub fn changed(&self) -> bool {
        self.records_removed > 0 || self.threads_removed > 0
    }
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    fields: Vec<String>,
    max_mismatches: usize,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(&DedupConfig::default())
    }
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            fields: config.fields.clone(),
            max_mismatches: config.max_mismatches,
        }
    }

    fn normalized(&self, record: &Record) -> Vec<String> {
        self.fields
            .iter()
            .map(|field| record.field_text(field).trim().to_lowercase())
            .collect()
    }

    fn within_tolerance(&self, a: &[String], b: &[String]) -> bool {
        let mut mismatches = 0;
        for (x, y) in a.iter().zip(b) {
            if x != y {
                mismatches += 1;
                if mismatches > self.max_mismatches {
                    return false;
                }
            }
        }
        true
    }

    pub fn are_identical(&self, a: &Record, b: &Record) -> bool {
        self.within_tolerance(&self.normalized(a), &self.normalized(b))
    }

    /// Drop records that duplicate an earlier one, preserving order
    pub fn remove_duplicates(&self, records: Vec<Record>) -> (Vec<Record>, usize) {
        let total = records.len();
        let mut kept: Vec<Record> = Vec::with_capacity(total);
        let mut kept_keys: Vec<Vec<String>> = Vec::with_capacity(total);

        for record in records {
            let key = self.normalized(&record);
            if kept_keys.iter().any(|k| self.within_tolerance(k, &key)) {
                tracing::debug!(record_id = %record.id, "Duplicate record dropped");
                continue;
            }
            kept_keys.push(key);
            kept.push(record);
        }

        let removed = total - kept.len();
        (kept, removed)
    }

    /// Deduplicate records and drop threads whose record no longer exists
    pub fn clean_country_data(&self, dataset: &mut Dataset) -> DedupReport {
        let records = std::mem::take(&mut dataset.records);
        let (records, records_removed) = self.remove_duplicates(records);
        dataset.records = records;

        let ids: HashSet<String> = dataset.records.iter().map(|r| r.id.clone()).collect();
        let before = dataset.threads.len();
        dataset.threads.retain(|id, _| ids.contains(id));
        let threads_removed = before - dataset.threads.len();

        let report = DedupReport {
            records_removed,
            threads_removed,
        };
        if report.changed() {
            tracing::info!(
                records_removed = report.records_removed,
                threads_removed = report.threads_removed,
                "Dataset deduplicated"
            );
        }
        report
    }
}
