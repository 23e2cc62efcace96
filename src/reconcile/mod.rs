//! Reconciler
//!
//! Loss-guarded merge of a local and a remote dataset, plus the merge-by-id
//! primitives sibling contexts use to converge without a network round trip.
//! Merging is total: any two datasets produce a dataset.

pub mod dedup;

pub use dedup::{DedupReport, Deduplicator};

use crate::model::{Dataset, Record, Thread, Votes};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeBranch {
    /// Remote lost too many records; local stays the base
    LossGuard,
    /// Remote is the base; local-only records are kept as pending uploads
    Normal,
}

impl MergeBranch {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeBranch::LossGuard => "loss_guard",
            MergeBranch::Normal => "normal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub dataset: Dataset,
    pub branch: MergeBranch,
    pub local_count: usize,
    pub remote_count: usize,
    /// Remote records the local side did not have
    pub remote_added: usize,
    /// Local records the remote side did not have
    pub local_pending: usize,
    pub loss_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    loss_threshold: f64,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(0.10)
    }
}

impl Reconciler {
    pub fn new(loss_threshold: f64) -> Self {
        Self { loss_threshold }
    }

    pub fn loss_threshold(&self) -> f64 {
        self.loss_threshold
    }

    /// Merge `remote` into `local`. Never loses a record that either side holds.
    pub fn merge(&self, local: &Dataset, remote: &Dataset) -> MergeOutcome {
        let local_count = local.record_count();
        let remote_count = remote.record_count();
        let loss_ratio = if local_count > remote_count {
            (local_count - remote_count) as f64 / local_count as f64
        } else {
            0.0
        };

        let loss_guard = remote_count > 0 && local_count > remote_count && loss_ratio > self.loss_threshold;

        let local_ids = local.record_ids();
        let remote_ids = remote.record_ids();
        let remote_added = remote_ids.difference(&local_ids).count();
        let local_pending = local_ids.difference(&remote_ids).count();

        let (base, other, branch) = if loss_guard {
            (local, remote, MergeBranch::LossGuard)
        } else {
            (remote, local, MergeBranch::Normal)
        };

        let mut merged = base.clone();
        append_unseen(&mut merged, &other.records);
        for (id, thread) in &other.threads {
            merged.threads.entry(id.clone()).or_insert_with(|| thread.clone());
        }
        merged.last_update = match branch {
            MergeBranch::LossGuard => local.last_update.max(remote.last_update),
            MergeBranch::Normal => remote.last_update,
        };

        MergeOutcome {
            dataset: merged,
            branch,
            local_count,
            remote_count,
            remote_added,
            local_pending,
            loss_ratio,
        }
    }
}

fn append_unseen(base: &mut Dataset, incoming: &[Record]) -> usize {
    let mut seen: HashSet<String> = base.records.iter().map(|r| r.id.clone()).collect();
    let mut added = 0;
    for record in incoming {
        if seen.insert(record.id.clone()) {
            base.records.push(record.clone());
            added += 1;
        }
    }
    added
}

/// Union of two datasets by record id; threads for shared ids are absorbed.
/// Returns the number of records added to `base`.
pub fn merge_records_by_id(base: &mut Dataset, incoming: &Dataset) -> usize {
    let added = append_unseen(base, &incoming.records);
    for (id, thread) in &incoming.threads {
        base.threads
            .entry(id.clone())
            .and_modify(|mine| mine.absorb(thread))
            .or_insert_with(|| thread.clone());
    }
    base.last_update = base.last_update.max(incoming.last_update);
    added
}

/// Insert a record announced by a sibling context. False when already present.
pub fn apply_new_record(dataset: &mut Dataset, record: Record) -> bool {
    dataset.insert_record_if_absent(record)
}

/// Fold a sibling's view of a thread into ours
pub fn apply_thread(dataset: &mut Dataset, record_id: &str, thread: &Thread) {
    dataset.thread_mut(record_id).absorb(thread);
}

/// Vote counters only grow, so the larger count wins
pub fn apply_votes(dataset: &mut Dataset, record_id: &str, votes: Votes) {
    let current = &mut dataset.thread_mut(record_id).votes;
    current.approve = current.approve.max(votes.approve);
    current.reject = current.reject.max(votes.reject);
}
