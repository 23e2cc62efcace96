//! Replica Assigner
//!
//! Decides which chunks this node persists. Each node projects
//! `replication_factor` virtual slots onto the same u64 line as the chunk
//! hashes and keeps the `max_local_chunks` chunks nearest to any of its slots.
//! Small datasets are fully replicated.

use crate::chunking::{hash_prefix_u64, hash_str, Chunk};
use crate::config::ChunkingConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap};

/// Why a chunk was assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaReason {
    /// Dataset at or below the full replication cutoff
    Full,
    /// Nearest to the given virtual slot
    Slot(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignedChunk {
    pub chunk: Chunk,
    pub reason: ReplicaReason,
    pub distance: u64,
}

/// Heap entry ordered by distance, ties broken by chunk index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    distance: u64,
    index: usize,
    slot: usize,
}

#[derive(Debug, Clone)]
pub struct ReplicaAssigner {
    max_local_chunks: usize,
    replication_factor: usize,
    full_replication_max: usize,
}

impl ReplicaAssigner {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            max_local_chunks: config.max_local_chunks.max(1),
            replication_factor: config.replication_factor.max(1),
            full_replication_max: config.full_replication_max,
        }
    }

    /// Position of a node's virtual slot
    pub fn slot_position(node_id: &str, slot: usize) -> u64 {
        hash_prefix_u64(&hash_str(&format!("{}_replica_{}", node_id, slot)))
    }

    /// Nodes expected to hold each chunk when `nodes` peers share `chunk_count` chunks
    pub fn expected_holders(&self, chunk_count: usize, nodes: usize) -> f64 {
        if chunk_count == 0 || chunk_count <= self.full_replication_max {
            return nodes as f64;
        }
        (nodes * self.max_local_chunks.min(chunk_count)) as f64 / chunk_count as f64
    }

    /// Whether `nodes` peers are expected to hold every chunk `replication_factor` times
    pub fn meets_replication(&self, chunk_count: usize, nodes: usize) -> bool {
        self.expected_holders(chunk_count, nodes) >= self.replication_factor as f64
    }

    /// Chunks this node should hold, sorted by chunk index
    pub fn assign_chunks_to_client(&self, chunks: &[Chunk], node_id: &str) -> Vec<AssignedChunk> {
        if chunks.len() <= self.full_replication_max {
            return chunks
                .iter()
                .map(|chunk| AssignedChunk {
                    chunk: chunk.clone(),
                    reason: ReplicaReason::Full,
                    distance: 0,
                })
                .collect();
        }

        let positions: Vec<u64> = chunks.iter().map(|c| hash_prefix_u64(&c.hash)).collect();

        // nearest slot per chunk
        let mut best: HashMap<usize, Candidate> = HashMap::new();
        for slot in 0..self.replication_factor {
            let slot_pos = Self::slot_position(node_id, slot);
            for (position, chunk) in positions.iter().zip(chunks) {
                let candidate = Candidate {
                    distance: position.abs_diff(slot_pos),
                    index: chunk.index,
                    slot,
                };
                best.entry(chunk.index)
                    .and_modify(|current| {
                        if candidate < *current {
                            *current = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
        }

        // running top-k: max-heap evicts the farthest kept chunk
        let mut kept: BinaryHeap<Candidate> = BinaryHeap::with_capacity(self.max_local_chunks + 1);
        for candidate in best.into_values() {
            if kept.len() < self.max_local_chunks {
                kept.push(candidate);
            } else if kept.peek().map_or(false, |farthest| candidate < *farthest) {
                kept.pop();
                kept.push(candidate);
            }
        }

        let by_index: HashMap<usize, &Chunk> = chunks.iter().map(|c| (c.index, c)).collect();
        let mut assigned: Vec<AssignedChunk> = kept
            .into_iter()
            .filter_map(|candidate| {
                by_index.get(&candidate.index).map(|chunk| AssignedChunk {
                    chunk: (*chunk).clone(),
                    reason: ReplicaReason::Slot(candidate.slot),
                    distance: candidate.distance,
                })
            })
            .collect();
        assigned.sort_by_key(|a| a.chunk.index);

        tracing::debug!(
            node_id = node_id,
            total_chunks = chunks.len(),
            assigned = assigned.len(),
            "Replica assignment computed"
        );
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::create_chunks;
    use crate::model::Record;
    use std::collections::HashSet;

    fn chunks(n_records: usize, size: usize) -> Vec<Chunk> {
        let records: Vec<Record> = (0..n_records)
            .map(|i| Record::new(format!("r{}", i), i as u64).with_field("nombres", format!("N{}", i)))
            .collect();
        create_chunks(&records, size).unwrap()
    }

    fn assigner(max_local: usize) -> ReplicaAssigner {
        ReplicaAssigner::new(&ChunkingConfig {
            chunk_size: 50,
            max_local_chunks: max_local,
            replication_factor: 3,
            full_replication_max: 10,
        })
    }

    #[test]
    fn small_datasets_replicate_fully() {
        let all = chunks(400, 50);
        assert_eq!(all.len(), 8);
        let assigned = assigner(5).assign_chunks_to_client(&all, "node-a");
        assert_eq!(assigned.len(), 8);
        assert!(assigned.iter().all(|a| a.reason == ReplicaReason::Full));
    }

    #[test]
    fn large_datasets_are_capped_sorted_and_unique() {
        let all = chunks(3000, 50);
        let assigned = assigner(5).assign_chunks_to_client(&all, "node-a");
        assert_eq!(assigned.len(), 5);

        let indices: Vec<usize> = assigned.iter().map(|a| a.chunk.index).collect();
        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(indices, sorted);
        assert_eq!(indices.iter().collect::<HashSet<_>>().len(), 5);
    }

    #[test]
    fn assignment_is_deterministic_per_node() {
        let all = chunks(3000, 50);
        let a = assigner(5).assign_chunks_to_client(&all, "node-a");
        let b = assigner(5).assign_chunks_to_client(&all, "node-a");
        assert_eq!(a, b);
    }

    #[test]
    fn kept_chunks_are_the_nearest() {
        let all = chunks(3000, 50);
        let node = "node-z";
        let assigned = assigner(5).assign_chunks_to_client(&all, node);
        let slots: Vec<u64> = (0..3).map(|s| ReplicaAssigner::slot_position(node, s)).collect();
        let nearest = |c: &Chunk| {
            let p = hash_prefix_u64(&c.hash);
            slots.iter().map(|s| p.abs_diff(*s)).min().unwrap()
        };

        let worst_kept = assigned.iter().map(|a| a.distance).max().unwrap();
        let kept: HashSet<usize> = assigned.iter().map(|a| a.chunk.index).collect();
        for chunk in all.iter().filter(|c| !kept.contains(&c.index)) {
            assert!(nearest(chunk) >= worst_kept);
        }
    }
}
