//! Chunker
//!
//! Splits an ordered record list into fixed-size content-addressed chunks and
//! computes a Merkle root over them. Chunking the same sequence with the same
//! size always yields the same ids, hashes and order; only `timestamp` varies.

pub mod hash;
pub mod merkle;

pub use hash::{hash_prefix_u64, hash_records, hash_str};
pub use merkle::{build_merkle_tree, merkle_root};

use crate::errors::{ConfigurationError, IntegrityError, IntegrityResult};
use crate::model::Record;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Contiguous slice of a country's records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub index: usize,
    pub records: Vec<Record>,
    /// Hash over `records` only
    pub hash: String,
    pub timestamp: u64,
}

/// What peers advertise about a chunk without shipping its records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub id: String,
    pub index: usize,
    pub hash: String,
    pub record_count: usize,
}

impl Chunk {
    pub fn descriptor(&self) -> ChunkDescriptor {
        ChunkDescriptor {
            id: self.id.clone(),
            index: self.index,
            hash: self.hash.clone(),
            record_count: self.records.len(),
        }
    }

    /// Recompute the content hash and compare it with the stored one
    pub fn verify(&self) -> IntegrityResult<()> {
        let actual = hash_records(&self.records);
        if actual == self.hash {
            Ok(())
        } else {
            Err(IntegrityError::ChunkHashMismatch {
                chunk_id: self.id.clone(),
                expected: self.hash.clone(),
                actual,
            })
        }
    }
}

/// `chunk_{index}_{firstId}_{lastId}`, with `empty` standing in for absent ids
pub fn chunk_id(index: usize, records: &[Record]) -> String {
    let first = records.first().map(|r| r.id.as_str()).unwrap_or("empty");
    let last = records.last().map(|r| r.id.as_str()).unwrap_or("empty");
    format!("chunk_{}_{}_{}", index, first, last)
}

/// Split records into `ceil(n / chunk_size)` chunks, in input order
pub fn create_chunks(records: &[Record], chunk_size: usize) -> Result<Vec<Chunk>, ConfigurationError> {
    if chunk_size == 0 {
        return Err(ConfigurationError::InvalidValue {
            key: "chunking.chunk_size".to_string(),
            value: "0".to_string(),
            reason: "Must be at least 1".to_string(),
        });
    }

    let timestamp = crate::utils::current_timestamp_ms();
    let chunks = records
        .par_chunks(chunk_size)
        .enumerate()
        .map(|(index, slice)| Chunk {
            id: chunk_id(index, slice),
            index,
            records: slice.to_vec(),
            hash: hash_records(slice),
            timestamp,
        })
        .collect();

    Ok(chunks)
}

/// Chunker bound to a configured chunk size
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Result<Self, ConfigurationError> {
        if chunk_size == 0 {
            return Err(ConfigurationError::InvalidValue {
                key: "chunking.chunk_size".to_string(),
                value: "0".to_string(),
                reason: "Must be at least 1".to_string(),
            });
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn create_chunks(&self, records: &[Record]) -> Vec<Chunk> {
        // chunk_size was validated in `new`
        create_chunks(records, self.chunk_size).unwrap_or_default()
    }

    /// Chunks plus their Merkle root
    pub fn chunk_with_root(&self, records: &[Record]) -> (Vec<Chunk>, Option<String>) {
        let chunks = self.create_chunks(records);
        let root = build_merkle_tree(&chunks);
        (chunks, root)
    }
}
