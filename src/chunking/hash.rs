//! Content hashing for chunks, replica slots and Merkle nodes.
//!
//! Chunk and slot hashes use BLAKE3. Merkle nodes combine with SHA-256.
//! Roots are equality fingerprints between nodes that trust each other, not
//! signatures: nothing here authenticates who produced a chunk.

use crate::model::Record;
use sha2::{Digest, Sha256};

/// Hex BLAKE3 hash of a record slice as it is serialized on the wire
pub fn hash_records(records: &[Record]) -> String {
    let mut hasher = blake3::Hasher::new();
    for record in records {
        // Record serialization only fails for non-string map keys, which the model excludes
        match serde_json::to_vec(record) {
            Ok(bytes) => {
                hasher.update(&(bytes.len() as u64).to_le_bytes());
                hasher.update(&bytes);
            }
            Err(e) => {
                tracing::error!(record_id = %record.id, error = %e, "Unserializable record in chunk");
                hasher.update(record.id.as_bytes());
            }
        }
    }
    hasher.finalize().to_hex().to_string()
}

/// Hex BLAKE3 hash of an arbitrary string
pub fn hash_str(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Parent node of two Merkle children
pub fn combine(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Position of a hash on the u64 ring, from its first 8 bytes.
/// Non-hex input is rehashed so every string has a position.
pub fn hash_prefix_u64(hash: &str) -> u64 {
    let prefix = hash.get(..16).and_then(|p| hex::decode(p).ok());
    let bytes = match prefix {
        Some(bytes) if bytes.len() == 8 => bytes,
        _ => blake3::hash(hash.as_bytes()).as_bytes()[..8].to_vec(),
    };
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes);
    u64::from_be_bytes(buf)
}
