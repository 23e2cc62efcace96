use super::hash::combine;
use super::Chunk;

/// Merkle root over chunk hashes in chunk order.
///
/// Odd levels duplicate their last node. `None` for no chunks; a single chunk's
/// root is its own hash.
pub fn build_merkle_tree(chunks: &[Chunk]) -> Option<String> {
    merkle_root(chunks.iter().map(|c| c.hash.clone()).collect())
}

/// Merkle root over an ordered list of leaf hashes
pub fn merkle_root(mut level: Vec<String>) -> Option<String> {
    if level.is_empty() {
        return None;
    }

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().cloned() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| combine(&pair[0], &pair[1]))
            .collect();
    }

    level.pop()
}
