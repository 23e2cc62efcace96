use crate::errors::StoreResult;
use async_trait::async_trait;

/// Logical tables of the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Keyspace {
    /// Full datasets keyed by country
    Data,
    /// Chunks keyed by `{country}/{chunk_id}`
    Chunks,
    /// User preference blobs
    Preferences,
    /// Timestamped key/value metadata
    Metadata,
}

impl Keyspace {
    pub const ALL: [Keyspace; 4] = [
        Keyspace::Data,
        Keyspace::Chunks,
        Keyspace::Preferences,
        Keyspace::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Keyspace::Data => "data",
            Keyspace::Chunks => "chunks",
            Keyspace::Preferences => "preferences",
            Keyspace::Metadata => "metadata",
        }
    }
}

/// A byte-oriented key/value backend
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn put(&self, space: Keyspace, key: &str, value: Vec<u8>) -> StoreResult<()>;

    async fn get(&self, space: Keyspace, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn remove(&self, space: Keyspace, key: &str) -> StoreResult<()>;

    /// All entries of a keyspace, in key order
    async fn scan(&self, space: Keyspace) -> StoreResult<Vec<(String, Vec<u8>)>>;

    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Bytes held, when the backend tracks it
    fn bytes_used(&self) -> Option<usize> {
        None
    }
}
