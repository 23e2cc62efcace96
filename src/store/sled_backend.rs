//! Persistent primary tier on top of sled, one tree per keyspace.

use super::backend::{Keyspace, StorageBackend};
use crate::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

pub struct SledBackend {
    db: sled::Db,
    data: sled::Tree,
    chunks: sled::Tree,
    preferences: sled::Tree,
    metadata: sled::Tree,
}

impl SledBackend {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| StoreError::Unavailable {
            backend: "sled".to_string(),
            reason: e.to_string(),
        })?;
        info!(path = %path.as_ref().display(), "Opened local store");
        Self::from_db(db)
    }

    /// Store removed when dropped
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Unavailable {
                backend: "sled".to_string(),
                reason: e.to_string(),
            })?;
        info!("Opened temporary local store");
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        Ok(Self {
            data: db.open_tree(Keyspace::Data.as_str())?,
            chunks: db.open_tree(Keyspace::Chunks.as_str())?,
            preferences: db.open_tree(Keyspace::Preferences.as_str())?,
            metadata: db.open_tree(Keyspace::Metadata.as_str())?,
            db,
        })
    }

    fn tree(&self, space: Keyspace) -> &sled::Tree {
        match space {
            Keyspace::Data => &self.data,
            Keyspace::Chunks => &self.chunks,
            Keyspace::Preferences => &self.preferences,
            Keyspace::Metadata => &self.metadata,
        }
    }
}

#[async_trait]
impl StorageBackend for SledBackend {
    fn name(&self) -> &str {
        "sled"
    }

    async fn put(&self, space: Keyspace, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.tree(space).insert(key.as_bytes(), value)?;
        Ok(())
    }

    async fn get(&self, space: Keyspace, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.tree(space).get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    async fn remove(&self, space: Keyspace, key: &str) -> StoreResult<()> {
        self.tree(space).remove(key.as_bytes())?;
        Ok(())
    }

    async fn scan(&self, space: Keyspace) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self.tree(space).iter() {
            let (key, value) = item?;
            match String::from_utf8(key.to_vec()) {
                Ok(key) => entries.push((key, value.to_vec())),
                Err(_) => tracing::warn!(keyspace = space.as_str(), "Skipping non-UTF-8 key"),
            }
        }
        Ok(entries)
    }

    async fn flush(&self) -> StoreResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn bytes_used(&self) -> Option<usize> {
        self.db.size_on_disk().ok().map(|b| b as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyspaces_are_isolated() {
        let backend = SledBackend::temporary().unwrap();
        backend.put(Keyspace::Data, "peru", b"a".to_vec()).await.unwrap();
        backend.put(Keyspace::Metadata, "peru", b"b".to_vec()).await.unwrap();

        assert_eq!(backend.get(Keyspace::Data, "peru").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(backend.get(Keyspace::Metadata, "peru").await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(backend.get(Keyspace::Chunks, "peru").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = SledBackend::open(dir.path()).unwrap();
            backend.put(Keyspace::Data, "chile", b"x".to_vec()).await.unwrap();
            backend.flush().await.unwrap();
        }
        let backend = SledBackend::open(dir.path()).unwrap();
        assert_eq!(backend.get(Keyspace::Data, "chile").await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(backend.scan(Keyspace::Data).await.unwrap().len(), 1);
    }
}
