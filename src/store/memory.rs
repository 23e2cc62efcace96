//! Size-bounded in-memory fallback tier.
//!
//! Chunk entries are evicted least-recently-used first when a write would
//! exceed the byte budget; they can be pulled again from peers or the
//! authority. Other keyspaces are never evicted, so a write that cannot fit
//! fails with `QuotaExceeded`.

use super::backend::{Keyspace, StorageBackend};
use crate::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

struct MemoryState {
    entries: HashMap<(Keyspace, String), Vec<u8>>,
    used_bytes: usize,
    chunk_lru: LruCache<String, ()>,
}

pub struct MemoryBackend {
    name: String,
    capacity_bytes: usize,
    available: AtomicBool,
    state: Mutex<MemoryState>,
}

fn entry_size(key: &str, value: &[u8]) -> usize {
    key.len() + value.len()
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, capacity_bytes: usize) -> Self {
        Self {
            name: name.into(),
            capacity_bytes,
            available: AtomicBool::new(true),
            state: Mutex::new(MemoryState {
                entries: HashMap::new(),
                used_bytes: 0,
                chunk_lru: LruCache::unbounded(),
            }),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Simulate the backend going away or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                backend: self.name.clone(),
                reason: "backend disabled".to_string(),
            })
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, space: Keyspace, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let map_key = (space, key.to_string());
        let new_size = entry_size(key, &value);
        let old_size = state
            .entries
            .get(&map_key)
            .map(|v| entry_size(key, v))
            .unwrap_or(0);

        let mut skipped_self = false;
        while state.used_bytes - old_size + new_size > self.capacity_bytes {
            let victim = loop {
                match state.chunk_lru.pop_lru() {
                    Some((victim, ())) if space == Keyspace::Chunks && victim == key => {
                        skipped_self = true;
                        continue;
                    }
                    other => break other.map(|(k, _)| k),
                }
            };
            let Some(victim) = victim else {
                // the old entry stays, so it must stay evictable
                if skipped_self && state.entries.contains_key(&map_key) {
                    state.chunk_lru.put(key.to_string(), ());
                }
                return Err(StoreError::QuotaExceeded {
                    backend: self.name.clone(),
                    requested: new_size,
                    available: self.capacity_bytes.saturating_sub(state.used_bytes - old_size),
                });
            };
            if let Some(evicted) = state.entries.remove(&(Keyspace::Chunks, victim.clone())) {
                state.used_bytes -= entry_size(&victim, &evicted);
                tracing::debug!(backend = %self.name, key = %victim, "Evicted chunk from fallback");
            }
        }

        state.used_bytes = state.used_bytes - old_size + new_size;
        state.entries.insert(map_key, value);
        if space == Keyspace::Chunks {
            state.chunk_lru.put(key.to_string(), ());
        }
        Ok(())
    }

    async fn get(&self, space: Keyspace, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check_available()?;
        let mut state = self.state.lock();
        if space == Keyspace::Chunks {
            state.chunk_lru.get(key);
        }
        Ok(state.entries.get(&(space, key.to_string())).cloned())
    }

    async fn remove(&self, space: Keyspace, key: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        if let Some(old) = state.entries.remove(&(space, key.to_string())) {
            state.used_bytes -= entry_size(key, &old);
        }
        if space == Keyspace::Chunks {
            state.chunk_lru.pop(key);
        }
        Ok(())
    }

    async fn scan(&self, space: Keyspace) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut entries: Vec<(String, Vec<u8>)> = state
            .entries
            .iter()
            .filter(|((s, _), _)| *s == space)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn bytes_used(&self) -> Option<usize> {
        Some(self.state.lock().used_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_are_evicted_lru_first() {
        let backend = MemoryBackend::new("fallback", 25);
        backend.put(Keyspace::Chunks, "c1", vec![0; 8]).await.unwrap();
        backend.put(Keyspace::Chunks, "c2", vec![0; 8]).await.unwrap();
        // touch c1 so c2 becomes least recently used
        backend.get(Keyspace::Chunks, "c1").await.unwrap();
        backend.put(Keyspace::Chunks, "c3", vec![0; 8]).await.unwrap();

        assert!(backend.get(Keyspace::Chunks, "c1").await.unwrap().is_some());
        assert!(backend.get(Keyspace::Chunks, "c2").await.unwrap().is_none());
        assert!(backend.get(Keyspace::Chunks, "c3").await.unwrap().is_some());
        assert!(backend.bytes_used().unwrap() <= 25);
    }

    #[tokio::test]
    async fn oversized_rewrite_keeps_the_chunk_evictable() {
        let backend = MemoryBackend::new("fallback", 20);
        backend.put(Keyspace::Chunks, "c1", vec![0; 8]).await.unwrap();
        let err = backend.put(Keyspace::Chunks, "c1", vec![0; 40]).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        assert_eq!(backend.get(Keyspace::Chunks, "c1").await.unwrap(), Some(vec![0; 8]));

        // c1 can still make way for a dataset
        backend.put(Keyspace::Data, "peru", vec![0; 14]).await.unwrap();
        assert!(backend.get(Keyspace::Chunks, "c1").await.unwrap().is_none());
        assert_eq!(backend.bytes_used(), Some(18));
    }

    #[tokio::test]
    async fn datasets_are_never_evicted() {
        let backend = MemoryBackend::new("fallback", 20);
        backend.put(Keyspace::Data, "peru", vec![0; 12]).await.unwrap();
        let err = backend.put(Keyspace::Data, "chile", vec![0; 12]).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        assert!(backend.get(Keyspace::Data, "peru").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn overwrite_reuses_budget() {
        let backend = MemoryBackend::new("fallback", 20);
        backend.put(Keyspace::Data, "peru", vec![0; 12]).await.unwrap();
        backend.put(Keyspace::Data, "peru", vec![1; 14]).await.unwrap();
        assert_eq!(backend.bytes_used(), Some(18));
    }

    #[tokio::test]
    async fn chunk_pressure_makes_room_for_data() {
        let backend = MemoryBackend::new("fallback", 30);
        backend.put(Keyspace::Chunks, "c1", vec![0; 10]).await.unwrap();
        backend.put(Keyspace::Chunks, "c2", vec![0; 10]).await.unwrap();
        backend.put(Keyspace::Data, "peru", vec![0; 12]).await.unwrap();
        assert_eq!(backend.scan(Keyspace::Chunks).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_backend_fails() {
        let backend = MemoryBackend::new("primary", 1024);
        backend.set_available(false);
        assert!(matches!(
            backend.put(Keyspace::Data, "peru", vec![1]).await,
            Err(StoreError::Unavailable { .. })
        ));
    }
}
