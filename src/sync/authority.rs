//! In-process authority.
//!
//! Behaves like the HTTP authority: sync is a union by record id followed by
//! duplicate removal, and chunk listing and pulls are derived from the
//! authority's current dataset. Used by tests, the benchmark and the CLI's
//! offline mode, with knobs to simulate outages, latency and tampering.

use super::transport::{
    AnnounceAck, Announcement, ChunkPayload, SyncRequest, SyncResponse, SyncTransport,
};
use crate::chunking::{create_chunks, Chunk, ChunkDescriptor};
use crate::errors::{NetworkError, NetworkResult};
use crate::model::Dataset;
use crate::reconcile::{merge_records_by_id, Deduplicator};
use crate::utils::current_timestamp_ms;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

pub struct InMemoryAuthority {
    chunk_size: usize,
    datasets: Mutex<HashMap<String, Dataset>>,
    dedup: Deduplicator,
    online: AtomicBool,
    accept_uploads: AtomicBool,
    corrupt_chunks: AtomicBool,
    latency_ms: AtomicU64,
    sync_calls: AtomicUsize,
    announcements: RwLock<Vec<Announcement>>,
}

impl InMemoryAuthority {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            datasets: Mutex::new(HashMap::new()),
            dedup: Deduplicator::default(),
            online: AtomicBool::new(true),
            accept_uploads: AtomicBool::new(true),
            corrupt_chunks: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            sync_calls: AtomicUsize::new(0),
            announcements: RwLock::new(Vec::new()),
        }
    }

    /// Merge `dataset` into what the authority already holds
    pub fn seed(&self, country: &str, dataset: Dataset) {
        let mut datasets = self.datasets.lock();
        let current = datasets.entry(country.to_string()).or_default();
        merge_records_by_id(current, &dataset);
    }

    /// Replace the authority's dataset, e.g. to simulate a server regression
    pub fn replace(&self, country: &str, dataset: Dataset) {
        self.datasets.lock().insert(country.to_string(), dataset);
    }

    pub fn dataset(&self, country: &str) -> Dataset {
        self.datasets.lock().get(country).cloned().unwrap_or_default()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// When false, sync returns the authority's state without merging the client's
    pub fn set_accept_uploads(&self, accept: bool) {
        self.accept_uploads.store(accept, Ordering::SeqCst);
    }

    /// Serve chunks whose records no longer match their hash
    pub fn set_corrupt_chunks(&self, corrupt: bool) {
        self.corrupt_chunks.store(corrupt, Ordering::SeqCst);
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    pub fn announcements(&self) -> Vec<Announcement> {
        self.announcements.read().clone()
    }

    async fn round_trip(&self) -> NetworkResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NetworkError::NetworkUnreachable {
                reason: "authority offline".to_string(),
            })
        }
    }

    fn chunks(&self, country: &str) -> Vec<Chunk> {
        let dataset = self.dataset(country);
        create_chunks(&dataset.records, self.chunk_size).unwrap_or_default()
    }
}

#[async_trait]
impl SyncTransport for InMemoryAuthority {
    fn endpoint(&self) -> String {
        "memory://authority".to_string()
    }

    async fn sync(&self, request: SyncRequest) -> NetworkResult<SyncResponse> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;

        let now = current_timestamp_ms();
        let mut datasets = self.datasets.lock();
        let current = datasets.entry(request.country.clone()).or_default();
        let added = if self.accept_uploads.load(Ordering::SeqCst) {
            merge_records_by_id(current, &request.client_dataset)
        } else {
            0
        };
        let report = self.dedup.clean_country_data(current);
        current.last_update = now;

        tracing::debug!(
            country = %request.country,
            added = added,
            duplicates_removed = report.records_removed,
            total = current.record_count(),
            "Authority merged client dataset"
        );

        Ok(SyncResponse {
            dataset: current.clone(),
            server_timestamp: now,
        })
    }

    async fn announce(&self, announcement: Announcement) -> NetworkResult<AnnounceAck> {
        self.round_trip().await?;
        self.announcements.write().push(announcement);
        Ok(AnnounceAck { accepted: true })
    }

    async fn list_chunks(&self, country: &str) -> NetworkResult<Vec<ChunkDescriptor>> {
        self.round_trip().await?;
        Ok(self.chunks(country).iter().map(Chunk::descriptor).collect())
    }

    async fn pull_chunk(&self, country: &str, chunk_hash: &str) -> NetworkResult<ChunkPayload> {
        self.round_trip().await?;
        let mut chunk = self
            .chunks(country)
            .into_iter()
            .find(|c| c.hash == chunk_hash)
            .ok_or_else(|| NetworkError::ChunkNotAvailable {
                chunk_hash: chunk_hash.to_string(),
            })?;

        if self.corrupt_chunks.load(Ordering::SeqCst) {
            if let Some(record) = chunk.records.first_mut() {
                record.fields.insert("nombres".to_string(), "tampered".into());
            }
        }

        Ok(ChunkPayload {
            chunk_hash: chunk_hash.to_string(),
            chunk,
        })
    }
}
