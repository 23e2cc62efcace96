//! Local Store
//!
//! Durable, per-country keyed storage of datasets, chunks, preferences and
//! metadata. Writes go through an ordered pipeline of sinks: the persistent
//! primary tier, then the bounded in-memory fallback mirror. A failing sink
//! never fails the caller; the returned [`WriteReport`] says where the value
//! landed and carries a user-facing warning when it landed nowhere.
//!
//! The primary tier is opened lazily and exactly once, however many tasks
//! race on [`LocalStore::init`].

pub mod backend;
pub mod memory;
pub mod sled_backend;

pub use backend::{Keyspace, StorageBackend};
pub use memory::MemoryBackend;
pub use sled_backend::SledBackend;

use crate::chunking::Chunk;
use crate::config::StorageConfig;
use crate::errors::{SerializationError, StoreError, StoreResult};
use crate::logging::store_span;
use crate::model::Dataset;
use crate::utils::current_timestamp_ms;
use dashmap::DashSet;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::Instrument;

/// Role of a sink in the write pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkRole {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOutcome {
    pub sink: String,
    pub role: SinkRole,
    pub error: Option<String>,
}

/// Where one write landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub key: String,
    pub outcomes: Vec<SinkOutcome>,
}

impl WriteReport {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, sink: &str, role: SinkRole, result: StoreResult<()>) {
        self.outcomes.push(SinkOutcome {
            sink: sink.to_string(),
            role,
            error: result.err().map(|e| e.to_string()),
        });
    }

    /// At least one sink holds the value
    pub fn persisted(&self) -> bool {
        self.outcomes.iter().any(|o| o.error.is_none())
    }

    pub fn primary_ok(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.role == SinkRole::Primary && o.error.is_none())
    }

    /// Message to show the user, if this write needs their attention
    pub fn warning(&self) -> Option<String> {
        if !self.persisted() {
            let reasons: Vec<String> = self
                .outcomes
                .iter()
                .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.sink, e)))
                .collect();
            Some(format!(
                "Could not save '{}' on this device ({})",
                self.key,
                reasons.join("; ")
            ))
        } else if !self.primary_ok() {
            Some(format!(
                "'{}' is only held in temporary storage until the local database is available",
                self.key
            ))
        } else {
            None
        }
    }
}

/// Metadata value as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: Value,
    pub timestamp: u64,
}

/// Chunk as persisted, tagged with its country
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub country: String,
    #[serde(flatten)]
    pub chunk: Chunk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHealth {
    pub primary: Option<String>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub countries: BTreeMap<String, usize>,
    pub total_records: usize,
    pub total_chunks: usize,
    pub primary_available: bool,
    pub primary_bytes: Option<usize>,
    pub fallback_bytes: usize,
    pub fallback_capacity_bytes: usize,
}

pub struct LocalStore {
    config: StorageConfig,
    primary: OnceCell<Option<Arc<dyn StorageBackend>>>,
    fallback: Arc<MemoryBackend>,
    /// Keys whose latest value only reached the fallback
    stale_primary: DashSet<(Keyspace, String)>,
    /// Keys whose latest value only reached the primary; the fallback holds no copy
    unmirrored: DashSet<(Keyspace, String)>,
}

fn chunk_key(country: &str, chunk_id: &str) -> String {
    format!("{}/{}", country, chunk_id)
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::CorruptEntry {
        key: std::any::type_name::<T>().to_string(),
        reason: SerializationError::from(e).to_string(),
    })
}

impl LocalStore {
    /// Store whose primary is opened from `config.path` on first use
    pub fn new(config: StorageConfig) -> Self {
        let fallback = Arc::new(MemoryBackend::new("fallback", config.fallback_capacity_bytes));
        Self {
            config,
            primary: OnceCell::new(),
            fallback,
            stale_primary: DashSet::new(),
            unmirrored: DashSet::new(),
        }
    }

    /// Store with an already constructed primary backend
    pub fn with_primary(config: StorageConfig, primary: Arc<dyn StorageBackend>) -> Self {
        let fallback = Arc::new(MemoryBackend::new("fallback", config.fallback_capacity_bytes));
        Self {
            config,
            primary: OnceCell::new_with(Some(Some(primary))),
            fallback,
            stale_primary: DashSet::new(),
            unmirrored: DashSet::new(),
        }
    }

    /// Store running on the fallback tier only
    pub fn fallback_only(config: StorageConfig) -> Self {
        let fallback = Arc::new(MemoryBackend::new("fallback", config.fallback_capacity_bytes));
        Self {
            config,
            primary: OnceCell::new_with(Some(None)),
            fallback,
            stale_primary: DashSet::new(),
            unmirrored: DashSet::new(),
        }
    }

    /// Open the primary tier. Idempotent and safe to call concurrently.
    pub async fn init(&self) -> StoreHealth {
        self.primary().await;
        self.health()
    }

    pub fn health(&self) -> StoreHealth {
        let primary = self
            .primary
            .get()
            .and_then(|p| p.as_ref())
            .map(|p| p.name().to_string());
        StoreHealth {
            degraded: primary.is_none(),
            primary,
        }
    }

    async fn primary(&self) -> Option<&Arc<dyn StorageBackend>> {
        self.primary
            .get_or_init(|| async {
                let opened = match &self.config.path {
                    Some(path) => SledBackend::open(path),
                    None => SledBackend::temporary(),
                };
                match opened {
                    Ok(backend) => Some(Arc::new(backend) as Arc<dyn StorageBackend>),
                    Err(e) => {
                        crate::store_warn!(error = %e, "Primary store unavailable, running on fallback tier");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    /// Run one write through the sink pipeline
    async fn write(&self, space: Keyspace, key: &str, value: Vec<u8>) -> WriteReport {
        let span = store_span("write", key);
        async {
            let mut report = WriteReport::new(key);
            let bytes = value.len();

            match self.primary().await {
                Some(primary) => {
                    let result = primary.put(space, key, value.clone()).await;
                    if let Err(e) = &result {
                        crate::store_warn!(sink = primary.name(), key = key, error = %e, "Primary sink write failed");
                    }
                    report.record(primary.name(), SinkRole::Primary, result);
                }
                None => report.record(
                    "primary",
                    SinkRole::Primary,
                    Err(StoreError::Unavailable {
                        backend: "primary".to_string(),
                        reason: "not opened".to_string(),
                    }),
                ),
            }

            let stale_key = (space, key.to_string());
            let result = self.fallback.put(space, key, value).await;
            match &result {
                Ok(()) => {
                    self.unmirrored.remove(&stale_key);
                }
                Err(e) if report.primary_ok() => {
                    tracing::debug!(key = key, error = %e, "Fallback mirror skipped");
                    // an older mirror must not outlive the value that replaced it
                    if let Err(e) = self.fallback.remove(space, key).await {
                        crate::store_warn!(key = key, error = %e, "Could not drop outdated fallback copy");
                    }
                    self.unmirrored.insert(stale_key.clone());
                }
                Err(e) => crate::store_warn!(key = key, error = %e, "Fallback sink write failed"),
            }
            report.record(self.fallback.name(), SinkRole::Fallback, result);

            if report.primary_ok() {
                self.stale_primary.remove(&stale_key);
            } else if report.persisted() {
                self.stale_primary.insert(stale_key);
            }

            let ok = report.outcomes.iter().filter(|o| o.error.is_none()).count();
            tracing::Span::current().record("sinks_ok", ok);
            tracing::Span::current().record("bytes", bytes);
            report
        }
        .instrument(span)
        .await
    }

    /// Read preferring the primary unless the freshest value only reached the
    /// fallback. An unavailable primary reads as absent unless the key's latest
    /// value lives only there; fails when both tiers fail.
    async fn read(&self, space: Keyspace, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let prefer_fallback = self.stale_primary.contains(&(space, key.to_string()));
        let mut primary_error = None;

        if !prefer_fallback {
            if let Some(primary) = self.primary().await {
                match primary.get(space, key).await {
                    Ok(Some(value)) => return Ok(Some(value)),
                    Ok(None) => {}
                    Err(e) => {
                        crate::store_warn!(key = key, error = %e, "Primary read failed, trying fallback");
                        primary_error = Some(e);
                    }
                }
            }
        }

        match (self.fallback.get(space, key).await, primary_error) {
            (Ok(None), Some(e)) if self.unmirrored.contains(&(space, key.to_string())) => Err(e),
            (Ok(value), _) => Ok(value),
            (Err(e), primary_error) => Err(primary_error.unwrap_or(e)),
        }
    }

    /// Delete from both tiers. A primary that cannot delete is bypassed for this key until migrated.
    async fn remove(&self, space: Keyspace, key: &str) -> StoreResult<()> {
        let stale_key = (space, key.to_string());
        let mut primary_error = None;
        if let Some(primary) = self.primary().await {
            if let Err(e) = primary.remove(space, key).await {
                crate::store_warn!(key = key, error = %e, "Primary delete failed");
                primary_error = Some(e);
            }
        }

        match (primary_error, self.fallback.remove(space, key).await) {
            (Some(e), Err(_)) => Err(e),
            (Some(_), Ok(())) => {
                self.stale_primary.insert(stale_key);
                Ok(())
            }
            (None, result) => {
                self.stale_primary.remove(&stale_key);
                self.unmirrored.remove(&stale_key);
                result
            }
        }
    }

    /// Union of both tiers; the fallback wins for keys the primary holds stale
    async fn scan(&self, space: Keyspace) -> StoreResult<BTreeMap<String, Vec<u8>>> {
        let fallback: BTreeMap<String, Vec<u8>> = self.fallback.scan(space).await?.into_iter().collect();
        let mut merged = BTreeMap::new();
        if let Some(primary) = self.primary().await {
            match primary.scan(space).await {
                Ok(entries) => merged.extend(entries.into_iter().filter(|(key, _)| {
                    fallback.contains_key(key) || !self.stale_primary.contains(&(space, key.clone()))
                })),
                Err(e) => crate::store_warn!(keyspace = space.as_str(), error = %e, "Primary scan failed"),
            }
        }
        for (key, value) in fallback {
            let fresher = self.stale_primary.contains(&(space, key.clone()));
            if fresher || !merged.contains_key(&key) {
                merged.insert(key, value);
            }
        }
        Ok(merged)
    }

    // ---- datasets ----

    /// Atomic per-country upsert of the full dataset
    pub async fn save_data(&self, country: &str, dataset: &Dataset) -> StoreResult<WriteReport> {
        let value = encode(dataset)?;
        let report = self.write(Keyspace::Data, country, value).await;
        if let Some(warning) = report.warning() {
            crate::store_warn!(country = country, warning = %warning, "Dataset write degraded");
        }
        Ok(report)
    }

    /// Dataset for a country, empty when none was stored
    pub async fn load_data(&self, country: &str) -> StoreResult<Dataset> {
        Ok(self
            .read(Keyspace::Data, country)
            .await?
            .map(|bytes| Dataset::from_json_lenient(&bytes))
            .unwrap_or_default())
    }

    pub async fn delete_data(&self, country: &str) -> StoreResult<()> {
        self.remove(Keyspace::Data, country).await
    }

    /// Countries with a stored dataset
    pub async fn countries(&self) -> StoreResult<Vec<String>> {
        Ok(self.scan(Keyspace::Data).await?.into_keys().collect())
    }

    // ---- chunks ----

    pub async fn save_chunk(&self, country: &str, chunk: &Chunk) -> StoreResult<WriteReport> {
        let stored = StoredChunk {
            country: country.to_string(),
            chunk: chunk.clone(),
        };
        let value = encode(&stored)?;
        Ok(self.write(Keyspace::Chunks, &chunk_key(country, &chunk.id), value).await)
    }

    pub async fn load_chunk(&self, country: &str, chunk_id: &str) -> StoreResult<Option<Chunk>> {
        match self.read(Keyspace::Chunks, &chunk_key(country, chunk_id)).await? {
            Some(bytes) => match serde_json::from_slice::<StoredChunk>(&bytes) {
                Ok(stored) => Ok(Some(stored.chunk)),
                Err(e) => Err(StoreError::CorruptEntry {
                    key: chunk_key(country, chunk_id),
                    reason: e.to_string(),
                }),
            },
            None => Ok(None),
        }
    }

    /// All chunks stored for a country, ordered by index. Unreadable entries are skipped.
    pub async fn load_chunks(&self, country: &str) -> StoreResult<Vec<Chunk>> {
        let prefix = format!("{}/", country);
        let mut chunks: Vec<Chunk> = self
            .scan(Keyspace::Chunks)
            .await?
            .into_iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, bytes)| match serde_json::from_slice::<StoredChunk>(&bytes) {
                Ok(stored) if stored.country == country => Some(stored.chunk),
                Ok(_) => None,
                Err(e) => {
                    crate::store_warn!(key = %key, error = %e, "Skipping unreadable chunk");
                    None
                }
            })
            .collect();
        chunks.sort_by_key(|c| c.index);
        Ok(chunks)
    }

    pub async fn list_chunk_ids(&self, country: &str) -> StoreResult<BTreeSet<String>> {
        let prefix = format!("{}/", country);
        Ok(self
            .scan(Keyspace::Chunks)
            .await?
            .into_keys()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub async fn delete_chunk(&self, country: &str, chunk_id: &str) -> StoreResult<()> {
        self.remove(Keyspace::Chunks, &chunk_key(country, chunk_id)).await
    }

    // ---- metadata ----

    pub async fn save_metadata<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<WriteReport> {
        let entry = MetadataEntry {
            key: key.to_string(),
            value: serde_json::to_value(value).map_err(|e| StoreError::CorruptEntry {
                key: key.to_string(),
                reason: e.to_string(),
            })?,
            timestamp: current_timestamp_ms(),
        };
        let value = encode(&entry)?;
        Ok(self.write(Keyspace::Metadata, key, value).await)
    }

    pub async fn load_metadata_entry(&self, key: &str) -> StoreResult<Option<MetadataEntry>> {
        match self.read(Keyspace::Metadata, key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::CorruptEntry {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Metadata value decoded as `T`; a value of another shape reads as absent
    pub async fn load_metadata<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        Ok(self
            .load_metadata_entry(key)
            .await?
            .and_then(|entry| match serde_json::from_value(entry.value) {
                Ok(value) => Some(value),
                Err(e) => {
                    crate::store_warn!(key = key, error = %e, "Metadata has unexpected shape");
                    None
                }
            }))
    }

    pub async fn delete_metadata(&self, key: &str) -> StoreResult<()> {
        self.remove(Keyspace::Metadata, key).await
    }

    // ---- preferences ----

    pub async fn save_preferences(&self, user_key: &str, preferences: &Value) -> StoreResult<WriteReport> {
        let value = encode(preferences)?;
        Ok(self.write(Keyspace::Preferences, user_key, value).await)
    }

    pub async fn load_preferences(&self, user_key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .read(Keyspace::Preferences, user_key)
            .await?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    // ---- maintenance ----

    pub async fn storage_stats(&self) -> StoreResult<StorageStats> {
        let mut stats = StorageStats {
            primary_available: self.primary().await.is_some(),
            primary_bytes: self.primary().await.and_then(|p| p.bytes_used()),
            fallback_bytes: self.fallback.bytes_used().unwrap_or(0),
            fallback_capacity_bytes: self.fallback.capacity_bytes(),
            ..Default::default()
        };

        for (country, bytes) in self.scan(Keyspace::Data).await? {
            let count = Dataset::from_json_lenient(&bytes).record_count();
            stats.total_records += count;
            stats.countries.insert(country, count);
        }
        stats.total_chunks = self.scan(Keyspace::Chunks).await?.len();
        Ok(stats)
    }

    /// Remove datasets whose `last_update` is older than `max_age`. Returns how many.
    pub async fn clean_old_data(&self, max_age: Duration) -> StoreResult<usize> {
        let cutoff = current_timestamp_ms().saturating_sub(max_age.as_millis() as u64);
        let mut removed = 0;
        for (country, bytes) in self.scan(Keyspace::Data).await? {
            let dataset = Dataset::from_json_lenient(&bytes);
            if dataset.last_update < cutoff {
                self.remove(Keyspace::Data, &country).await?;
                removed += 1;
                tracing::info!(country = %country, last_update = dataset.last_update, "Removed stale dataset");
            }
        }
        Ok(removed)
    }

    /// Garbage-collect using the configured `max_data_age_days`
    pub async fn clean_expired(&self) -> StoreResult<usize> {
        self.clean_old_data(Duration::from_secs(self.config.max_data_age_days * 24 * 60 * 60))
            .await
    }

    /// Copy entries the primary is missing or holds stale from the fallback. Idempotent.
    pub async fn migrate_fallback(&self) -> StoreResult<usize> {
        let Some(primary) = self.primary().await else {
            return Err(StoreError::Unavailable {
                backend: "primary".to_string(),
                reason: "not opened".to_string(),
            });
        };

        let mut migrated = 0;
        for space in Keyspace::ALL {
            for (key, value) in self.fallback.scan(space).await? {
                let stale_key = (space, key.clone());
                let stale = self.stale_primary.contains(&stale_key);
                if stale || primary.get(space, &key).await?.is_none() {
                    primary.put(space, &key, value).await?;
                    self.stale_primary.remove(&stale_key);
                    migrated += 1;
                }
            }
        }

        // deletes the primary missed
        let pending: Vec<(Keyspace, String)> = self.stale_primary.iter().map(|k| k.key().clone()).collect();
        for (space, key) in pending {
            if self.fallback.get(space, &key).await?.is_none() {
                primary.remove(space, &key).await?;
                self.stale_primary.remove(&(space, key));
                migrated += 1;
            }
        }
        primary.flush().await?;

        if migrated > 0 {
            tracing::info!(migrated = migrated, "Migrated fallback entries to primary store");
        }
        Ok(migrated)
    }

    pub async fn flush(&self) -> StoreResult<()> {
        if let Some(primary) = self.primary().await {
            primary.flush().await?;
        }
        Ok(())
    }
}
