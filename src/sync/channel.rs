//! The sync channel: one instance per execution context.
//!
//! All read-modify-write work on a country (sync rounds, local mutations,
//! sibling messages, reconstruction) runs under that country's async lock.
//! Callers that queued behind a successful sync round are coalesced into it
//! and get its result without another network round trip.

use super::tab::{TabBus, TabEnvelope, TabMessage};
use super::transport::{build_transport, Announcement, SyncRequest, SyncTransport};
use super::{ChangeOrigin, DatasetChange, DatasetObserver, Notice, SyncMetrics, SyncPhase};
use crate::chunking::{build_merkle_tree, hash_records, Chunk, ChunkDescriptor, Chunker};
use crate::config::{DeviceProfile, SyncConfiguration};
use crate::errors::{
    utils::{get_error_severity, is_recoverable_error}, IntegrityError, MeshError, MeshResult, NetworkError,
};
use crate::logging::{
    log_integrity_check, log_merge_decision, log_storage_mode, reconstruct_span, sync_span,
    PerformanceLogger,
};
use crate::model::{Comment, Dataset, Record, RecordIndexEntry, VoteKind, Votes, MIN_PROPOSAL_VOTES};
use crate::reconcile::{
    apply_new_record, apply_thread, apply_votes, merge_records_by_id, Deduplicator, MergeBranch,
    Reconciler,
};
use crate::replica::ReplicaAssigner;
use crate::store::{LocalStore, WriteReport};
use crate::utils::{current_timestamp_ms, generate_id};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::Instrument;

/// How a country is persisted on this node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Whole dataset under the country key
    #[default]
    Full,
    /// Assigned chunks plus index, Merkle root and a thread shell
    Distributed,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Full => "full",
            StorageMode::Distributed => "distributed",
        }
    }
}

/// Result of rebuilding a chunked country from local and remote chunks
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub dataset: Dataset,
    /// Every chunk in the manifest was found
    pub complete: bool,
    /// Merkle root matched the persisted one
    pub verified: bool,
    /// Local copy was discarded and fetched again from the authority
    pub refreshed: bool,
    pub local_chunks: usize,
    pub pulled_chunks: usize,
    /// Ids of chunks nobody could serve
    pub missing: Vec<String>,
}

impl Reconstruction {
    fn whole(dataset: Dataset, refreshed: bool) -> Self {
        Self {
            dataset,
            complete: true,
            verified: true,
            refreshed,
            local_chunks: 0,
            pulled_chunks: 0,
            missing: Vec::new(),
        }
    }
}

fn meta_key(kind: &str, country: &str) -> String {
    format!("{}_{}", kind, country)
}

/// Metadata written only in distributed mode
const DISTRIBUTED_METADATA: &[&str] = &[
    "merkle_root",
    "total_chunks",
    "total_records",
    "my_chunks",
    "record_index",
    "chunk_manifest",
];

pub struct SyncChannelBuilder {
    config: SyncConfiguration,
    store: Option<Arc<LocalStore>>,
    transport: Option<Arc<dyn SyncTransport>>,
    bus: Option<TabBus>,
    observer: Option<Arc<dyn DatasetObserver>>,
    device: Option<DeviceProfile>,
}

impl SyncChannelBuilder {
    pub fn with_store(mut self, store: Arc<LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share a bus with sibling contexts
    pub fn with_bus(mut self, bus: TabBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DatasetObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_device(mut self, device: DeviceProfile) -> Self {
        self.device = Some(device);
        self
    }

    pub fn build(self) -> MeshResult<SyncChannel> {
        let config = self.config;
        config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(LocalStore::new(config.storage.clone())));
        let transport = match self.transport {
            Some(transport) => transport,
            None => build_transport(&config)?,
        };
        let device = self.device.unwrap_or_else(DeviceProfile::detect);
        let storage_threshold = config.storage_threshold(&device);
        let bus = self
            .bus
            .unwrap_or_else(|| TabBus::new(config.sync.broadcast_capacity));
        let (changes, _) = broadcast::channel(config.sync.broadcast_capacity.max(1));

        let channel = SyncChannel {
            context_id: generate_id(),
            node_id: config.node.node_id.clone(),
            chunker: Chunker::new(config.chunking.chunk_size)?,
            assigner: ReplicaAssigner::new(&config.chunking),
            reconciler: Reconciler::new(config.sync.loss_threshold),
            dedup: Deduplicator::new(&config.dedup),
            storage_threshold,
            store,
            transport,
            bus,
            observer: self.observer,
            changes,
            published: DashMap::new(),
            locks: DashMap::new(),
            generations: DashMap::new(),
            phases: DashMap::new(),
            metrics: RwLock::new(SyncMetrics::default()),
            config,
        };

        tracing::info!(
            context_id = %channel.context_id,
            node_id = %channel.node_id,
            transport = %channel.transport.endpoint(),
            storage_threshold = storage_threshold,
            "Sync channel ready"
        );
        Ok(channel)
    }
}

pub struct SyncChannel {
    context_id: String,
    node_id: String,
    config: SyncConfiguration,
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    reconciler: Reconciler,
    dedup: Deduplicator,
    chunker: Chunker,
    assigner: ReplicaAssigner,
    storage_threshold: usize,
    bus: TabBus,
    observer: Option<Arc<dyn DatasetObserver>>,
    changes: broadcast::Sender<DatasetChange>,
    /// Last dataset handed to in-memory consumers, per country
    published: DashMap<String, Dataset>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Successful sync rounds per country
    generations: DashMap<String, u64>,
    phases: DashMap<String, SyncPhase>,
    metrics: RwLock<SyncMetrics>,
}

impl SyncChannel {
    pub fn builder(config: SyncConfiguration) -> SyncChannelBuilder {
        SyncChannelBuilder {
            config,
            store: None,
            transport: None,
            bus: None,
            observer: None,
            device: None,
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn bus(&self) -> &TabBus {
        &self.bus
    }

    pub fn storage_threshold(&self) -> usize {
        self.storage_threshold
    }

    pub fn status(&self, country: &str) -> SyncPhase {
        self.phases.get(country).map(|p| *p).unwrap_or_default()
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.metrics.read().clone()
    }

    /// Stream of datasets published by this channel
    pub fn subscribe(&self) -> BroadcastStream<DatasetChange> {
        BroadcastStream::new(self.changes.subscribe())
    }

    /// Published dataset, else whatever is stored locally
    pub async fn load(&self, country: &str) -> MeshResult<Dataset> {
        let published = self.published.get(country).map(|d| d.value().clone());
        match published {
            Some(dataset) => Ok(dataset),
            None => self.load_local(country).await,
        }
    }

    pub async fn storage_mode(&self, country: &str) -> MeshResult<StorageMode> {
        Ok(self
            .store
            .load_metadata::<StorageMode>(&meta_key("storage_mode", country))
            .await?
            .unwrap_or_default())
    }

    fn country_lock(&self, country: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(country.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn generation(&self, country: &str) -> u64 {
        self.generations.get(country).map(|g| *g).unwrap_or(0)
    }

    fn set_phase(&self, country: &str, phase: SyncPhase) {
        self.phases.insert(country.to_string(), phase);
        tracing::Span::current().record("phase", tracing::field::display(phase));
    }

    fn notify(&self, notice: Notice) {
        tracing::warn!(country = %notice.country, level = ?notice.level, message = %notice.message, "Sync notice");
        if let Some(observer) = &self.observer {
            observer.on_notice(&notice);
        }
    }

    fn surface(&self, country: &str, report: &WriteReport) {
        if let Some(warning) = report.warning() {
            self.notify(Notice::warning(country, warning));
        }
    }

    fn publish(&self, country: &str, dataset: Dataset, origin: ChangeOrigin) {
        self.published.insert(country.to_string(), dataset.clone());
        if origin != ChangeOrigin::Local {
            if let Some(observer) = &self.observer {
                observer.on_remote_change(country, &dataset);
            }
        }
        self.changes
            .send(DatasetChange {
                country: country.to_string(),
                dataset,
                origin,
            })
            .ok();
    }

    /// Apply a local mutation to the published copy, if one exists
    fn mutate_published(&self, country: &str, mutate: impl FnOnce(&mut Dataset)) {
        let updated = self.published.get_mut(country).map(|mut dataset| {
            mutate(dataset.value_mut());
            dataset.value().clone()
        });
        if let Some(dataset) = updated {
            self.publish(country, dataset, ChangeOrigin::Local);
        }
    }

    /// Local view of a country. Chunked countries yield the verified records
    /// this node holds plus the pending records and threads of the shell.
    async fn load_local(&self, country: &str) -> MeshResult<Dataset> {
        let stored = self.store.load_data(country).await?;
        if self.storage_mode(country).await? == StorageMode::Full {
            return Ok(stored);
        }

        let mut dataset = Dataset::empty();
        for chunk in self.store.load_chunks(country).await? {
            match chunk.verify() {
                Ok(()) => {
                    for record in chunk.records {
                        dataset.insert_record_if_absent(record);
                    }
                }
                // left in place; the next successful round rewrites held chunks
                Err(e) => log_integrity_check(country, &chunk.id, false, Some(&e.to_string())),
            }
        }
        merge_records_by_id(&mut dataset, &stored);
        Ok(dataset)
    }

    // ---- sync round ----

    /// Push local changes, pull the authority's view and reconcile them
    pub async fn sync(&self, country: &str) -> MeshResult<Dataset> {
        let span = sync_span(country, &self.context_id);
        self.sync_single_flight(country).instrument(span).await
    }

    async fn sync_single_flight(&self, country: &str) -> MeshResult<Dataset> {
        let observed = self.generation(country);
        let lock = self.country_lock(country);
        let _guard = lock.lock().await;

        if self.generation(country) != observed {
            let published = self.published.get(country).map(|d| d.value().clone());
            if let Some(dataset) = published {
                tracing::Span::current().record("coalesced", true);
                self.metrics.write().coalesced_syncs += 1;
                tracing::debug!(country = country, "Coalesced into completed sync round");
                return Ok(dataset);
            }
        }

        let started = Instant::now();
        let result = self.run_round(country).await;
        self.metrics.write().record(started.elapsed(), result.is_ok());

        if let Err(e) = &result {
            self.set_phase(country, SyncPhase::Idle);
            self.notify(Notice::error(country, format!("Sync failed: {}", e)));
        }
        result
    }

    async fn transport_sync(&self, request: SyncRequest) -> MeshResult<super::SyncResponse> {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, self.transport.sync(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(NetworkError::RequestTimeout {
                endpoint: self.transport.endpoint(),
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    async fn run_round(&self, country: &str) -> MeshResult<Dataset> {
        self.set_phase(country, SyncPhase::Syncing);
        let local = self.load_local(country).await?;
        let since = self
            .store
            .load_metadata::<u64>(&meta_key("last_sync", country))
            .await?
            .unwrap_or(0);

        let response = self
            .transport_sync(SyncRequest {
                country: country.to_string(),
                client_dataset: local.clone(),
                since_timestamp: since,
                node_id: Some(self.node_id.clone()),
            })
            .await?;

        self.set_phase(country, SyncPhase::Merging);
        let outcome = self.reconciler.merge(&local, &response.dataset);
        let mut merged = outcome.dataset;
        let report = self.dedup.clean_country_data(&mut merged);
        log_merge_decision(
            country,
            outcome.branch.as_str(),
            outcome.local_count,
            outcome.remote_count,
            merged.record_count(),
            outcome.loss_ratio,
        );
        if report.changed() {
            tracing::debug!(
                country = country,
                records_removed = report.records_removed,
                threads_removed = report.threads_removed,
                "Removed duplicates after merge"
            );
        }
        if outcome.branch == MergeBranch::LossGuard {
            self.metrics.write().loss_guard_merges += 1;
            self.notify(Notice::warning(
                country,
                format!(
                    "Server returned {} of {} records; keeping local data",
                    outcome.remote_count, outcome.local_count
                ),
            ));
        }

        self.set_phase(country, SyncPhase::Persisting);
        let remote_ids = response.dataset.record_ids();
        let (mode, held, root) = self.persist(country, &merged, &remote_ids).await?;
        let cursor = if response.server_timestamp > 0 {
            response.server_timestamp
        } else {
            merged.last_update
        };
        self.store
            .save_metadata(&meta_key("last_sync", country), &cursor)
            .await?;

        self.set_phase(country, SyncPhase::BroadcastingLocally);
        self.publish(country, merged.clone(), ChangeOrigin::Remote);
        self.bus.publish(
            &self.context_id,
            TabMessage::DataUpdated {
                country: country.to_string(),
                dataset: merged.clone(),
            },
        );
        if self.config.sync.announce {
            self.spawn_announce(country, held, merged.record_count(), root);
        }

        *self.generations.entry(country.to_string()).or_insert(0) += 1;
        self.set_phase(country, SyncPhase::Idle);

        let span = tracing::Span::current();
        span.record("records", merged.record_count());
        span.record("storage_mode", mode.as_str());
        crate::sync_info!(
            country = country,
            records = merged.record_count(),
            branch = outcome.branch.as_str(),
            mode = mode.as_str(),
            "Sync round completed"
        );
        Ok(merged)
    }

    /// Storage planner. Returns the chosen mode, the chunk ids now held and the Merkle root.
    async fn persist(
        &self,
        country: &str,
        dataset: &Dataset,
        remote_ids: &HashSet<&str>,
    ) -> MeshResult<(StorageMode, Vec<String>, Option<String>)> {
        let records = dataset.record_count();

        if records < self.storage_threshold {
            log_storage_mode(country, StorageMode::Full.as_str(), records, self.storage_threshold);
            let report = self.store.save_data(country, dataset).await?;
            self.surface(country, &report);
            self.store
                .save_metadata(&meta_key("storage_mode", country), &StorageMode::Full)
                .await?;
            for id in self.store.list_chunk_ids(country).await? {
                self.store.delete_chunk(country, &id).await?;
            }
            for kind in DISTRIBUTED_METADATA {
                self.store.delete_metadata(&meta_key(kind, country)).await?;
            }
            return Ok((StorageMode::Full, Vec::new(), None));
        }

        log_storage_mode(country, StorageMode::Distributed.as_str(), records, self.storage_threshold);
        let (chunks, root) = self.chunker.chunk_with_root(&dataset.records);
        let assigned = self.assigner.assign_chunks_to_client(&chunks, &self.node_id);
        let held: Vec<String> = assigned.iter().map(|a| a.chunk.id.clone()).collect();
        let keep: BTreeSet<&str> = held.iter().map(String::as_str).collect();

        for id in self.store.list_chunk_ids(country).await? {
            if !keep.contains(id.as_str()) {
                self.store.delete_chunk(country, &id).await?;
            }
        }
        for assignment in &assigned {
            let report = self.store.save_chunk(country, &assignment.chunk).await?;
            self.surface(country, &report);
        }

        let index: Vec<RecordIndexEntry> = dataset.records.iter().map(RecordIndexEntry::from).collect();
        let manifest: Vec<ChunkDescriptor> = chunks.iter().map(Chunk::descriptor).collect();
        self.store.save_metadata(&meta_key("merkle_root", country), &root).await?;
        self.store
            .save_metadata(&meta_key("storage_mode", country), &StorageMode::Distributed)
            .await?;
        self.store.save_metadata(&meta_key("total_chunks", country), &chunks.len()).await?;
        self.store.save_metadata(&meta_key("total_records", country), &records).await?;
        self.store.save_metadata(&meta_key("my_chunks", country), &held).await?;
        self.store.save_metadata(&meta_key("record_index", country), &index).await?;
        self.store.save_metadata(&meta_key("chunk_manifest", country), &manifest).await?;

        // shell: threads for every record, records only while the authority lacks them
        let shell = Dataset {
            records: dataset
                .records
                .iter()
                .filter(|r| !remote_ids.contains(r.id.as_str()))
                .cloned()
                .collect(),
            threads: dataset.threads.clone(),
            last_update: dataset.last_update,
        };
        let report = self.store.save_data(country, &shell).await?;
        self.surface(country, &report);

        tracing::debug!(
            country = country,
            total_chunks = chunks.len(),
            held_chunks = held.len(),
            pending_records = shell.record_count(),
            "Persisted distributed dataset"
        );
        Ok((StorageMode::Distributed, held, root))
    }

    fn spawn_announce(&self, country: &str, chunk_ids: Vec<String>, record_count: usize, merkle_root: Option<String>) {
        let transport = Arc::clone(&self.transport);
        let announcement = Announcement {
            node_id: self.node_id.clone(),
            country: country.to_string(),
            chunk_ids,
            record_count,
            merkle_root,
        };
        tokio::spawn(
            async move {
                match transport.announce(announcement).await {
                    Ok(ack) => tracing::debug!(accepted = ack.accepted, "Announced held chunks"),
                    Err(e) => tracing::debug!(error = %e, "Announce failed"),
                }
            }
            .in_current_span(),
        );
    }

    /// Sync `country` every `interval` until the task is aborted
    pub fn spawn_periodic(self: &Arc<Self>, country: &str, interval: Duration) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        let country = country.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = channel.sync(&country).await {
                    if is_recoverable_error(&e) {
                        tracing::debug!(country = %country, error = %e, "Periodic sync failed, retrying next tick");
                    } else {
                        crate::mesh_error!(country = %country, error = %e, severity = %get_error_severity(&e), "Periodic sync failed");
                    }
                }
            }
        })
    }

    // ---- local mutations ----

    /// Insert a record created on this device. Returns false when its id or
    /// its content duplicates a record already present.
    pub async fn submit_record(&self, country: &str, record: Record) -> MeshResult<bool> {
        let lock = self.country_lock(country);
        let _guard = lock.lock().await;

        let view = self.load_local(country).await?;
        if view.contains_record(&record.id)
            || view.records.iter().any(|r| self.dedup.are_identical(r, &record))
        {
            tracing::debug!(country = country, record_id = %record.id, "Duplicate submission ignored");
            return Ok(false);
        }

        let now = current_timestamp_ms();
        let mut stored = self.store.load_data(country).await?;
        stored.insert_record_if_absent(record.clone());
        stored.touch(now);
        let report = self.store.save_data(country, &stored).await?;
        self.surface(country, &report);

        self.mutate_published(country, |dataset| {
            apply_new_record(dataset, record.clone());
            dataset.touch(now);
        });
        self.bus.publish(
            &self.context_id,
            TabMessage::NewRecord {
                country: country.to_string(),
                record,
            },
        );
        Ok(true)
    }

    /// Record as held locally, or its comment cooldown when only the index knows it
    async fn known_record(&self, country: &str, record_id: &str) -> MeshResult<(Option<Record>, Duration)> {
        let view = self.load_local(country).await?;
        if let Some(record) = view.record(record_id) {
            return Ok((Some(record.clone()), record.comment_cooldown()));
        }
        let indexed = self
            .store
            .load_metadata::<Vec<RecordIndexEntry>>(&meta_key("record_index", country))
            .await?
            .map_or(false, |index| index.iter().any(|e| e.id == record_id));
        if indexed {
            return Ok((None, crate::model::DEFAULT_COMMENT_COOLDOWN));
        }
        Err(MeshError::UnknownRecord {
            country: country.to_string(),
            record_id: record_id.to_string(),
        })
    }

    /// Append a comment, at most one per author and record within the record's cooldown
    pub async fn add_comment(
        &self,
        country: &str,
        record_id: &str,
        author: &str,
        text: impl Into<String>,
    ) -> MeshResult<Comment> {
        let lock = self.country_lock(country);
        let _guard = lock.lock().await;

        let (_, cooldown) = self.known_record(country, record_id).await?;
        let cooldown_key = format!("last_comment_{}_{}", record_id, author);
        let now = current_timestamp_ms();
        if let Some(last) = self.store.load_metadata::<u64>(&cooldown_key).await? {
            let cooldown_ms = cooldown.as_millis() as u64;
            let elapsed = now.saturating_sub(last);
            if elapsed < cooldown_ms {
                return Err(MeshError::CommentCooldown {
                    record_id: record_id.to_string(),
                    remaining_ms: cooldown_ms - elapsed,
                });
            }
        }

        let comment = Comment {
            id: generate_id(),
            text: text.into(),
            author: Some(author.to_string()),
            created_at: now,
        };
        let mut stored = self.store.load_data(country).await?;
        stored.thread_mut(record_id).push_comment(comment.clone());
        stored.touch(now);
        let report = self.store.save_data(country, &stored).await?;
        self.surface(country, &report);
        self.store.save_metadata(&cooldown_key, &now).await?;

        let thread = stored.thread_mut(record_id).clone();
        self.mutate_published(country, |dataset| apply_thread(dataset, record_id, &thread));
        self.bus.publish(
            &self.context_id,
            TabMessage::NewComment {
                country: country.to_string(),
                record_id: record_id.to_string(),
                thread,
            },
        );
        Ok(comment)
    }

    pub async fn record_vote(&self, country: &str, record_id: &str, kind: VoteKind) -> MeshResult<Votes> {
        let lock = self.country_lock(country);
        let _guard = lock.lock().await;

        self.known_record(country, record_id).await?;
        let mut stored = self.store.load_data(country).await?;
        let votes = {
            let thread = stored.thread_mut(record_id);
            thread.votes.record(kind);
            thread.votes
        };
        stored.touch(current_timestamp_ms());
        let report = self.store.save_data(country, &stored).await?;
        self.surface(country, &report);

        self.mutate_published(country, |dataset| apply_votes(dataset, record_id, votes));
        self.bus.publish(
            &self.context_id,
            TabMessage::NewVote {
                country: country.to_string(),
                record_id: record_id.to_string(),
                votes,
            },
        );
        Ok(votes)
    }

    /// Vote for a new value of an editable field. Returns the leading value
    /// once it has enough votes.
    pub async fn propose_field(
        &self,
        country: &str,
        record_id: &str,
        field: &str,
        value: &str,
    ) -> MeshResult<Option<(String, u32)>> {
        let lock = self.country_lock(country);
        let _guard = lock.lock().await;

        let editable = match self.known_record(country, record_id).await? {
            (Some(record), _) => record.is_editable(field),
            (None, _) => false,
        };
        if !editable {
            return Err(MeshError::FieldNotEditable {
                record_id: record_id.to_string(),
                field: field.to_string(),
            });
        }

        let mut stored = self.store.load_data(country).await?;
        let thread = {
            let thread = stored.thread_mut(record_id);
            thread.propose_field(field, value);
            thread.clone()
        };
        stored.touch(current_timestamp_ms());
        let report = self.store.save_data(country, &stored).await?;
        self.surface(country, &report);

        let leading = thread
            .leading_proposal(field, MIN_PROPOSAL_VOTES)
            .map(|(value, votes)| (value.to_string(), votes));
        self.mutate_published(country, |dataset| apply_thread(dataset, record_id, &thread));
        self.bus.publish(
            &self.context_id,
            TabMessage::NewComment {
                country: country.to_string(),
                record_id: record_id.to_string(),
                thread,
            },
        );
        Ok(leading)
    }

    // ---- sibling contexts ----

    /// Fold a sibling's message into this context. Returns true when anything changed.
    pub async fn apply_tab_message(&self, envelope: TabEnvelope) -> MeshResult<bool> {
        if envelope.origin == self.context_id {
            return Ok(false);
        }
        let country = envelope.message.country().to_string();

        if let TabMessage::RequestSync { .. } = &envelope.message {
            let published = self.published.get(&country).map(|d| d.value().clone());
            if let Some(dataset) = published {
                self.bus.publish(&self.context_id, TabMessage::DataUpdated { country, dataset });
            }
            return Ok(false);
        }

        let lock = self.country_lock(&country);
        let _guard = lock.lock().await;

        let published = self.published.get(&country).map(|d| d.value().clone());
        let mut view = match published {
            Some(dataset) => dataset,
            None => self.load_local(&country).await?,
        };
        let mut stored = self.store.load_data(&country).await?;

        match &envelope.message {
            TabMessage::DataUpdated { dataset, .. } => {
                merge_records_by_id(&mut view, dataset);
            }
            TabMessage::NewRecord { record, .. } => {
                apply_new_record(&mut view, record.clone());
                apply_new_record(&mut stored, record.clone());
            }
            TabMessage::NewComment { record_id, thread, .. } => {
                apply_thread(&mut view, record_id, thread);
                apply_thread(&mut stored, record_id, thread);
            }
            TabMessage::NewVote { record_id, votes, .. } => {
                apply_votes(&mut view, record_id, *votes);
                apply_votes(&mut stored, record_id, *votes);
            }
            TabMessage::RequestSync { .. } => {}
        }

        // the sibling already persisted its own sync result
        if !matches!(envelope.message, TabMessage::DataUpdated { .. }) {
            stored.touch(envelope.timestamp);
            let report = self.store.save_data(&country, &stored).await?;
            self.surface(&country, &report);
        }

        tracing::debug!(
            country = %country,
            origin = %envelope.origin,
            kind = envelope.message.kind(),
            "Applied sibling message"
        );
        self.publish(&country, view, ChangeOrigin::Sibling);
        Ok(true)
    }

    /// Apply sibling messages until the bus closes. A lagging receiver asks
    /// siblings for their current datasets.
    pub fn spawn_tab_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut receiver = self.bus.subscribe();
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if let Err(e) = channel.apply_tab_message(envelope).await {
                            tracing::warn!(error = %e, "Failed to apply sibling message");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "Tab listener lagged, requesting resync");
                        let countries: Vec<String> =
                            channel.published.iter().map(|e| e.key().clone()).collect();
                        for country in countries {
                            channel
                                .bus
                                .publish(&channel.context_id, TabMessage::RequestSync { country });
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ---- reconstruction ----

    /// Rebuild a country from verified local chunks and chunks pulled from
    /// peers or the authority, then check the result against the stored Merkle root.
    pub async fn reconstruct(&self, country: &str) -> MeshResult<Reconstruction> {
        let span = reconstruct_span(country);
        async {
            let lock = self.country_lock(country);
            let _guard = lock.lock().await;
            self.reconstruct_locked(country).await
        }
        .instrument(span)
        .await
    }

    async fn reconstruct_locked(&self, country: &str) -> MeshResult<Reconstruction> {
        if self.storage_mode(country).await? == StorageMode::Full {
            let dataset = self.store.load_data(country).await?;
            return Ok(Reconstruction::whole(dataset, false));
        }

        let perf = PerformanceLogger::start("reconstruct");
        let manifest = match self
            .store
            .load_metadata::<Vec<ChunkDescriptor>>(&meta_key("chunk_manifest", country))
            .await?
        {
            Some(manifest) if !manifest.is_empty() => manifest,
            _ => match self.transport.list_chunks(country).await {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(country = country, error = %e, "No chunk manifest available");
                    Vec::new()
                }
            },
        };

        let mut local: HashMap<String, Chunk> = HashMap::new();
        for chunk in self.store.load_chunks(country).await? {
            match chunk.verify() {
                Ok(()) => {
                    local.insert(chunk.hash.clone(), chunk);
                }
                Err(e) => {
                    log_integrity_check(country, &chunk.id, false, Some(&e.to_string()));
                    self.store.delete_chunk(country, &chunk.id).await?;
                }
            }
        }
        perf.log_milestone("local_chunks_verified");

        let mut chunks = Vec::with_capacity(manifest.len());
        let mut missing = Vec::new();
        let (mut local_chunks, mut pulled_chunks) = (0, 0);
        for descriptor in &manifest {
            if let Some(chunk) = local.remove(&descriptor.hash) {
                chunks.push(chunk);
                local_chunks += 1;
                continue;
            }
            match self.pull_verified(country, descriptor).await {
                Ok(chunk) => {
                    chunks.push(chunk);
                    pulled_chunks += 1;
                }
                Err(e) => {
                    tracing::debug!(country = country, chunk_id = %descriptor.id, error = %e, "Chunk unavailable");
                    missing.push(descriptor.id.clone());
                }
            }
        }
        chunks.sort_by_key(|c| c.index);
        perf.log_milestone("chunks_collected");

        let shell = self.store.load_data(country).await?;
        let mut dataset = Dataset::empty();
        for chunk in &chunks {
            for record in &chunk.records {
                dataset.insert_record_if_absent(record.clone());
            }
        }
        merge_records_by_id(&mut dataset, &shell);

        let span = tracing::Span::current();
        span.record("local_chunks", local_chunks);
        span.record("pulled_chunks", pulled_chunks);

        if !missing.is_empty() {
            span.record("verified", false);
            perf.finish();
            tracing::warn!(country = country, missing = missing.len(), "Partial reconstruction");
            return Ok(Reconstruction {
                dataset,
                complete: false,
                verified: false,
                refreshed: false,
                local_chunks,
                pulled_chunks,
                missing,
            });
        }

        let expected = self
            .store
            .load_metadata::<Option<String>>(&meta_key("merkle_root", country))
            .await?
            .flatten();
        let actual = build_merkle_tree(&chunks);

        match expected {
            Some(expected) if Some(&expected) != actual.as_ref() => {
                let actual = actual.unwrap_or_default();
                log_integrity_check(
                    country,
                    "merkle_root",
                    false,
                    Some(&format!("expected {} got {}", expected, actual)),
                );
                perf.finish();
                match self.fetch_fresh(country).await {
                    Ok(dataset) => Ok(Reconstruction::whole(dataset, true)),
                    Err(e) => {
                        tracing::error!(country = country, error = %e, "Fresh fetch after Merkle mismatch failed");
                        Err(IntegrityError::MerkleRootMismatch {
                            country: country.to_string(),
                            expected,
                            actual,
                        }
                        .into())
                    }
                }
            }
            expected => {
                let verified = expected.is_some();
                log_integrity_check(country, "merkle_root", verified, None);
                span.record("verified", verified);
                perf.finish();
                Ok(Reconstruction {
                    dataset,
                    complete: true,
                    verified,
                    refreshed: false,
                    local_chunks,
                    pulled_chunks,
                    missing,
                })
            }
        }
    }

    /// Pull a chunk and reject it unless its records hash to the requested hash
    async fn pull_verified(&self, country: &str, descriptor: &ChunkDescriptor) -> MeshResult<Chunk> {
        let timeout = self.config.request_timeout();
        let payload = tokio::time::timeout(timeout, self.transport.pull_chunk(country, &descriptor.hash))
            .await
            .map_err(|_| NetworkError::RequestTimeout {
                endpoint: self.transport.endpoint(),
                timeout_ms: timeout.as_millis() as u64,
            })??;

        let actual = hash_records(&payload.chunk.records);
        if actual != descriptor.hash {
            log_integrity_check(country, &descriptor.id, false, Some("pulled chunk hash mismatch"));
            return Err(IntegrityError::ChunkHashMismatch {
                chunk_id: descriptor.id.clone(),
                expected: descriptor.hash.clone(),
                actual,
            }
            .into());
        }
        Ok(payload.chunk)
    }

    /// Discard local chunk data and rebuild from the authority. Caller holds the country lock.
    async fn fetch_fresh(&self, country: &str) -> MeshResult<Dataset> {
        tracing::warn!(country = country, "Refetching dataset from authority");
        let shell = self.store.load_data(country).await?;
        let response = self
            .transport_sync(SyncRequest {
                country: country.to_string(),
                client_dataset: shell.clone(),
                since_timestamp: 0,
                node_id: Some(self.node_id.clone()),
            })
            .await?;

        let outcome = self.reconciler.merge(&shell, &response.dataset);
        let mut dataset = outcome.dataset;
        self.dedup.clean_country_data(&mut dataset);

        let remote_ids = response.dataset.record_ids();
        let (_, held, root) = self.persist(country, &dataset, &remote_ids).await?;
        if response.server_timestamp > 0 {
            self.store
                .save_metadata(&meta_key("last_sync", country), &response.server_timestamp)
                .await?;
        }
        if self.config.sync.announce {
            self.spawn_announce(country, held, dataset.record_count(), root);
        }

        self.publish(country, dataset.clone(), ChangeOrigin::Remote);
        *self.generations.entry(country.to_string()).or_insert(0) += 1;
        Ok(dataset)
    }
}
