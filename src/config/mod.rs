//! Configuration management for meshstore
//!
//! This module provides:
//! - Node, storage, chunking, sync, transport, dedup and logging settings
//! - TOML files layered with `MESHSTORE__*` environment overrides
//! - Flat `MESHSTORE_*` environment loading (with `.env` support)
//! - Validation and a builder for programmatic setup

pub mod device;

pub use device::DeviceProfile;

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Descriptive fields compared by the deduplicator, in comparison order
pub const DEFAULT_DEDUP_FIELDS: &[&str] = &[
    "nombres",
    "apellidos",
    "departamento",
    "distrito",
    "edad",
    "ocupacion",
    "foto",
    "instagram",
    "ets",
    "tiempoRelacion",
    "periodoInfidelidad",
    "datosAdicionales",
];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfiguration {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    pub sync: SyncSettings,
    pub transport: TransportConfig,
    pub dedup: DedupConfig,
    pub logging: LoggingConfig,
}

/// Identity of this node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node identifier used for replica assignment
    pub node_id: String,
}

/// Local store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the persistent store; a temporary store is used when unset
    pub path: Option<String>,
    /// Byte budget of the in-memory fallback tier
    pub fallback_capacity_bytes: usize,
    /// Datasets untouched for longer than this are garbage-collected
    pub max_data_age_days: u64,
}

/// Chunking and replica assignment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Records per chunk
    pub chunk_size: usize,
    /// Upper bound of chunks a node persists.
    ///
    /// Each chunk is expected on `nodes * max_local_chunks / chunks` nodes.
    /// Full coverage needs that at or above `replication_factor`: 20 nodes over
    /// 60 chunks need at least 9 here.
    pub max_local_chunks: usize,
    /// Virtual slots per node
    pub replication_factor: usize,
    /// Datasets with at most this many chunks are fully replicated
    pub full_replication_max: usize,
}

/// Sync channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub authority_url: String,
    pub request_timeout_ms: u64,
    pub sync_interval_secs: u64,
    /// Fraction of local records the remote may lack before the loss guard engages
    pub loss_threshold: f64,
    /// Record count above which chunked storage is used; device-adaptive when unset
    pub storage_threshold: Option<usize>,
    /// Announce held chunks after every successful sync
    pub announce: bool,
    /// Capacity of the cross-context broadcast channel
    pub broadcast_capacity: usize,
}

/// Transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Authority only
    ServerOnly,
    /// Authority for sync, peers first for chunk pulls
    PeerAssisted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
    pub peer_urls: Vec<String>,
}

/// Duplicate detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub fields: Vec<String>,
    /// Records differing in at most this many fields are duplicates
    pub max_mismatches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            fallback_capacity_bytes: 5 * 1024 * 1024,
            max_data_age_days: 30,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            max_local_chunks: 10,
            replication_factor: 3,
            full_replication_max: 10,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            authority_url: "http://127.0.0.1:8080".to_string(),
            request_timeout_ms: 8_000,
            sync_interval_secs: 30,
            loss_threshold: 0.10,
            storage_threshold: None,
            announce: true,
            broadcast_capacity: 256,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::ServerOnly,
            peer_urls: Vec::new(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fields: DEFAULT_DEDUP_FIELDS.iter().map(|f| f.to_string()).collect(),
            max_mismatches: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl SyncConfiguration {
    /// Load configuration from a TOML file, then apply `MESHSTORE__SECTION__KEY` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigurationError::FileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("MESHSTORE").separator("__"))
            .build()
            .map_err(|e| ConfigurationError::ParsingFailed {
                reason: e.to_string(),
            })?;

        let config: Self =
            settings
                .try_deserialize()
                .map_err(|e| ConfigurationError::ParsingFailed {
                    reason: e.to_string(),
                })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigurationError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigurationError::ParsingFailed {
                reason: e.to_string(),
            })?;
        std::fs::write(&path, content).map_err(|_| ConfigurationError::FileNotFound {
            path: path.as_ref().to_string_lossy().to_string(),
        })?;
        Ok(())
    }

    /// Load from `MESHSTORE_*` environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigurationError> {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Ok(id) = std::env::var("MESHSTORE_NODE_ID") {
            config.node.node_id = id;
        }

        if let Ok(path) = std::env::var("MESHSTORE_DATA_DIR") {
            config.storage.path = Some(path);
        }

        if let Ok(url) = std::env::var("MESHSTORE_AUTHORITY_URL") {
            config.sync.authority_url = url;
        }

        if let Ok(timeout) = std::env::var("MESHSTORE_REQUEST_TIMEOUT_MS") {
            config.sync.request_timeout_ms = parse_env("MESHSTORE_REQUEST_TIMEOUT_MS", &timeout)?;
        }

        if let Ok(threshold) = std::env::var("MESHSTORE_STORAGE_THRESHOLD") {
            config.sync.storage_threshold =
                Some(parse_env("MESHSTORE_STORAGE_THRESHOLD", &threshold)?);
        }

        if let Ok(peers) = std::env::var("MESHSTORE_PEERS") {
            config.transport.peer_urls = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if !config.transport.peer_urls.is_empty() {
                config.transport.mode = TransportMode::PeerAssisted;
            }
        }

        if let Ok(level) = std::env::var("MESHSTORE_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.node.node_id.trim().is_empty() {
            return Err(ConfigurationError::MissingRequired {
                key: "node.node_id".to_string(),
            });
        }

        if self.chunking.chunk_size == 0 {
            return Err(invalid("chunking.chunk_size", "0", "Must be at least 1"));
        }

        if self.chunking.max_local_chunks == 0 {
            return Err(invalid("chunking.max_local_chunks", "0", "Must be at least 1"));
        }

        if self.chunking.replication_factor == 0 {
            return Err(invalid("chunking.replication_factor", "0", "Must be at least 1"));
        }

        if !(0.0..1.0).contains(&self.sync.loss_threshold) {
            return Err(invalid(
                "sync.loss_threshold",
                &self.sync.loss_threshold.to_string(),
                "Must be in [0.0, 1.0)",
            ));
        }

        if self.sync.request_timeout_ms == 0 {
            return Err(invalid("sync.request_timeout_ms", "0", "Must be positive"));
        }

        if self.sync.broadcast_capacity == 0 {
            return Err(invalid("sync.broadcast_capacity", "0", "Must be positive"));
        }

        if self.transport.mode == TransportMode::PeerAssisted && self.transport.peer_urls.is_empty() {
            return Err(ConfigurationError::MissingRequired {
                key: "transport.peer_urls".to_string(),
            });
        }

        if self.dedup.fields.is_empty() {
            return Err(ConfigurationError::MissingRequired {
                key: "dedup.fields".to_string(),
            });
        }

        Ok(())
    }

    /// Record count above which a country switches to chunked storage
    pub fn storage_threshold(&self, device: &DeviceProfile) -> usize {
        self.sync
            .storage_threshold
            .unwrap_or_else(|| device.storage_threshold())
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sync.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync.sync_interval_secs)
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigurationError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigurationError::EnvironmentVariable {
            var: var.to_string(),
            error: e.to_string(),
        })
}

/// Configuration builder for easier setup
pub struct ConfigBuilder {
    config: SyncConfiguration,
}

impl ConfigBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: SyncConfiguration::default(),
        }
    }

    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node.node_id = id.into();
        self
    }

    pub fn storage_path(mut self, path: impl Into<String>) -> Self {
        self.config.storage.path = Some(path.into());
        self
    }

    pub fn authority_url(mut self, url: impl Into<String>) -> Self {
        self.config.sync.authority_url = url.into();
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunking.chunk_size = size;
        self
    }

    pub fn max_local_chunks(mut self, max: usize) -> Self {
        self.config.chunking.max_local_chunks = max;
        self
    }

    pub fn storage_threshold(mut self, threshold: usize) -> Self {
        self.config.sync.storage_threshold = Some(threshold);
        self
    }

    pub fn request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.sync.request_timeout_ms = timeout_ms;
        self
    }

    pub fn announce(mut self, enabled: bool) -> Self {
        self.config.sync.announce = enabled;
        self
    }

    pub fn peers(mut self, peers: Vec<String>) -> Self {
        self.config.transport.mode = TransportMode::PeerAssisted;
        self.config.transport.peer_urls = peers;
        self
    }

    pub fn fallback_capacity_bytes(mut self, bytes: usize) -> Self {
        self.config.storage.fallback_capacity_bytes = bytes;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<SyncConfiguration, ConfigurationError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
