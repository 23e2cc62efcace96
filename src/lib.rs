//! # meshstore
//!
//! Offline-first replication core for country-partitioned report datasets.
//! A node keeps a local copy of each country it follows, reconciles it with a
//! central authority when the network allows, and splits large datasets into
//! content-addressed chunks of which it persists only a deterministic subset.
//!
//! ## Features
//!
//! - Durable local store with a bounded in-memory fallback tier
//! - Deterministic chunking with BLAKE3 content hashes and a SHA-256 Merkle root
//! - Replica assignment that spreads chunks across nodes without coordination
//! - Loss-guarded merge that never drops records either side holds
//! - Fuzzy duplicate detection over descriptive fields
//! - Single-flight sync per country with cross-context propagation
//!
//! ## Architecture
//!
//! - **Store**: [`store::LocalStore`] writes through a primary sled tier and a fallback mirror
//! - **Chunking**: [`chunking::Chunker`] and [`chunking::build_merkle_tree`]
//! - **Replica**: [`replica::ReplicaAssigner`] picks the chunks this node holds
//! - **Reconcile**: [`reconcile::Reconciler`] and [`reconcile::Deduplicator`]
//! - **Sync**: [`sync::SyncChannel`] drives a sync round over a [`sync::SyncTransport`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshstore::{config::ConfigBuilder, logging, sync::SyncChannel};
//!
//! #[tokio::main]
//! async fn main() -> eyre::Result<()> {
//!     logging::init_logging()?;
//!
//!     let config = ConfigBuilder::new().authority_url("http://127.0.0.1:8080").build()?;
//!     let channel = SyncChannel::builder(config).build()?;
//!     let dataset = channel.sync("peru").await?;
//!     println!("{} records", dataset.record_count());
//!     Ok(())
//! }
//! ```

pub mod chunking;
pub mod config;
pub mod errors;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod replica;
pub mod store;
pub mod sync;

// Re-export commonly used types and functions
pub use errors::{
    ConfigurationError, ErrorSeverity, IntegrityError, MeshError, MeshResult,
    NetworkError, StoreError,
};

pub use logging::{
    init_logging, log_integrity_check, log_merge_decision, reconstruct_span, store_span,
    sync_span, PerformanceLogger,
};

pub use chunking::{build_merkle_tree, Chunk, Chunker};
pub use config::{ConfigBuilder, DeviceProfile, SyncConfiguration};
pub use model::{Comment, Dataset, Record, Thread};
pub use reconcile::{Deduplicator, MergeOutcome, Reconciler};
pub use replica::ReplicaAssigner;
pub use store::LocalStore;
pub use sync::{SyncChannel, SyncTransport};

// Version and build information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");
pub const BUILD_PROFILE: &str = env!("BUILD_PROFILE");

/// Utility functions and helpers
pub mod utils {
    /// Convert bytes to human-readable size
    pub fn format_bytes(bytes: usize) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", bytes, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }

    /// Fresh identifier for records, comments and sync contexts
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Get current timestamp in milliseconds
    pub fn current_timestamp_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

}

// Re-export key dependencies for convenience
pub use eyre;
pub use tokio;
pub use tracing;
