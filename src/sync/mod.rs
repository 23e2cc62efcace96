//! Sync Channel
//!
//! Orchestrates one country's sync round: load local, push and pull through a
//! [`SyncTransport`], reconcile, deduplicate, plan storage, persist, publish to
//! in-memory consumers, then tell sibling contexts and peers.

pub mod authority;
pub mod channel;
pub mod tab;
pub mod transport;

pub use authority::InMemoryAuthority;
pub use channel::{Reconstruction, StorageMode, SyncChannel, SyncChannelBuilder};
pub use tab::{TabBus, TabEnvelope, TabMessage};
pub use transport::{
    build_transport, AnnounceAck, Announcement, ChunkPayload, HttpTransport,
    PeerAssistedTransport, SyncRequest, SyncResponse, SyncTransport,
};

use crate::model::Dataset;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a country's sync round currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    Merging,
    Persisting,
    BroadcastingLocally,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Merging => "merging",
            SyncPhase::Persisting => "persisting",
            SyncPhase::BroadcastingLocally => "broadcasting_locally",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Non-blocking message for the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub country: String,
    pub message: String,
}

impl Notice {
    pub fn warning(country: &str, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            country: country.to_string(),
            message: message.into(),
        }
    }

    pub fn error(country: &str, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            country: country.to_string(),
            message: message.into(),
        }
    }
}

/// Consumer of published datasets, typically the UI layer
pub trait DatasetObserver: Send + Sync {
    fn on_remote_change(&self, country: &str, dataset: &Dataset);

    fn on_notice(&self, _notice: &Notice) {}
}

/// Published on the channel's change stream after every successful sync
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetChange {
    pub country: String,
    pub dataset: Dataset,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Result of a sync round with the authority
    Remote,
    /// Applied from a sibling context
    Sibling,
    /// Mutation made through this channel
    Local,
}

/// Sync metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncMetrics {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub coalesced_syncs: u64,
    pub loss_guard_merges: u64,
    pub last_sync_duration_ms: u64,
    pub avg_sync_time_ms: f64,
}

impl SyncMetrics {
    fn record(&mut self, duration: Duration, success: bool) {
        self.total_syncs += 1;
        if success {
            self.successful_syncs += 1;
        } else {
            self.failed_syncs += 1;
        }

        let duration_ms = duration.as_millis() as u64;
        self.last_sync_duration_ms = duration_ms;

        // Update average
        let n = self.total_syncs as f64;
        self.avg_sync_time_ms = (self.avg_sync_time_ms * (n - 1.0) + duration_ms as f64) / n;
    }
}
