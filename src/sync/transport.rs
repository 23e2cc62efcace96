//! Transports between a node and the sync authority or its peers.
//!
//! Every transport speaks the same four operations: bidirectional dataset
//! sync, chunk announcement, chunk listing and chunk pull. Which transport a
//! node uses is a configuration decision.

use crate::chunking::{Chunk, ChunkDescriptor};
use crate::config::{SyncConfiguration, TransportMode};
use crate::errors::{ConfigurationError, NetworkError, NetworkResult};
use crate::model::Dataset;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Push local dataset, pull the authority's view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub country: String,
    pub client_dataset: Dataset,
    pub since_timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default, deserialize_with = "crate::model::null_as_default")]
    pub dataset: Dataset,
    #[serde(default, deserialize_with = "crate::model::lenient_timestamp")]
    pub server_timestamp: u64,
}

/// Chunks a node holds for a country
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub node_id: String,
    pub country: String,
    pub chunk_ids: Vec<String>,
    pub record_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceAck {
    #[serde(default)]
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkListRequest {
    pub country: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPullRequest {
    pub country: String,
    pub chunk_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub chunk_hash: String,
    pub chunk: Chunk,
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Human readable endpoint for logs and errors
    fn endpoint(&self) -> String;

    async fn sync(&self, request: SyncRequest) -> NetworkResult<SyncResponse>;

    async fn announce(&self, announcement: Announcement) -> NetworkResult<AnnounceAck>;

    async fn list_chunks(&self, country: &str) -> NetworkResult<Vec<ChunkDescriptor>>;

    async fn pull_chunk(&self, country: &str, chunk_hash: &str) -> NetworkResult<ChunkPayload>;
}

/// JSON over HTTP
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> NetworkResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("meshstore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NetworkError::ConnectionFailed {
                endpoint: base_url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> NetworkResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let endpoint = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&endpoint)
            .header("X-Mesh-Wire-Version", env!("MESH_WIRE_VERSION"))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NetworkError::RequestTimeout {
                        endpoint: endpoint.clone(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    NetworkError::ConnectionFailed {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND && path == "/api/chunk/pull" {
            return Err(NetworkError::ChunkNotAvailable {
                chunk_hash: String::new(),
            });
        }
        if !status.is_success() {
            return Err(NetworkError::HttpError {
                status: status.as_u16(),
                endpoint,
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| NetworkError::InvalidResponse {
                endpoint,
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn sync(&self, request: SyncRequest) -> NetworkResult<SyncResponse> {
        self.post("/api/sync", &request).await
    }

    async fn announce(&self, announcement: Announcement) -> NetworkResult<AnnounceAck> {
        self.post("/api/announce", &announcement).await
    }

    async fn list_chunks(&self, country: &str) -> NetworkResult<Vec<ChunkDescriptor>> {
        let request = ChunkListRequest {
            country: country.to_string(),
        };
        self.post("/api/chunk/list", &request).await
    }

    async fn pull_chunk(&self, country: &str, chunk_hash: &str) -> NetworkResult<ChunkPayload> {
        let request = ChunkPullRequest {
            country: country.to_string(),
            chunk_hash: chunk_hash.to_string(),
        };
        self.post("/api/chunk/pull", &request)
            .await
            .map_err(|e| match e {
                NetworkError::ChunkNotAvailable { .. } => NetworkError::ChunkNotAvailable {
                    chunk_hash: chunk_hash.to_string(),
                },
                other => other,
            })
    }
}

/// Authority for dataset sync, peers first for chunk pulls
pub struct PeerAssistedTransport {
    authority: Arc<dyn SyncTransport>,
    peers: Vec<Arc<dyn SyncTransport>>,
}

impl PeerAssistedTransport {
    pub fn new(authority: Arc<dyn SyncTransport>, peers: Vec<Arc<dyn SyncTransport>>) -> Self {
        Self { authority, peers }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[async_trait]
impl SyncTransport for PeerAssistedTransport {
    fn endpoint(&self) -> String {
        format!("{} (+{} peers)", self.authority.endpoint(), self.peers.len())
    }

    async fn sync(&self, request: SyncRequest) -> NetworkResult<SyncResponse> {
        self.authority.sync(request).await
    }

    /// Fan out to authority and peers; succeeds if anyone accepted
    async fn announce(&self, announcement: Announcement) -> NetworkResult<AnnounceAck> {
        let targets = std::iter::once(&self.authority).chain(self.peers.iter());
        let results =
            futures::future::join_all(targets.map(|t| t.announce(announcement.clone()))).await;

        let mut last_error = None;
        let mut accepted = false;
        for result in results {
            match result {
                Ok(ack) => accepted |= ack.accepted,
                Err(e) => {
                    tracing::debug!(error = %e, "Announce target failed");
                    last_error = Some(e);
                }
            }
        }
        match (accepted, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(AnnounceAck { accepted }),
        }
    }

    async fn list_chunks(&self, country: &str) -> NetworkResult<Vec<ChunkDescriptor>> {
        match self.authority.list_chunks(country).await {
            Ok(list) => Ok(list),
            Err(authority_error) => {
                for peer in &self.peers {
                    if let Ok(list) = peer.list_chunks(country).await {
                        return Ok(list);
                    }
                }
                Err(authority_error)
            }
        }
    }

    /// First source whose chunk actually hashes to `chunk_hash` wins
    async fn pull_chunk(&self, country: &str, chunk_hash: &str) -> NetworkResult<ChunkPayload> {
        for source in self.peers.iter().chain(std::iter::once(&self.authority)) {
            match source.pull_chunk(country, chunk_hash).await {
                Ok(payload) if payload.chunk.hash == chunk_hash && payload.chunk.verify().is_ok() => {
                    return Ok(payload);
                }
                Ok(_) => {
                    tracing::warn!(source = %source.endpoint(), chunk_hash = chunk_hash, "Source served a chunk that fails verification");
                }
                Err(e) => {
                    tracing::debug!(source = %source.endpoint(), error = %e, "Chunk source failed");
                }
            }
        }
        Err(NetworkError::ChunkNotAvailable {
            chunk_hash: chunk_hash.to_string(),
        })
    }
}

/// Build the transport selected by `transport.mode`
pub fn build_transport(config: &SyncConfiguration) -> Result<Arc<dyn SyncTransport>, ConfigurationError> {
    let timeout = config.request_timeout();
    let http = |url: &str| {
        HttpTransport::new(url, timeout)
            .map(|t| Arc::new(t) as Arc<dyn SyncTransport>)
            .map_err(|e| ConfigurationError::InvalidValue {
                key: "transport".to_string(),
                value: url.to_string(),
                reason: e.to_string(),
            })
    };

    let authority = http(&config.sync.authority_url)?;
    match config.transport.mode {
        TransportMode::ServerOnly => Ok(authority),
        TransportMode::PeerAssisted => {
            let peers = config
                .transport
                .peer_urls
                .iter()
                .map(|url| http(url))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(PeerAssistedTransport::new(authority, peers)))
        }
    }
}
