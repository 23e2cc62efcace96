//! Error types and handling for meshstore
//!
//! Covers the failure domains of the sync core:
//! - Local store (primary and fallback tiers)
//! - Transport (authority and peers)
//! - Integrity verification of chunks and Merkle roots
//! - Configuration and serialization

use std::fmt;
use thiserror::Error;

/// Main error type for meshstore
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Comment cooldown active: record_id={record_id}, remaining_ms={remaining_ms}")]
    CommentCooldown { record_id: String, remaining_ms: u64 },

    #[error("Unknown record: country={country}, record_id={record_id}")]
    UnknownRecord { country: String, record_id: String },

    #[error("Field not open to proposals: record_id={record_id}, field={field}")]
    FieldNotEditable { record_id: String, field: String },
}

/// Local store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: backend={backend}, reason={reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Quota exceeded: backend={backend}, requested={requested}, available={available}")]
    QuotaExceeded {
        backend: String,
        requested: usize,
        available: usize,
    },

    #[error("Backend operation failed: backend={backend}, operation={operation}, error={error}")]
    OperationFailed {
        backend: String,
        operation: String,
        error: String,
    },

    #[error("Corrupt entry: key={key}, reason={reason}")]
    CorruptEntry { key: String, reason: String },
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: endpoint={endpoint}, reason={reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Request timeout: endpoint={endpoint}, timeout_ms={timeout_ms}")]
    RequestTimeout { endpoint: String, timeout_ms: u64 },

    #[error("HTTP error: status={status}, endpoint={endpoint}")]
    HttpError { status: u16, endpoint: String },

    #[error("Network unreachable: {reason}")]
    NetworkUnreachable { reason: String },

    #[error("Chunk not available: chunk_hash={chunk_hash}")]
    ChunkNotAvailable { chunk_hash: String },

    #[error("Invalid response: endpoint={endpoint}, reason={reason}")]
    InvalidResponse { endpoint: String, reason: String },
}

/// Chunk and Merkle verification errors
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Chunk hash mismatch: chunk_id={chunk_id}, expected={expected}, actual={actual}")]
    ChunkHashMismatch {
        chunk_id: String,
        expected: String,
        actual: String,
    },

    #[error("Merkle root mismatch: country={country}, expected={expected}, actual={actual}")]
    MerkleRootMismatch {
        country: String,
        expected: String,
        actual: String,
    },

    #[error("Unverifiable dataset: country={country}, reason={reason}")]
    Unverifiable { country: String, reason: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value: key={key}, value={value}, reason={reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration parsing failed: {reason}")]
    ParsingFailed { reason: String },

    #[error("Environment variable error: {var}, error={error}")]
    EnvironmentVariable { var: String, error: String },
}

/// Serialization errors
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    JsonFailed { reason: String },

    #[error("Deserialization failed: expected_type={expected_type}, reason={reason}")]
    DeserializationFailed {
        expected_type: String,
        reason: String,
    },
}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        SerializationError::JsonFailed {
            reason: err.to_string(),
        }
    }
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::OperationFailed {
            backend: "sled".to_string(),
            operation: "io".to_string(),
            error: err.to_string(),
        }
    }
}

/// Result type aliases for convenience
pub type MeshResult<T> = Result<T, MeshError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type NetworkResult<T> = Result<T, NetworkError>;
pub type IntegrityResult<T> = Result<T, IntegrityError>;

/// Utility functions for error handling
pub mod utils {
    use super::*;

    /// Check if error is recoverable by retrying on the next sync trigger
    pub fn is_recoverable_error(error: &MeshError) -> bool {
        match error {
            MeshError::Network(_) => true,
            MeshError::Store(StoreError::QuotaExceeded { .. }) => true,
            MeshError::Store(StoreError::Unavailable { .. }) => true,
            MeshError::Integrity(IntegrityError::ChunkHashMismatch { .. }) => true,
            MeshError::CommentCooldown { .. } => true,
            MeshError::Configuration(_) => false,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn get_error_severity(error: &MeshError) -> ErrorSeverity {
        match error {
            MeshError::Integrity(IntegrityError::MerkleRootMismatch { .. }) => ErrorSeverity::Critical,
            MeshError::Store(StoreError::CorruptEntry { .. }) => ErrorSeverity::High,
            MeshError::Configuration(_) => ErrorSeverity::High,
            MeshError::Store(_) => ErrorSeverity::Medium,
            MeshError::Network(_) => ErrorSeverity::Low,
            MeshError::CommentCooldown { .. } => ErrorSeverity::Low,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}
