//! Error types for the event store.

use crate::types::StreamVersion;
use thiserror::Error;

/// Main error type for store and subscription operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Concurrency conflict on stream {stream_id}: expected version {expected}, actual {actual}")]
    ConcurrencyConflict {
        stream_id: String,
        expected: StreamVersion,
        actual: StreamVersion,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate event: id {id} from source {event_source}")]
    DuplicateEvent { id: String, event_source: String },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Subscription already active: {0}")]
    SubscriptionActive(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
}

impl StoreError {
    /// Whether the failure is an infrastructure hiccup worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::BackendUnavailable(_))
    }

    /// Whether the caller lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
