//! Error types shared by every layer of the synchronization engine.
//!
//! Codec and backend layers return these typed failures; the router and the
//! autosave scheduler decide on fallback. Nothing in this crate retries the
//! same backend silently.

use thiserror::Error;

/// Errors that can occur while persisting or restoring a classifier dataset.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Bad model id, label or display name. Raised before any I/O.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing model, chunk set or blob.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Model pool exhausted: all {0} slots are in use")]
    PoolExhausted(usize),

    /// The local fallback store is full. Prior state is left untouched.
    #[error("Quota exceeded: need {required} bytes, {available} bytes available")]
    QuotaExceeded { required: usize, available: usize },

    /// Missing or rejected API key.
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error(
        "Payload too large: {size} bytes exceeds the {limit} byte limit; remove examples or raise the server upload limit"
    )]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Vector length disagrees with the dimension the live model expects.
    #[error("Shape mismatch: expected dimension {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// A chunk set that is not contiguous, mixes versions or is truncated.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression unavailable: {0}")]
    CompressionUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The blob server answered with a status we do not map to a kind.
    #[error("HTTP error: status {status}: {message}")]
    Http { status: u16, message: String },
}

impl SyncError {
    /// Whether a failed blob upload with this error should be retried through
    /// the chunked document backend.
    ///
    /// The router falls back on every blob upload failure; this only decides
    /// how loudly the fallback is reported.
    pub fn is_network_class(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnreachable(_) | Self::Timeout(_) | Self::Http { .. }
        )
    }

    /// Short machine-readable name of the error kind, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::AuthFailure(_) => "auth_failure",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::NetworkUnreachable(_) => "network_unreachable",
            Self::Timeout(_) => "timeout",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::Integrity(_) => "integrity",
            Self::Serialization(_) => "serialization",
            Self::CompressionUnavailable(_) => "compression_unavailable",
            Self::Storage(_) => "storage",
            Self::Http { .. } => "http",
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
