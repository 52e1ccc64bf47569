//! Error types for nightly-state

use thiserror::Error;

/// Errors raised by the ledger, cache and release channel backends
#[derive(Error, Debug)]
pub enum StorageError {
    /// Run not found in the ledger
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Run ID is not a UUID
    #[error("Invalid run id: {run_id}")]
    InvalidRunId { run_id: String },

    /// Run is not in the state an operation requires
    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Digest string is not 64 hex chars
    #[error("Invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Cache entry on disk does not match its manifest
    #[error("Cache entry {key} is corrupt: {reason}")]
    CacheEntryCorrupt { key: String, reason: String },

    /// Release tag does not exist on the channel
    #[error("Release not found: {tag}")]
    ReleaseNotFound { tag: String },

    /// Directory walk failed
    #[error("Failed to walk {path}: {message}")]
    Walk { path: String, message: String },

    /// Remote service returned an error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
