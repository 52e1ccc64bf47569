//! Error types for pipeline operations

use nightly_state::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Invalid glob pattern '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid trigger event: {0}")]
    InvalidEvent(String),

    #[error("Stage {stage} has empty command")]
    EmptyCommand { stage: String },

    #[error("Stage {stage} timed out after {secs} seconds")]
    StageTimeout { stage: String, secs: u64 },

    #[error("Failed to spawn '{program}' for stage {stage}: {source}")]
    Spawn {
        stage: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
