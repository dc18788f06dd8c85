//! Error types and handling
//!
//! Error taxonomy for the capture pipeline: frame-level losses are counters,
//! not errors; sink failures are isolated per sink; session and capability
//! failures surface here.

use crate::sink::SinkRole;
use thiserror::Error;

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("capability error: {0}")]
    Capability(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("buffer pool exhausted: {outstanding} buffers outstanding (cap {cap})")]
    PoolExhausted { outstanding: usize, cap: usize },

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("invalid session state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Per-sink failure. One sink's error never aborts the others.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to open {role} sink: {reason}")]
    Open { role: SinkRole, reason: String },

    #[error("{role} sink write failed: {reason}")]
    Write { role: SinkRole, reason: String },

    #[error("{role} sink finalize failed: {reason}")]
    Finalize { role: SinkRole, reason: String },

    #[error("ffmpeg error: {0}")]
    Ffmpeg(String),
}

/// Result type alias using PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;
