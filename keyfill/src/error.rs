//! Error types for keyfill
//!
//! Per-key resolver failures live in [`crate::services::resolver::ResolveError`]
//! and never surface here; this type covers setup and I/O failures that abort
//! a run before (or after) dispatch.

use thiserror::Error;

/// Result alias for keyfill operations
pub type Result<T> = std::result::Result<T, Error>;

/// Run-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Dataset is unusable (missing key column, no header row)
    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),

    /// Checkpoint exists but cannot be read back
    #[error("Corrupt checkpoint {path}: {reason}")]
    CorruptCheckpoint { path: String, reason: String },

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task failed to complete
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// keyfill-common error
    #[error("Common error: {0}")]
    Common(#[from] keyfill_common::Error),
}
