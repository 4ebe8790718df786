//! keyfill library interface
//!
//! Resolves every distinct key of a dataset exactly once against a slow,
//! rate-limited source, caches and checkpoints the results, and merges them
//! back into every row sharing the key.

pub mod dataset;
pub mod error;
pub mod logging;
pub mod services;
pub mod shutdown;
pub mod types;
pub mod utils;

pub use crate::dataset::{Dataset, DatasetRow};
pub use crate::error::{Error, Result};
pub use crate::services::{
    AdaptiveRateLimiter, CheckpointSnapshot, CheckpointStore, EnrichmentOrchestrator, HttpResolver, Merger,
    RecordCache, ResolveError, Resolver, RunOutcome, WorkerPool,
};
pub use crate::types::{CacheStats, Key, Record};
pub use crate::utils::RetryPolicy;
