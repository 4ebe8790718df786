//! Core services for keyfill

pub mod cache;
pub mod checkpoint;
pub mod enrichment_orchestrator;
pub mod merger;
pub mod rate_limiter;
pub mod resolver;
pub mod worker_pool;

pub use cache::RecordCache;
pub use checkpoint::{CheckpointSnapshot, CheckpointStore};
pub use enrichment_orchestrator::{EnrichmentOrchestrator, RunOutcome};
pub use merger::{MergeReport, Merger};
pub use rate_limiter::{AdaptiveRateLimiter, RateLimiterState};
pub use resolver::{HttpResolver, ResolveError, Resolver};
pub use worker_pool::{PoolReport, TaskOutcome, WorkerPool};
