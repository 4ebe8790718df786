//! Enrichment orchestrator
//!
//! Coordinates one run end to end:
//!
//! KEYS → CHECKPOINT LOAD → PARTITION → FETCH → MERGE
//!
//! - **KEYS**: distinct non-blank keys from the key column
//! - **CHECKPOINT LOAD**: previous cache snapshot; with force-retry, null
//!   entries are dropped so their keys are fetched again
//! - **PARTITION**: keys already in the cache are not fetched
//! - **FETCH**: worker pool drains the rest, checkpointing as it goes
//! - **MERGE**: field-fill policy applied to every row, then dedup by key
//!
//! Setup failures (missing key column, corrupt checkpoint) abort before any
//! resolver call. The checkpoint is only removed through
//! [`EnrichmentOrchestrator::finish`], after the caller has written output.

use crate::dataset::Dataset;
use crate::error::Result;
use crate::services::cache::RecordCache;
use crate::services::checkpoint::CheckpointStore;
use crate::services::merger::{MergeReport, Merger};
use crate::services::rate_limiter::AdaptiveRateLimiter;
use crate::services::resolver::Resolver;
use crate::services::worker_pool::{PoolReport, WorkerPool};
use crate::types::{CacheStats, Key};
use crate::utils::RetryPolicy;
use keyfill_common::{RunConfig, TomlConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of one orchestrated run
#[derive(Debug)]
pub struct RunOutcome {
    /// Merged, deduplicated dataset ready for the writer
    pub dataset: Dataset,
    /// Distinct non-blank keys in the input
    pub distinct_keys: usize,
    /// Input keys already present in the loaded checkpoint
    pub already_cached: usize,
    /// Keys re-queued by force-retry
    pub requeued: usize,
    pub pool: PoolReport,
    /// Cache statistics after fetching
    pub stats: CacheStats,
    pub merge: MergeReport,
    /// Stopped on the cancellation token
    pub interrupted: bool,
    /// Every input key has a cache entry
    pub complete: bool,
}

impl RunOutcome {
    /// Whether the checkpoint has served its purpose
    pub fn is_finished(&self) -> bool {
        self.complete && !self.interrupted
    }
}

/// One orchestrator for every enrichment run, configured by run options
pub struct EnrichmentOrchestrator {
    run: RunConfig,
    retry: RetryPolicy,
    merger: Merger,
    checkpoint: CheckpointStore,
    resolver: Arc<dyn Resolver>,
    cancel: CancellationToken,
}

impl EnrichmentOrchestrator {
    pub fn new(
        config: &TomlConfig,
        checkpoint: CheckpointStore,
        resolver: Arc<dyn Resolver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run: config.run.clone(),
            retry: RetryPolicy::from_config(&config.retry),
            merger: Merger::new(config.merge.clone()),
            checkpoint,
            resolver,
            cancel,
        }
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Run the fetch and merge phases over `dataset`
    pub async fn run(&self, mut dataset: Dataset) -> Result<RunOutcome> {
        let key_column = self.merger.policy().key_column.clone();

        // Phase 1: distinct keys
        let keys = dataset.distinct_keys(&key_column)?;
        info!(
            rows = dataset.len(),
            distinct_keys = keys.len(),
            key_column = %key_column,
            "Extracted distinct keys"
        );

        // Phase 2: checkpoint
        let store = self.checkpoint.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.load()).await??;
        if !snapshot.is_empty() {
            info!(
                entries = snapshot.len(),
                path = %self.checkpoint.path().display(),
                "Resuming from checkpoint"
            );
        }
        let cache = Arc::new(RecordCache::from_entries(snapshot.cache));

        let requeued = if self.run.force_retry_failed {
            let removed = cache.remove_failed();
            if !removed.is_empty() {
                info!(count = removed.len(), "Re-queuing previously failed keys");
            }
            removed.len()
        } else {
            0
        };

        // Phase 3: partition
        let uncached: Vec<Key> = keys.iter().filter(|key| !cache.contains(key)).cloned().collect();
        let already_cached = keys.len() - uncached.len();
        info!(
            already_cached,
            to_fetch = uncached.len(),
            "Partitioned keys"
        );

        // Phase 4: fetch
        let pool_report = if self.cancel.is_cancelled() {
            warn!("Cancelled before dispatch, skipping fetch");
            PoolReport {
                total: uncached.len(),
                undispatched: uncached.len(),
                cancelled: true,
                ..PoolReport::default()
            }
        } else {
            self.build_pool(Arc::clone(&cache)).run(uncached).await
        };

        let stats = cache.stats();
        info!(
            "Cache: {} successful, {} failed, {} total",
            stats.successful, stats.failed, stats.total
        );

        // Phase 5: merge
        let merge = self.merger.merge(&mut dataset, &cache)?;

        let complete = keys.iter().all(|key| cache.contains(key));
        let interrupted = pool_report.cancelled;
        if interrupted {
            warn!(
                "Interrupted with {} of {} keys resolved. Run again to resume from checkpoint {}",
                keys.iter().filter(|key| cache.contains(key)).count(),
                keys.len(),
                self.checkpoint.path().display()
            );
        } else if !complete {
            warn!(
                rate_limited = pool_report.rate_limited,
                "Some keys were rate limited and remain unresolved; run again to retry them"
            );
        }

        Ok(RunOutcome {
            dataset,
            distinct_keys: keys.len(),
            already_cached,
            requeued,
            pool: pool_report,
            stats,
            merge,
            interrupted,
            complete,
        })
    }

    /// Remove the checkpoint once output is safely written and nothing is left to fetch
    ///
    /// Returns whether the checkpoint was removed.
    pub fn finish(&self, outcome: &RunOutcome) -> Result<bool> {
        if !outcome.is_finished() {
            info!(
                path = %self.checkpoint.path().display(),
                "Checkpoint retained for the next run"
            );
            return Ok(false);
        }
        self.checkpoint.remove()?;
        info!("All keys resolved, checkpoint removed");
        Ok(true)
    }

    fn build_pool(&self, cache: Arc<RecordCache>) -> WorkerPool {
        let limiter = Arc::new(AdaptiveRateLimiter::with_pause(
            self.run.base_delay(),
            self.run.max_delay(),
            self.run.failure_threshold,
            self.run.long_pause(),
        ));

        WorkerPool::new(Arc::clone(&self.resolver), cache, limiter, self.cancel.clone())
            .with_workers(self.run.workers)
            .with_batch_size(self.run.batch_size)
            .with_retry(self.retry.clone())
            .with_checkpoint(self.checkpoint.clone())
    }
}
