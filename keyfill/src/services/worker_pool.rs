//! Bounded worker pool draining uncached keys through the resolver
//!
//! # Dispatch
//! Keys are enumerated once by a single producer: the pool seeds `workers`
//! tasks, then spawns one more each time a task completes, until the key list
//! is exhausted or the cancellation token fires. A key is taken off the list
//! the moment it is dispatched, so it is never fetched twice in one run.
//!
//! # Per-key task
//! 1. Exit without a call if cancelled
//! 2. Sleep the rate limiter's jittered delay (cancellable)
//! 3. Call the resolver through the retry policy
//! 4. Success → `record_success`, cache the record (or null for "nothing found")
//! 5. Throttled → `record_failure`, long pause when the limiter asks; not cached
//! 6. Other failure → log, cache null
//! 7. Cancelled during a retry backoff → not cached
//!
//! Completions are consumed in completion order. Every `batch_size`
//! completions the cache is checkpointed; a final checkpoint is always written
//! before `run` returns, including after cancellation.

use crate::services::cache::RecordCache;
use crate::services::checkpoint::{CheckpointSnapshot, CheckpointStore};
use crate::services::rate_limiter::AdaptiveRateLimiter;
use crate::services::resolver::{ResolveError, Resolver};
use crate::types::Key;
use crate::utils::RetryPolicy;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a single fetch task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Resolver returned a record
    Resolved,
    /// Resolver found nothing; cached as null
    Empty,
    /// Resolver failed after retries; cached as null
    Failed,
    /// Source throttled the request; left uncached for a later run
    RateLimited,
    /// Cancelled before the resolver was called
    Skipped,
}

/// Counters for one pool run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    /// Keys handed to the pool
    pub total: usize,
    /// Keys turned into tasks
    pub dispatched: usize,
    pub resolved: usize,
    pub empty: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub skipped: usize,
    /// Keys never dispatched because of cancellation
    pub undispatched: usize,
    /// Whether the run stopped on the cancellation token
    pub cancelled: bool,
}

impl PoolReport {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Resolved => self.resolved += 1,
            TaskOutcome::Empty => self.empty += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::RateLimited => self.rate_limited += 1,
            TaskOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Tasks that have finished, whatever their outcome
    pub fn completed(&self) -> usize {
        self.resolved + self.empty + self.failed + self.rate_limited + self.skipped
    }
}

/// State shared by every fetch task
struct FetchContext {
    resolver: Arc<dyn Resolver>,
    cache: Arc<RecordCache>,
    limiter: Arc<AdaptiveRateLimiter>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl FetchContext {
    async fn fetch(&self, key: Key) -> TaskOutcome {
        if self.cancel.is_cancelled() {
            return TaskOutcome::Skipped;
        }

        let delay = self.limiter.get_delay();
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(key = %key, "Cancelled during pre-request delay");
                return TaskOutcome::Skipped;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let resolver = self.resolver.as_ref();
        let key_ref = &key;
        let result = self
            .retry
            .run(key.as_str(), &self.cancel, move || resolver.resolve(key_ref))
            .await;

        match result {
            Ok(Some(record)) => {
                self.limiter.record_success();
                self.cache.set(key, Some(record));
                TaskOutcome::Resolved
            }
            Ok(None) => {
                self.limiter.record_success();
                warn!(key = %key, "No record found");
                self.cache.set(key, None);
                TaskOutcome::Empty
            }
            Err(ResolveError::RateLimited(reason)) => {
                self.limiter.record_failure();
                warn!(key = %key, reason = %reason, "Rate limit hit, key left for a later run");

                let pause = self.limiter.should_pause();
                if !pause.is_zero() {
                    warn!(
                        pause_secs = pause.as_secs_f64(),
                        "Repeated rate limiting, pausing before further requests"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                    self.limiter.reset_failures();
                }
                TaskOutcome::RateLimited
            }
            Err(ResolveError::Cancelled) => {
                debug!(key = %key, "Cancelled while waiting to retry, key left for a later run");
                TaskOutcome::Skipped
            }
            Err(err) => {
                error!(key = %key, error = %err, "Error resolving key");
                self.cache.set(key, None);
                TaskOutcome::Failed
            }
        }
    }
}

/// Bounded-concurrency dispatcher
pub struct WorkerPool {
    ctx: Arc<FetchContext>,
    workers: usize,
    batch_size: usize,
    checkpoint: Option<CheckpointStore>,
}

impl WorkerPool {
    /// Pool with 3 workers, a checkpoint every 10 completions and no retries
    pub fn new(
        resolver: Arc<dyn Resolver>,
        cache: Arc<RecordCache>,
        limiter: Arc<AdaptiveRateLimiter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(FetchContext {
                resolver,
                cache,
                limiter,
                retry: RetryPolicy::none(),
                cancel,
            }),
            workers: 3,
            batch_size: 10,
            checkpoint: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_checkpoint(mut self, store: CheckpointStore) -> Self {
        self.checkpoint = Some(store);
        self
    }

    /// Only valid before the pool runs (the context is not yet shared)
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.retry = retry;
        }
        self
    }

    /// Drain `keys` through the resolver
    pub async fn run(&self, keys: Vec<Key>) -> PoolReport {
        let mut report = PoolReport {
            total: keys.len(),
            ..PoolReport::default()
        };
        let started = Instant::now();
        let mut pending = keys.into_iter();
        let mut tasks = JoinSet::new();
        let mut since_flush = 0;

        info!(
            keys = report.total,
            workers = self.workers,
            batch_size = self.batch_size,
            "Starting worker pool"
        );

        // Seed initial batch of tasks
        for _ in 0..self.workers {
            if !self.dispatch_next(&mut pending, &mut tasks, &mut report) {
                break;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Fetch task failed to complete: {}", e);
                    TaskOutcome::Failed
                }
            };
            report.record(outcome);

            since_flush += 1;
            if since_flush >= self.batch_size {
                since_flush = 0;
                self.flush_checkpoint().await;
                log_progress(&report, started);
            }

            // Refill; a no-op once cancelled so in-flight tasks simply drain
            self.dispatch_next(&mut pending, &mut tasks, &mut report);
        }

        report.undispatched = pending.count();
        report.cancelled = self.ctx.cancel.is_cancelled();
        if report.cancelled {
            info!(
                completed = report.completed(),
                undispatched = report.undispatched,
                "Worker pool stopped on cancellation"
            );
        }

        self.flush_checkpoint().await;
        report
    }

    fn dispatch_next(
        &self,
        pending: &mut std::vec::IntoIter<Key>,
        tasks: &mut JoinSet<TaskOutcome>,
        report: &mut PoolReport,
    ) -> bool {
        if self.ctx.cancel.is_cancelled() {
            return false;
        }
        let Some(key) = pending.next() else {
            return false;
        };

        report.dispatched += 1;
        let ctx = Arc::clone(&self.ctx);
        tasks.spawn(async move { ctx.fetch(key).await });
        true
    }

    /// Copy the cache under its lock, then write on a blocking thread
    async fn flush_checkpoint(&self) {
        let Some(store) = self.checkpoint.clone() else {
            return;
        };
        let snapshot = CheckpointSnapshot {
            cache: self.ctx.cache.snapshot(),
        };

        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to save checkpoint: {}", e),
            Err(e) => error!("Checkpoint task failed: {}", e),
        }
    }
}

fn log_progress(report: &PoolReport, started: Instant) {
    let completed = report.completed();
    let elapsed = started.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 { completed as f64 / elapsed } else { 0.0 };
    let remaining = report.total.saturating_sub(completed);
    let eta_secs = if rate > 0.0 { (remaining as f64 / rate) as u64 } else { 0 };
    let percentage = if report.total > 0 {
        completed as f64 / report.total as f64 * 100.0
    } else {
        100.0
    };

    info!(
        "Progress: {}/{} ({:.1}%) | Rate: {:.2} keys/sec | ETA: {}s | Resolved: {} | Empty: {} | Failed: {} | Rate limited: {}",
        completed,
        report.total,
        percentage,
        rate,
        eta_secs,
        report.resolved,
        report.empty,
        report.failed,
        report.rate_limited
    );
}
