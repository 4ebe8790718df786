//! Integration tests for end-to-end enrichment runs
//!
//! Covers resolver call counts, resume after interruption, force-retry,
//! and setup failures that must abort before any resolver call.

use async_trait::async_trait;
use keyfill::{
    CheckpointSnapshot, CheckpointStore, Dataset, EnrichmentOrchestrator, Error, Key, Record, ResolveError,
    Resolver,
};
use keyfill_common::{FieldRule, TomlConfig};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test helpers
// ============================================================================

/// Resolver counting calls; `none-*` keys resolve to nothing, `limit-*` keys are throttled
#[derive(Default)]
struct CountingResolver {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl CountingResolver {
    fn cancelling_after(limit: usize, token: CancellationToken) -> Self {
        Self {
            cancel_after: Some((limit, token)),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for CountingResolver {
    async fn resolve(&self, key: &Key) -> Result<Option<Record>, ResolveError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(key.to_string());
        if let Some((limit, token)) = &self.cancel_after {
            if n >= *limit {
                token.cancel();
            }
        }

        if key.as_str().starts_with("none-") {
            return Ok(None);
        }
        if key.as_str().starts_with("limit-") {
            return Err(ResolveError::RateLimited("429".to_string()));
        }
        Ok(Some(Record::from([
            ("Legal Name".to_string(), format!("Company {}", key)),
            ("Status".to_string(), "Active".to_string()),
        ])))
    }
}

fn test_config() -> TomlConfig {
    let mut config = TomlConfig::default();
    config.run.workers = 1;
    config.run.base_delay_secs = 0.001;
    config.run.max_delay_secs = 0.002;
    config.run.batch_size = 2;
    config.run.long_pause_secs = 0.01;
    config.retry.max_attempts = 1;
    config.merge.key_column = "Key".to_string();
    config.merge.preserve = vec![FieldRule::from_source("Name", "Legal Name")];
    config.merge.derived = vec![FieldRule::new("Status")];
    config
}

fn dataset(keys: &[&str]) -> Dataset {
    Dataset::new(
        vec!["Key".to_string(), "Name".to_string()],
        keys.iter().map(|k| vec![k.to_string(), String::new()]).collect(),
    )
}

fn distinct(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("K{:02}", i)).collect()
}

// ============================================================================
// Call-count properties
// ============================================================================

#[tokio::test]
async fn test_shared_key_resolved_once_and_rows_match() {
    let dir = TempDir::new().unwrap();
    let resolver = Arc::new(CountingResolver::default());
    let orchestrator = EnrichmentOrchestrator::new(
        &test_config(),
        CheckpointStore::new(dir.path().join("cp.json")),
        resolver.clone(),
        CancellationToken::new(),
    );

    let outcome = orchestrator.run(dataset(&["K1", "K1 ", "K2", "", "K1"])).await.unwrap();

    assert_eq!(resolver.calls(), 2);
    assert_eq!(outcome.distinct_keys, 2);
    assert_eq!(outcome.merge.duplicates_removed, 2);
    assert!(outcome.complete);

    let rows = outcome.dataset.rows();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].get(1), Some("Company K1"));
    assert_eq!(rows[0].get(2), Some("Active"));
    // Blank-key row is kept but not filled
    assert_eq!(rows[2].get(0), Some(""));
    assert_eq!(rows[2].get(2), Some(""));
}

#[tokio::test]
async fn test_rows_sharing_key_receive_identical_values_before_dedup() {
    let dir = TempDir::new().unwrap();
    let resolver = Arc::new(CountingResolver::default());
    let mut config = test_config();
    config.run.workers = 3;
    let orchestrator = EnrichmentOrchestrator::new(
        &config,
        CheckpointStore::new(dir.path().join("cp.json")),
        resolver.clone(),
        CancellationToken::new(),
    );

    let outcome = orchestrator.run(dataset(&["A", "B", "A", "C", "B", "A"])).await.unwrap();

    assert_eq!(resolver.calls(), 3);
    let mut seen = resolver.seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["A", "B", "C"]);
    assert_eq!(outcome.dataset.len(), 3);
}

#[tokio::test]
async fn test_calls_bounded_by_uncached_keys() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("cp.json"));

    let mut cache = BTreeMap::new();
    cache.insert("K00".to_string(), Some(Record::from([("Legal Name".to_string(), "Old".to_string())])));
    cache.insert("K01".to_string(), None);
    store.save(&CheckpointSnapshot { cache }).unwrap();

    let resolver = Arc::new(CountingResolver::default());
    let orchestrator =
        EnrichmentOrchestrator::new(&test_config(), store, resolver.clone(), CancellationToken::new());

    let keys = distinct(6);
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let outcome = orchestrator.run(dataset(&refs)).await.unwrap();

    assert_eq!(resolver.calls(), 4);
    assert_eq!(outcome.already_cached, 2);
    // Cached record wins over a fresh fetch
    assert_eq!(outcome.dataset.rows()[0].get(1), Some("Old"));
    // Cached null: preserve column untouched, derived column gets the sentinel
    assert_eq!(outcome.dataset.rows()[1].get(1), Some(""));
    assert_eq!(outcome.dataset.rows()[1].get(2), Some("N/A"));
}

// ============================================================================
// Resume after interruption
// ============================================================================

#[tokio::test]
async fn test_resume_fetches_only_remaining_keys() {
    const M: usize = 10;
    const N: usize = 4;

    let dir = TempDir::new().unwrap();
    let checkpoint_path = dir.path().join("cp.json");
    let keys = distinct(M);
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();

    // First run: cancelled while the Nth call is in flight
    let cancel = CancellationToken::new();
    let first = Arc::new(CountingResolver::cancelling_after(N, cancel.clone()));
    let orchestrator = EnrichmentOrchestrator::new(
        &test_config(),
        CheckpointStore::new(&checkpoint_path),
        first.clone(),
        cancel,
    );
    let outcome = orchestrator.run(dataset(&refs)).await.unwrap();

    assert_eq!(first.calls(), N);
    assert!(outcome.interrupted);
    assert!(!outcome.complete);
    assert!(!orchestrator.finish(&outcome).unwrap());
    assert_eq!(CheckpointStore::new(&checkpoint_path).load().unwrap().len(), N);

    // Second run: fresh process state, same checkpoint
    let second = Arc::new(CountingResolver::default());
    let orchestrator = EnrichmentOrchestrator::new(
        &test_config(),
        CheckpointStore::new(&checkpoint_path),
        second.clone(),
        CancellationToken::new(),
    );
    let outcome = orchestrator.run(dataset(&refs)).await.unwrap();

    assert_eq!(second.calls(), M - N);
    assert_eq!(outcome.already_cached, N);
    assert!(outcome.complete);
    assert!(orchestrator.finish(&outcome).unwrap());
    assert!(!checkpoint_path.exists());
}

#[tokio::test]
async fn test_cancelled_before_run_makes_no_calls() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let resolver = Arc::new(CountingResolver::default());
    let orchestrator = EnrichmentOrchestrator::new(
        &test_config(),
        CheckpointStore::new(dir.path().join("cp.json")),
        resolver.clone(),
        cancel,
    );

    let outcome = orchestrator.run(dataset(&["K1", "K2"])).await.unwrap();

    assert_eq!(resolver.calls(), 0);
    assert!(outcome.interrupted);
    assert_eq!(outcome.pool.undispatched, 2);
    // Rows still get uniform sentinel columns
    assert_eq!(outcome.dataset.rows()[0].get(2), Some("N/A"));
}

#[tokio::test]
async fn test_rate_limited_keys_keep_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cp.json");
    let resolver = Arc::new(CountingResolver::default());
    let orchestrator =
        EnrichmentOrchestrator::new(&test_config(), CheckpointStore::new(&path), resolver.clone(), CancellationToken::new());

    let outcome = orchestrator.run(dataset(&["K1", "limit-1"])).await.unwrap();

    assert!(!outcome.interrupted);
    assert!(!outcome.complete);
    assert_eq!(outcome.pool.rate_limited, 1);
    assert!(!orchestrator.finish(&outcome).unwrap());

    // Only the resolved key was checkpointed; the throttled one is fetched next run
    let snapshot = CheckpointStore::new(&path).load().unwrap();
    assert_eq!(snapshot.cache.keys().collect::<Vec<_>>(), vec!["K1"]);
    assert_eq!(outcome.dataset.rows()[1].get(2), Some("N/A"));
}

// ============================================================================
// Force-retry
// ============================================================================

#[tokio::test]
async fn test_force_retry_requeues_null_entries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cp.json");

    let mut cache = BTreeMap::new();
    cache.insert("K1".to_string(), None);
    cache.insert("K2".to_string(), Some(Record::from([("Status".to_string(), "Cancelled".to_string())])));
    CheckpointStore::new(&path).save(&CheckpointSnapshot { cache }).unwrap();

    // Without the flag nothing is fetched
    let resolver = Arc::new(CountingResolver::default());
    let orchestrator =
        EnrichmentOrchestrator::new(&test_config(), CheckpointStore::new(&path), resolver.clone(), CancellationToken::new());
    let outcome = orchestrator.run(dataset(&["K1", "K2"])).await.unwrap();
    assert_eq!(resolver.calls(), 0);
    assert_eq!(outcome.requeued, 0);

    // With the flag only the null entry is fetched again
    let mut config = test_config();
    config.run.force_retry_failed = true;
    let resolver = Arc::new(CountingResolver::default());
    let orchestrator =
        EnrichmentOrchestrator::new(&config, CheckpointStore::new(&path), resolver.clone(), CancellationToken::new());
    let outcome = orchestrator.run(dataset(&["K1", "K2"])).await.unwrap();

    assert_eq!(resolver.calls(), 1);
    assert_eq!(resolver.seen.lock().unwrap().as_slice(), ["K1".to_string()]);
    assert_eq!(outcome.requeued, 1);
    assert_eq!(outcome.stats.successful, 2);
    assert_eq!(outcome.dataset.rows()[1].get(2), Some("Cancelled"));
}

// ============================================================================
// Setup failures
// ============================================================================

#[tokio::test]
async fn test_corrupt_checkpoint_aborts_before_dispatch() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cp.json");
    std::fs::write(&path, "{\"cache\": [").unwrap();

    let resolver = Arc::new(CountingResolver::default());
    let orchestrator =
        EnrichmentOrchestrator::new(&test_config(), CheckpointStore::new(&path), resolver.clone(), CancellationToken::new());
    let result = orchestrator.run(dataset(&["K1"])).await;

    assert!(matches!(result, Err(Error::CorruptCheckpoint { .. })));
    assert_eq!(resolver.calls(), 0);
}

#[tokio::test]
async fn test_missing_key_column_aborts_before_dispatch() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.merge.key_column = "GSTIN".to_string();

    let resolver = Arc::new(CountingResolver::default());
    let orchestrator = EnrichmentOrchestrator::new(
        &config,
        CheckpointStore::new(dir.path().join("cp.json")),
        resolver.clone(),
        CancellationToken::new(),
    );
    let result = orchestrator.run(dataset(&["K1"])).await;

    assert!(matches!(result, Err(Error::InvalidDataset(_))));
    assert_eq!(resolver.calls(), 0);
}

// ============================================================================
// CSV end to end
// ============================================================================

#[tokio::test]
async fn test_csv_run_writes_output_and_clears_checkpoint() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("rapl.csv");
    let output = dir.path().join("rapl_filled.csv");
    std::fs::write(
        &input,
        "Key,Name,Notes\nK1,,first\nnone-2,,second\nK1,Hand Entered,third\n,,orphan\n",
    )
    .unwrap();

    let store = CheckpointStore::new(CheckpointStore::default_path_for(&input));
    let checkpoint_path = store.path().to_path_buf();
    let resolver = Arc::new(CountingResolver::default());
    let orchestrator = EnrichmentOrchestrator::new(&test_config(), store, resolver.clone(), CancellationToken::new());

    let outcome = orchestrator.run(Dataset::read_csv(&input).unwrap()).await.unwrap();
    outcome.dataset.write_csv(&output).unwrap();
    assert!(checkpoint_path.exists());
    assert!(orchestrator.finish(&outcome).unwrap());
    assert!(!checkpoint_path.exists());

    assert_eq!(resolver.calls(), 2);
    let written = std::fs::read_to_string(&output).unwrap();
    assert_eq!(
        written,
        "Key,Name,Notes,Status\n\
         K1,Company K1,first,Active\n\
         none-2,,second,N/A\n\
         ,,orphan,\n"
    );
}

#[tokio::test]
async fn test_unlabelled_input_cells_survive_merge() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("notes.csv");
    let output = dir.path().join("notes_filled.csv");
    std::fs::write(&input, "Key,Name\nK1,,hand note\n").unwrap();

    let resolver = Arc::new(CountingResolver::default());
    let orchestrator = EnrichmentOrchestrator::new(
        &test_config(),
        CheckpointStore::new(dir.path().join("cp.json")),
        resolver,
        CancellationToken::new(),
    );

    let outcome = orchestrator.run(Dataset::read_csv(&input).unwrap()).await.unwrap();
    outcome.dataset.write_csv(&output).unwrap();

    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "Key,Name,Unnamed: 2,Status\nK1,Company K1,hand note,Active\n"
    );
}
