//! keyfill - batch key enrichment
//!
//! Resolves each distinct key in a CSV dataset once against an external
//! source, checkpoints progress so interrupted runs resume where they
//! stopped, and fills every row sharing the key from the cached record.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use keyfill::dataset::{backup_file, Dataset};
use keyfill::{CheckpointStore, EnrichmentOrchestrator, HttpResolver, Key};
use keyfill_common::config::{load_or_default, resolve_config_path, write_toml_config};
use keyfill_common::TomlConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "keyfill", version, about = "Enrich a dataset by resolving each distinct key once")]
struct Cli {
    /// Config file (overrides KEYFILL_CONFIG and ./keyfill.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve keys, checkpoint progress, and write the enriched dataset
    Enrich(EnrichArgs),
    /// Remove duplicate keys from a dataset, keeping the first occurrence
    Dedupe(DedupeArgs),
    /// Write a config file populated with defaults
    InitConfig {
        /// Destination path
        #[arg(default_value = "keyfill.toml")]
        path: PathBuf,
    },
}

#[derive(Debug, Args)]
struct EnrichArgs {
    /// Input CSV file
    #[arg(long, short)]
    input: PathBuf,
    /// Output CSV file (default: <input stem>_filled.<ext>)
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Checkpoint file (default: .<input stem>.checkpoint.json beside the input)
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Column holding the key
    #[arg(long)]
    key_column: Option<String>,
    /// Resolver URL with a {key} placeholder
    #[arg(long, env = "KEYFILL_URL_TEMPLATE")]
    url_template: Option<String>,
    /// Concurrent fetch tasks
    #[arg(long)]
    workers: Option<usize>,
    /// Base inter-request delay, seconds
    #[arg(long)]
    base_delay: Option<f64>,
    /// Maximum inter-request delay, seconds
    #[arg(long)]
    max_delay: Option<f64>,
    /// Completions between checkpoint flushes
    #[arg(long)]
    batch_size: Option<usize>,
    /// Re-fetch keys that previously resolved to nothing or failed
    #[arg(long)]
    force_retry_failed: bool,
    /// Skip the timestamped backup of the input file
    #[arg(long)]
    no_backup: bool,
}

#[derive(Debug, Args)]
struct DedupeArgs {
    /// Input CSV file
    input: PathBuf,
    /// Output CSV file (default: overwrite the input)
    output: Option<PathBuf>,
    /// Column holding the key
    #[arg(long)]
    key_column: Option<String>,
    /// Skip the timestamped backup of the input file
    #[arg(long)]
    no_backup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Subscriber first so config diagnostics are not dropped
    let log_level = keyfill::logging::init_tracing();
    info!("Starting keyfill v{}", env!("CARGO_PKG_VERSION"));

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = load_or_default(config_path.as_deref()).context("Failed to load configuration")?;
    log_level.apply(&config.logging.level);

    match cli.command {
        Command::Enrich(args) => enrich(config, args).await,
        Command::Dedupe(args) => dedupe(config, args),
        Command::InitConfig { path } => {
            write_toml_config(&TomlConfig::default(), &path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

async fn enrich(mut config: TomlConfig, args: EnrichArgs) -> Result<()> {
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    info!("Loading {}...", args.input.display());
    let dataset = Dataset::read_csv(&args.input)
        .with_context(|| format!("Failed to read dataset {}", args.input.display()))?;
    info!("Loaded {} rows", dataset.len());

    if !args.no_backup {
        match backup_file(&args.input, "backup") {
            Ok(backup) => info!("Backup created: {}", backup.display()),
            Err(e) => warn!("Could not create backup: {}", e),
        }
    }

    let resolver = match HttpResolver::from_config(&config.resolver)? {
        Some(resolver) => resolver,
        None => bail!("No resolver configured: set [resolver] url_template or pass --url-template"),
    };

    let checkpoint_path = args
        .checkpoint
        .clone()
        .or_else(|| config.run.checkpoint_path.clone())
        .unwrap_or_else(|| CheckpointStore::default_path_for(&args.input));
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input));

    let cancel = CancellationToken::new();
    let _signals = keyfill::shutdown::install_shutdown_handler(cancel.clone());

    let orchestrator = EnrichmentOrchestrator::new(
        &config,
        CheckpointStore::new(checkpoint_path),
        Arc::new(resolver),
        cancel,
    );
    let outcome = orchestrator.run(dataset).await?;

    info!("Saving {} rows to {}...", outcome.dataset.len(), output.display());
    if let Err(e) = outcome.dataset.write_csv(&output) {
        error!("Failed to write output: {}", e);
        return Err(e).with_context(|| format!("Failed to write {}", output.display()));
    }
    orchestrator.finish(&outcome)?;

    info!(
        "Summary: {} keys | {} successful | {} failed | {} fetched this run",
        outcome.distinct_keys,
        outcome.stats.successful,
        outcome.stats.failed,
        outcome.pool.dispatched - outcome.pool.skipped
    );
    if outcome.interrupted {
        warn!("Interrupted. Run again to resume from checkpoint.");
    } else if outcome.complete {
        info!("All done!");
    }
    Ok(())
}

fn apply_overrides(config: &mut TomlConfig, args: &EnrichArgs) {
    if let Some(key_column) = &args.key_column {
        config.merge.key_column = key_column.clone();
    }
    if let Some(template) = &args.url_template {
        config.resolver.url_template = Some(template.clone());
    }
    if let Some(workers) = args.workers {
        config.run.workers = workers;
    }
    if let Some(base_delay) = args.base_delay {
        config.run.base_delay_secs = base_delay;
    }
    if let Some(max_delay) = args.max_delay {
        config.run.max_delay_secs = max_delay;
    }
    if let Some(batch_size) = args.batch_size {
        config.run.batch_size = batch_size;
    }
    if args.force_retry_failed {
        config.run.force_retry_failed = true;
    }
}

fn default_output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("dataset");
    let file_name = match input.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_filled.{}", stem, ext),
        None => format!("{}_filled", stem),
    };
    input.with_file_name(file_name)
}

fn dedupe(config: TomlConfig, args: DedupeArgs) -> Result<()> {
    let key_column = args.key_column.unwrap_or(config.merge.key_column);

    info!("Loading {}...", args.input.display());
    let mut dataset = Dataset::read_csv(&args.input)
        .with_context(|| format!("Failed to read dataset {}", args.input.display()))?;
    let original_count = dataset.len();
    info!("Loaded {} rows", original_count);

    if !args.no_backup {
        match backup_file(&args.input, "before_dedup") {
            Ok(backup) => info!("Backup created: {}", backup.display()),
            Err(e) => warn!("Could not create backup: {}", e),
        }
    }

    let removed = dataset.deduplicate_by_key(&key_column)?;
    if removed.is_empty() {
        info!("No duplicate keys found - file is already clean");
        return Ok(());
    }

    info!("Found {} duplicate rows:", removed.len());
    let ranked = rank_duplicates(&removed);
    for (key, extra) in ranked.iter().take(10) {
        info!("  - {}: appears {} times", key, extra + 1);
    }
    if ranked.len() > 10 {
        info!("  ... and {} more", ranked.len() - 10);
    }

    let output = args.output.unwrap_or(args.input);
    info!("Saving {} unique rows to {}...", dataset.len(), output.display());
    dataset
        .write_csv(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("Done! Reduced from {} to {} rows", original_count, dataset.len());
    Ok(())
}

/// Duplicate counts per key, most duplicated first
fn rank_duplicates(removed: &[Key]) -> Vec<(&Key, usize)> {
    let mut counts: HashMap<&Key, usize> = HashMap::new();
    for key in removed {
        *counts.entry(key).or_default() += 1;
    }
    let mut ranked: Vec<(&Key, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
}
