//! Split-brain simulator for the in-process grid.
//!
//! Starts a grid, loads a baseline, splits it in two, lets both sides run a
//! randomized cache and multimap workload, heals the split with the
//! configured merge policy and reports what the merge decided.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_grid::event::NoopEventPublisher;
use holo_grid::merge::{MergePolicyRegistry, MergeReport, SplitBrainMerger};
use holo_grid::partition::{PartitionMetricsSnapshot, PartitionState};
use holo_grid::router::PartitionRouter;
use holo_grid::{GridConfig, InMemoryFormat, LocalGrid, ReplicaId, StructureConfig};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

const CACHE: &str = "sim-cache";
const MULTIMAP: &str = "sim-multimap";

#[derive(Parser, Debug)]
#[command(name = "holo-grid-sim")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a grid, diverge both sides, merge them back.
    Run(RunArgs),
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum FormatArg {
    Binary,
    Object,
}

impl From<FormatArg> for InMemoryFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Binary => InMemoryFormat::Binary,
            FormatArg::Object => InMemoryFormat::Object,
        }
    }
}

#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// JSON grid config. When set, the structure flags below are ignored.
    #[arg(long, env = "HOLO_GRID_CONFIG")]
    config: Option<PathBuf>,

    /// Merge policy applied to both simulated structures.
    #[arg(long, env = "HOLO_GRID_MERGE_POLICY", default_value = "put-if-absent")]
    merge_policy: String,

    #[arg(long, env = "HOLO_GRID_BACKUP_COUNT", default_value_t = 1)]
    backup_count: usize,

    #[arg(long, env = "HOLO_GRID_ASYNC_BACKUP_COUNT", default_value_t = 0)]
    async_backup_count: usize,

    #[arg(long, env = "HOLO_GRID_FORMAT", value_enum, default_value = "binary")]
    format: FormatArg,

    #[arg(long, env = "HOLO_GRID_PARTITIONS", default_value_t = 16)]
    partitions: u32,

    /// Number of distinct keys the workload touches.
    #[arg(long, default_value_t = 64)]
    keys: usize,

    /// Operations issued on each side of the split.
    #[arg(long, default_value_t = 500)]
    ops: usize,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// How long a transaction waits to reserve a key.
    #[arg(long, default_value = "5s")]
    lock_timeout: humantime::Duration,

    /// Write the merge summary as JSON to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct Summary {
    seed: u64,
    partitions: u32,
    reports: Vec<MergeReport>,
    cache_size: usize,
    multimap_size: usize,
    backup_mismatches: Vec<u32>,
    metrics: Vec<(ReplicaId, PartitionMetricsSnapshot)>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

fn grid_config(args: &RunArgs) -> anyhow::Result<GridConfig> {
    if let Some(path) = &args.config {
        return GridConfig::load(path);
    }
    let config = GridConfig::default().with_defaults(
        StructureConfig::default()
            .with_backup_count(args.backup_count)
            .with_async_backup_count(args.async_backup_count)
            .with_in_memory_format(args.format.into())
            .with_merge_policy(args.merge_policy.clone()),
    );
    config.validate()?;
    Ok(config)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.keys > 0, "--keys must be > 0");
    anyhow::ensure!(args.partitions > 0, "--partitions must be > 0");
    let config = grid_config(&args)?;
    let lock_timeout: Duration = args.lock_timeout.into();
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let keyspace: Vec<String> = (0..args.keys).map(|i| format!("k{i}")).collect();

    let first = LocalGrid::start("first", config.clone(), args.partitions, Arc::new(NoopEventPublisher))?;
    let mut rng = SmallRng::seed_from_u64(seed);
    for key in keyspace.iter().step_by(2) {
        first
            .cache(CACHE)
            .put(key, serde_json::json!(rng.gen_range(0..1000)))
            .await?;
    }
    tracing::info!(seed, keys = args.keys, "baseline loaded");

    let second = first.fork("second", Arc::new(NoopEventPublisher)).await?;
    let (a, b) = tokio::join!(
        diverge(&first, &keyspace, args.ops, seed ^ 0x9e37_79b9_7f4a_7c15, lock_timeout),
        diverge(&second, &keyspace, args.ops, seed.rotate_left(17), lock_timeout),
    );
    a.context("first side workload")?;
    b.context("second side workload")?;

    let merger = SplitBrainMerger::new(Arc::new(config), Arc::new(MergePolicyRegistry::default()));
    let reports = second.heal_into(&first, &merger).await?;
    for report in &reports {
        tracing::info!(report = %serde_json::to_string(report)?, "merge report");
    }

    let summary = Summary {
        seed,
        partitions: args.partitions,
        cache_size: first.cache(CACHE).size().await?,
        multimap_size: first.multimap(MULTIMAP).size().await?,
        backup_mismatches: backup_mismatches(&first).await?,
        metrics: first.metrics(),
        reports,
    };
    if !summary.backup_mismatches.is_empty() {
        tracing::warn!(partitions = ?summary.backup_mismatches, "backups diverge from primaries after merge");
    }
    tracing::info!(
        cache_size = summary.cache_size,
        multimap_size = summary.multimap_size,
        "split brain healed"
    );

    if let Some(out) = &args.out {
        let raw = serde_json::to_vec_pretty(&summary).context("encode summary")?;
        std::fs::write(out, raw).with_context(|| format!("write summary {}", out.display()))?;
    }
    first.shutdown().await
}

/// Random cache and multimap traffic against one side of the split.
async fn diverge(
    grid: &LocalGrid,
    keyspace: &[String],
    ops: usize,
    seed: u64,
    lock_timeout: Duration,
) -> anyhow::Result<()> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let cache = grid.cache(CACHE);
    for seq in 0..ops {
        let key = &keyspace[rng.gen_range(0..keyspace.len())];
        match rng.gen_range(0..10) {
            0..=3 => {
                cache
                    .put(key, serde_json::json!(format!("{}:{seq}", grid.label())))
                    .await?;
            }
            4..=6 => {
                cache.get(key).await?;
            }
            7 => {
                cache.remove(key).await?;
            }
            _ => {
                let mut txn = grid.transaction(MULTIMAP, lock_timeout);
                if rng.gen_bool(0.2) {
                    txn.remove_all(key).await?;
                } else {
                    txn.put(key, serde_json::json!(seq)).await?;
                }
                let outcome = txn.commit().await?;
                if !outcome.is_clean() {
                    tracing::debug!(?outcome, "transaction committed with conflicts");
                }
            }
        }
    }
    tracing::info!(grid = grid.label(), ops, "workload finished");
    Ok(())
}

/// Partitions whose first backup holds a different number of entries than
/// the primary.
async fn backup_mismatches(grid: &LocalGrid) -> anyhow::Result<Vec<u32>> {
    grid.barrier().await?;
    if grid.backups_per_partition() == 0 {
        return Ok(Vec::new());
    }
    let mut mismatched = Vec::new();
    for partition_id in 0..grid.partition_count() {
        let primary = grid
            .router()
            .owner(partition_id)?
            .read(entry_counts)
            .await?;
        let backup = grid.backup_read(partition_id, 0, entry_counts).await?;
        if primary != backup {
            mismatched.push(partition_id);
        }
    }
    Ok(mismatched)
}

fn entry_counts(state: &PartitionState) -> (usize, usize) {
    (
        state.cache(CACHE).map_or(0, |store| store.size()),
        state.container(MULTIMAP).map_or(0, |c| c.size()),
    )
}
