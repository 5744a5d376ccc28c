//! Ingestion commands: `watch`, `scan`, and `ingest <path>`.
//!
//! Each command wires the SQLite fingerprint store and the configured
//! index into a [`Pipeline`], hands it to a [`Coordinator`], and prints
//! what happened on stdout. Progress and per-file detail go to the log.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::coordinator::{Coordinator, IngestReport, Outcome, Pipeline, RunSummary};
use crate::db;
use crate::dedup::{DuplicateDetector, SqliteFingerprintStore};
use crate::index::build_index;
use crate::memory::InteractionMemory;
use crate::migrate;
use crate::watcher::{list_candidates, spawn_watcher};

/// Open the database (creating the schema if needed) and build a coordinator
/// over it.
async fn open(config: &Config) -> Result<(SqlitePool, Coordinator)> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    std::fs::create_dir_all(&config.paths.watch_dir).with_context(|| {
        format!("creating watch dir {}", config.paths.watch_dir.display())
    })?;

    let detector = DuplicateDetector::new(Arc::new(SqliteFingerprintStore::new(pool.clone())));
    let index = build_index(&config.index, pool.clone())?;
    let pipeline = Pipeline::new(config, detector, index)?;
    Ok((pool, Coordinator::new(config, pipeline)))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            token.cancel();
        }
    });
    cancel
}

/// Run until Ctrl-C, ingesting files as they arrive.
pub async fn run_watch(config: &Config) -> Result<()> {
    let (pool, coordinator) = open(config).await?;
    let memory = Arc::new(InteractionMemory::sqlite(pool.clone(), &config.memory));
    let coordinator = coordinator.with_memory_sweep(
        memory,
        Duration::from_secs(config.memory.sweep_interval_secs),
    );
    let health = coordinator.health();

    let (tx, rx) = mpsc::channel(config.watch.queue_capacity);
    let watcher = spawn_watcher(
        &config.paths.watch_dir,
        Duration::from_millis(config.watch.debounce_ms),
        tx,
    )?;
    info!(dir = %watcher.dir().display(), "Watching");
    println!("watching {} (Ctrl-C to stop)", watcher.dir().display());

    let summary = coordinator.watch(rx, cancel_on_ctrl_c()).await?;
    drop(watcher);

    print_summary("watch", &summary);
    if !health.is_healthy() {
        warn!(error = ?health.last_error(), "Store was unavailable during the run");
    }
    pool.close().await;
    Ok(())
}

/// Process whatever is in the watched folder right now, then exit.
pub async fn run_scan(config: &Config) -> Result<()> {
    let (pool, coordinator) = open(config).await?;
    let paths = list_candidates(&config.paths.watch_dir)?;
    let summary = coordinator.run_once(paths, cancel_on_ctrl_c()).await?;

    for report in &summary.reports {
        println!("  {}", describe(report));
    }
    print_summary("scan", &summary);
    pool.close().await;
    Ok(())
}

/// Ingest a single file and print its outcome.
pub async fn run_ingest(config: &Config, path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("Not a file: {}", path.display());
    }
    let (pool, coordinator) = open(config).await?;
    let summary = coordinator
        .run_once(vec![PathBuf::from(path)], cancel_on_ctrl_c())
        .await?;
    pool.close().await;

    for report in &summary.reports {
        println!("{}", describe(report));
    }
    if summary.failed > 0 {
        bail!("Ingestion failed for {}", path.display());
    }
    Ok(())
}

/// One-line description of a file's outcome.
pub fn describe(report: &IngestReport) -> String {
    let name = report
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| report.path.display().to_string());

    match &report.outcome {
        Outcome::Archived {
            archived_to,
            chunks_indexed,
            chunks_duplicate,
        } => format!(
            "indexed {}: {} chunk(s), {} duplicate, archived to {}",
            name,
            chunks_indexed,
            chunks_duplicate,
            archived_to.display()
        ),
        Outcome::Duplicate { of, archived_to } => format!(
            "duplicate {} (same content as '{}'), archived to {}",
            name,
            of,
            archived_to.display()
        ),
        Outcome::Skipped(e) => format!("skipped {}: {}", name, e),
        Outcome::Failed(e) => format!("failed {}: {}", name, e),
        Outcome::RolledBack => format!("rolled back {}", name),
    }
}

fn print_summary(command: &str, summary: &RunSummary) {
    println!("{}", command);
    println!("  archived: {}", summary.archived);
    println!("  duplicates: {}", summary.duplicates);
    println!("  skipped: {}", summary.skipped);
    println!("  failed: {}", summary.failed);
    if summary.rolled_back > 0 {
        println!("  rolled back: {}", summary.rolled_back);
    }
    println!(
        "  chunks indexed: {} ({} duplicate)",
        summary.chunks_indexed, summary.chunks_duplicate
    );
}
