//! Managing documents already in the local index (`ragi docs`).

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::dedup::{FingerprintStore, SqliteFingerprintStore};
use crate::index::SqliteIndex;
use crate::stats::format_ts_relative;

/// What deleting one source removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removed {
    pub chunks: u64,
    pub fingerprints: u64,
}

/// Delete a source's chunks and forget its fingerprints, so the same file
/// can be ingested again.
pub async fn delete_source(pool: &SqlitePool, file_name: &str) -> Result<Removed> {
    let chunks = SqliteIndex::new(pool.clone()).delete_source(file_name).await?;
    let fingerprints = SqliteFingerprintStore::new(pool.clone())
        .forget_source(file_name)
        .await?;
    info!(file = %file_name, chunks, fingerprints, "Deleted source");
    Ok(Removed {
        chunks,
        fingerprints,
    })
}

pub async fn run_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let sources = SqliteIndex::new(pool.clone()).list_sources().await?;

    if sources.is_empty() {
        println!("No documents indexed.");
    } else {
        println!("{:<40} {:>8}   {}", "SOURCE", "CHUNKS", "INDEXED");
        for s in &sources {
            println!(
                "{:<40} {:>8}   {}",
                s.file_name,
                s.chunks,
                format_ts_relative(s.indexed_at / 1000)
            );
        }
    }

    pool.close().await;
    Ok(())
}

pub async fn run_delete(config: &Config, file_name: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let removed = delete_source(&pool, file_name).await?;
    pool.close().await;

    if removed.chunks == 0 && removed.fingerprints == 0 {
        bail!("No indexed document named '{}'", file_name);
    }
    println!(
        "Deleted '{}': {} chunk(s), {} fingerprint(s).",
        file_name, removed.chunks, removed.fingerprints
    );
    Ok(())
}
