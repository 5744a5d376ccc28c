//! Database statistics.
//!
//! Summarizes what the local index, the fingerprint store, and the
//! interaction store hold. Used by `ragi stats`.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::dedup::{FingerprintStore, SqliteFingerprintStore};
use crate::index::{IndexedSource, SqliteIndex};
use crate::memory::{InteractionStore, SqliteInteractionStore};
use crate::models::FingerprintKind;

#[derive(Debug)]
pub struct Stats {
    pub chunks: i64,
    pub file_fingerprints: i64,
    pub chunk_fingerprints: i64,
    pub interactions: i64,
    pub important_interactions: i64,
    pub sources: Vec<IndexedSource>,
}

impl Stats {
    pub async fn collect(pool: &SqlitePool) -> Result<Self> {
        let index = SqliteIndex::new(pool.clone());
        let fingerprints = SqliteFingerprintStore::new(pool.clone());

        let interactions = SqliteInteractionStore::new(pool.clone()).count().await?;
        let important_interactions: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM interactions WHERE important = 1")
                .fetch_one(pool)
                .await?;

        Ok(Self {
            chunks: index.count_chunks().await?,
            file_fingerprints: fingerprints.count(FingerprintKind::File).await?,
            chunk_fingerprints: fingerprints.count(FingerprintKind::Chunk).await?,
            interactions,
            important_interactions,
            sources: index.list_sources().await?,
        })
    }
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = Stats::collect(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Ragi — Database Stats");
    println!("=====================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Sources:       {}", stats.sources.len());
    println!("  Chunks:        {}", stats.chunks);
    println!(
        "  Fingerprints:  {} files, {} chunks",
        stats.file_fingerprints, stats.chunk_fingerprints
    );
    println!(
        "  Interactions:  {} ({} important)",
        stats.interactions, stats.important_interactions
    );

    if !stats.sources.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<40} {:>8}   {}", "SOURCE", "CHUNKS", "INDEXED");
        println!("  {}", "-".repeat(66));
        for s in &stats.sources {
            println!(
                "  {:<40} {:>8}   {}",
                s.file_name,
                s.chunks,
                format_ts_relative(s.indexed_at / 1000)
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        format_ts_iso(ts)
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
