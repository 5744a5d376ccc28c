//! `ragi memory` subcommands.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::memory::{InteractionMemory, StoreOutcome};
use crate::models::InteractionRecord;

async fn open(config: &Config) -> Result<(sqlx::SqlitePool, InteractionMemory)> {
    let pool = db::connect(config).await?;
    let memory = InteractionMemory::sqlite(pool.clone(), &config.memory);
    Ok((pool, memory))
}

pub async fn run_store(config: &Config, query: &str, response: &str, important: bool) -> Result<()> {
    let (pool, memory) = open(config).await?;
    let outcome = memory.remember(query, response, important).await?;
    pool.close().await;

    match &outcome {
        StoreOutcome::Inserted(r) => println!("stored {}", r.id),
        StoreOutcome::Upgraded(r) => println!("marked {} as important", r.id),
        StoreOutcome::Unchanged(r) => println!("already stored as {}", r.id),
    }
    Ok(())
}

pub async fn run_list(config: &Config) -> Result<()> {
    let (pool, memory) = open(config).await?;
    let records = memory.list().await?;
    pool.close().await;

    if records.is_empty() {
        println!("No interactions stored.");
        return Ok(());
    }
    for record in &records {
        print_record(record, None);
    }
    Ok(())
}

pub async fn run_recall(config: &Config, query: &str) -> Result<()> {
    let (pool, memory) = open(config).await?;
    let hits = memory.recall(query).await?;
    pool.close().await;

    if hits.is_empty() {
        println!("No matching interactions.");
        return Ok(());
    }
    for hit in &hits {
        print_record(&hit.record, Some(hit.score));
    }
    Ok(())
}

pub async fn run_sweep(config: &Config) -> Result<()> {
    let (pool, memory) = open(config).await?;
    let deleted = memory.sweep().await?;
    pool.close().await;

    println!(
        "swept {} interaction(s) older than {} day(s)",
        deleted, config.memory.retention_days
    );
    Ok(())
}

fn print_record(record: &InteractionRecord, score: Option<f64>) {
    let mut header = format!(
        "[{}] {}",
        record.id,
        record.created_at.format("%Y-%m-%d %H:%M")
    );
    if record.important {
        header.push_str(" (important)");
    }
    if let Some(score) = score {
        header.push_str(&format!(" score={:.3}", score));
    }
    println!("{}", header);
    println!("{}", record.conversation());
    println!();
}
