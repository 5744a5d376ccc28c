//! Idempotent schema setup for the fingerprint store, the local chunk
//! index, and the interaction store.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One namespace per kind; the primary key makes claims atomic.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fingerprints (
            kind TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            source_name TEXT NOT NULL,
            first_seen INTEGER NOT NULL,
            PRIMARY KEY (kind, fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            indexed_at INTEGER NOT NULL,
            UNIQUE(source_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS interactions (
            id TEXT PRIMARY KEY,
            memory_key TEXT NOT NULL UNIQUE,
            query TEXT NOT NULL,
            response TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            important INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    for (name, ddl) in [
        (
            "chunks_fts",
            "CREATE VIRTUAL TABLE chunks_fts USING fts5(chunk_id UNINDEXED, file_name UNINDEXED, text)",
        ),
        (
            "interactions_fts",
            "CREATE VIRTUAL TABLE interactions_fts USING fts5(interaction_id UNINDEXED, query, response)",
        ),
    ] {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?",
        )
        .bind(name)
        .fetch_one(pool)
        .await?;

        if !exists {
            sqlx::query(ddl).execute(pool).await?;
        }
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file_name ON chunks(file_name)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_interactions_created_at ON interactions(created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fingerprints_source ON fingerprints(source_name)")
        .execute(pool)
        .await?;

    Ok(())
}
