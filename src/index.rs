//! Vector index collaborators.
//!
//! The pipeline never embeds or searches; it hands an ordered batch of
//! chunk records to a [`VectorIndex`] and treats success as "indexed".
//!
//! | Implementation | Used for |
//! |----------------|----------|
//! | [`SqliteIndex`] | Local chunk table with FTS5; backs `ragi docs` and `ragi stats` |
//! | [`HttpIndex`] | POSTs batches to an external vector store |
//! | [`MemoryIndex`] | In-process index with failure injection |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::IndexConfig;
use crate::models::TextChunk;

/// One chunk as submitted to the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRecord {
    pub id: String,
    #[serde(skip)]
    pub source_id: String,
    #[serde(skip)]
    pub file_name: String,
    #[serde(skip)]
    pub chunk_index: usize,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl From<&TextChunk> for IndexRecord {
    fn from(chunk: &TextChunk) -> Self {
        Self {
            id: format!("{}-{}", chunk.source_id, chunk.index),
            source_id: chunk.source_id.clone(),
            file_name: chunk.metadata.get("file_name").cloned().unwrap_or_default(),
            chunk_index: chunk.index,
            text: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
        }
    }
}

/// An index rejection that retrying cannot fix (e.g. HTTP 4xx).
#[derive(Debug)]
pub struct PermanentIndexError(pub String);

impl fmt::Display for PermanentIndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PermanentIndexError {}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Add an ordered batch; either the whole batch is accepted or an error
    /// is returned.
    async fn add_batch(&self, batch: &[IndexRecord]) -> Result<()>;
}

pub fn build_index(config: &IndexConfig, pool: SqlitePool) -> Result<Arc<dyn VectorIndex>> {
    match config.kind.as_str() {
        "sqlite" => Ok(Arc::new(SqliteIndex::new(pool))),
        "http" => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("index.url required when index.kind = \"http\""))?;
            Ok(Arc::new(HttpIndex::new(url, Duration::from_secs(config.timeout_secs))?))
        }
        other => bail!("Unknown index kind: {}", other),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SQLite
// ═══════════════════════════════════════════════════════════════════════

/// Per-source summary of the local index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedSource {
    pub file_name: String,
    pub chunks: i64,
    pub indexed_at: i64,
}

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn list_sources(&self) -> Result<Vec<IndexedSource>> {
        let rows = sqlx::query(
            r#"
            SELECT file_name, COUNT(*) AS chunks, MAX(indexed_at) AS indexed_at
            FROM chunks
            GROUP BY file_name
            ORDER BY file_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| IndexedSource {
                file_name: row.get("file_name"),
                chunks: row.get("chunks"),
                indexed_at: row.get("indexed_at"),
            })
            .collect())
    }

    /// Remove every chunk indexed from `file_name`; returns the chunk count.
    pub async fn delete_source(&self, file_name: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE file_name = ?)",
        )
        .bind(file_name)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM chunks WHERE file_name = ?")
            .bind(file_name)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn add_batch(&self, batch: &[IndexRecord]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for record in batch {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, source_id, file_name, chunk_index, text, fingerprint, metadata_json, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    file_name = excluded.file_name,
                    text = excluded.text,
                    fingerprint = excluded.fingerprint,
                    metadata_json = excluded.metadata_json,
                    indexed_at = excluded.indexed_at
                "#,
            )
            .bind(&record.id)
            .bind(&record.source_id)
            .bind(&record.file_name)
            .bind(record.chunk_index as i64)
            .bind(&record.text)
            .bind(record.metadata.get("fingerprint").map(String::as_str).unwrap_or(""))
            .bind(serde_json::to_string(&record.metadata)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(&record.id)
                .execute(&mut *tx)
                .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, file_name, text) VALUES (?, ?, ?)")
                .bind(&record.id)
                .bind(&record.file_name)
                .bind(&record.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP
// ═══════════════════════════════════════════════════════════════════════

pub struct HttpIndex {
    client: reqwest::Client,
    url: String,
}

impl HttpIndex {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl VectorIndex for HttpIndex {
    fn name(&self) -> &str {
        "http"
    }

    async fn add_batch(&self, batch: &[IndexRecord]) -> Result<()> {
        let body = serde_json::json!({ "records": batch });
        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let body_text = response.text().await.unwrap_or_default();
        // Rate limited or server error: worth another attempt.
        if status.as_u16() == 429 || status.is_server_error() {
            bail!("index error {}: {}", status, body_text);
        }
        Err(PermanentIndexError(format!("index rejected batch {}: {}", status, body_text)).into())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// In-process
// ═══════════════════════════════════════════════════════════════════════

/// Index that keeps records in memory.
///
/// [`MemoryIndex::fail_next`] makes the next `n` calls fail, which is how
/// retry and give-up paths are driven without a network.
/// [`MemoryIndex::stall_for`] slows every call down the same way.
#[derive(Default)]
pub struct MemoryIndex {
    records: Mutex<Vec<IndexRecord>>,
    failures: AtomicU32,
    calls: AtomicU32,
    latency_ms: AtomicU64,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Delay each call by `latency` before it takes effect.
    pub fn stall_for(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<IndexRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn add_batch(&self, batch: &[IndexRecord]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("injected index failure");
        }
        self.records
            .lock()
            .map_err(|_| anyhow!("memory index lock poisoned"))?
            .extend_from_slice(batch);
        Ok(())
    }
}
