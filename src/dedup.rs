//! Duplicate detection over file and chunk fingerprints.
//!
//! A [`FingerprintStore`] maps `(kind, fingerprint)` to the name of the
//! first source that produced it. [`FingerprintStore::claim`] is an atomic
//! check-and-insert, so two concurrent runs can never both believe they own
//! the same content. Claims made during a run are collected in a
//! [`ClaimSet`] and withdrawn if the run ends before indexing succeeds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::models::{DuplicateRecord, FingerprintKind, TextChunk};

/// Result of an atomic claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    New,
    /// Already claimed; carries the first-seen source name.
    DuplicateOf(String),
}

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Record `fingerprint` for `source_name` unless it is already known.
    async fn claim(&self, kind: FingerprintKind, fingerprint: &str, source_name: &str) -> Result<Claim>;

    /// Withdraw a claim previously made by `source_name`.
    async fn release(&self, kind: FingerprintKind, fingerprint: &str, source_name: &str) -> Result<()>;

    async fn lookup(&self, kind: FingerprintKind, fingerprint: &str) -> Result<Option<DuplicateRecord>>;

    async fn count(&self, kind: FingerprintKind) -> Result<i64>;

    /// Drop every fingerprint owned by `source_name`, returning how many.
    async fn forget_source(&self, source_name: &str) -> Result<u64>;
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemoryFingerprintStore {
    records: Mutex<HashMap<(FingerprintKind, String), DuplicateRecord>>,
}

impl InMemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(FingerprintKind, String), DuplicateRecord>>> {
        self.records
            .lock()
            .map_err(|_| anyhow!("fingerprint store lock poisoned"))
    }
}

#[async_trait]
impl FingerprintStore for InMemoryFingerprintStore {
    async fn claim(&self, kind: FingerprintKind, fingerprint: &str, source_name: &str) -> Result<Claim> {
        let mut records = self.records()?;
        let key = (kind, fingerprint.to_string());
        if let Some(existing) = records.get(&key) {
            return Ok(Claim::DuplicateOf(existing.source_name.clone()));
        }
        records.insert(
            key,
            DuplicateRecord {
                kind,
                fingerprint: fingerprint.to_string(),
                source_name: source_name.to_string(),
                first_seen: Utc::now(),
            },
        );
        Ok(Claim::New)
    }

    async fn release(&self, kind: FingerprintKind, fingerprint: &str, source_name: &str) -> Result<()> {
        let mut records = self.records()?;
        let key = (kind, fingerprint.to_string());
        if records.get(&key).is_some_and(|r| r.source_name == source_name) {
            records.remove(&key);
        }
        Ok(())
    }

    async fn lookup(&self, kind: FingerprintKind, fingerprint: &str) -> Result<Option<DuplicateRecord>> {
        Ok(self.records()?.get(&(kind, fingerprint.to_string())).cloned())
    }

    async fn count(&self, kind: FingerprintKind) -> Result<i64> {
        Ok(self.records()?.keys().filter(|(k, _)| *k == kind).count() as i64)
    }

    async fn forget_source(&self, source_name: &str) -> Result<u64> {
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|_, r| r.source_name != source_name);
        Ok((before - records.len()) as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SQLite store
// ═══════════════════════════════════════════════════════════════════════

pub struct SqliteFingerprintStore {
    pool: SqlitePool,
}

impl SqliteFingerprintStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FingerprintStore for SqliteFingerprintStore {
    async fn claim(&self, kind: FingerprintKind, fingerprint: &str, source_name: &str) -> Result<Claim> {
        // A concurrent release can delete the winner between the insert and
        // the select; retry in that case.
        for _ in 0..3 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO fingerprints (kind, fingerprint, source_name, first_seen)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(kind, fingerprint) DO NOTHING
                "#,
            )
            .bind(kind.as_str())
            .bind(fingerprint)
            .bind(source_name)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                return Ok(Claim::New);
            }

            let owner: Option<String> = sqlx::query_scalar(
                "SELECT source_name FROM fingerprints WHERE kind = ? AND fingerprint = ?",
            )
            .bind(kind.as_str())
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(owner) = owner {
                return Ok(Claim::DuplicateOf(owner));
            }
        }
        bail!("fingerprint {} kept changing owner", fingerprint)
    }

    async fn release(&self, kind: FingerprintKind, fingerprint: &str, source_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM fingerprints WHERE kind = ? AND fingerprint = ? AND source_name = ?")
            .bind(kind.as_str())
            .bind(fingerprint)
            .bind(source_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn lookup(&self, kind: FingerprintKind, fingerprint: &str) -> Result<Option<DuplicateRecord>> {
        let row = sqlx::query(
            "SELECT source_name, first_seen FROM fingerprints WHERE kind = ? AND fingerprint = ?",
        )
        .bind(kind.as_str())
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let millis: i64 = row.get("first_seen");
            DuplicateRecord {
                kind,
                fingerprint: fingerprint.to_string(),
                source_name: row.get("source_name"),
                first_seen: Utc.timestamp_millis_opt(millis).single().unwrap_or_default(),
            }
        }))
    }

    async fn count(&self, kind: FingerprintKind) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fingerprints WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn forget_source(&self, source_name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM fingerprints WHERE source_name = ?")
            .bind(source_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Detector
// ═══════════════════════════════════════════════════════════════════════

/// Fingerprints claimed by one run, in claim order.
#[derive(Debug, Default)]
pub struct ClaimSet {
    source_name: String,
    claims: Vec<(FingerprintKind, String)>,
}

impl ClaimSet {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            claims: Vec::new(),
        }
    }

    /// Keep the claims; called once indexing has succeeded.
    pub fn commit(mut self) -> usize {
        let n = self.claims.len();
        self.claims.clear();
        n
    }
}

/// Chunks split into those to index and those already known.
#[derive(Debug, Default)]
pub struct ChunkFilter {
    pub kept: Vec<TextChunk>,
    /// `(chunk index, first-seen source name)` of each dropped chunk.
    pub dropped: Vec<(usize, String)>,
}

#[derive(Clone)]
pub struct DuplicateDetector {
    store: Arc<dyn FingerprintStore>,
}

impl DuplicateDetector {
    pub fn new(store: Arc<dyn FingerprintStore>) -> Self {
        Self { store }
    }

    /// Claim the whole-file fingerprint for the run owning `claims`.
    pub async fn check_file(&self, fingerprint: &str, claims: &mut ClaimSet) -> Result<Claim> {
        let claim = self
            .store
            .claim(FingerprintKind::File, fingerprint, &claims.source_name)
            .await?;
        if claim == Claim::New {
            claims.claims.push((FingerprintKind::File, fingerprint.to_string()));
        }
        Ok(claim)
    }

    /// Claim each chunk fingerprint in order, dropping chunks already known.
    ///
    /// Kept chunks retain their original indices so the batch stays ordered.
    pub async fn filter_chunks(&self, chunks: Vec<TextChunk>, claims: &mut ClaimSet) -> Result<ChunkFilter> {
        let mut filter = ChunkFilter::default();
        for chunk in chunks {
            match self
                .store
                .claim(FingerprintKind::Chunk, &chunk.fingerprint, &claims.source_name)
                .await?
            {
                Claim::New => {
                    claims
                        .claims
                        .push((FingerprintKind::Chunk, chunk.fingerprint.clone()));
                    filter.kept.push(chunk);
                }
                Claim::DuplicateOf(of) => {
                    debug!(
                        file = %claims.source_name,
                        chunk = chunk.index,
                        original = %of,
                        "Duplicate chunk excluded"
                    );
                    filter.dropped.push((chunk.index, of));
                }
            }
        }
        Ok(filter)
    }

    /// Withdraw every claim in `claims`, newest first.
    ///
    /// Release failures are logged; the remaining claims are still attempted.
    pub async fn rollback(&self, mut claims: ClaimSet) -> usize {
        let mut released = 0;
        while let Some((kind, fingerprint)) = claims.claims.pop() {
            match self
                .store
                .release(kind, &fingerprint, &claims.source_name)
                .await
            {
                Ok(()) => released += 1,
                Err(e) => warn!(
                    file = %claims.source_name,
                    kind = kind.as_str(),
                    error = %e,
                    "Failed to release fingerprint claim"
                ),
            }
        }
        released
    }
}
