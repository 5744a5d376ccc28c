//! Interaction memory: stored question/answer exchanges ranked by recency
//! and importance.
//!
//! Each exchange is keyed by the SHA-256 of its normalized query and
//! response, so repeating an exchange never creates a second record; it
//! can only upgrade the existing record's importance flag.
//!
//! Ranking does not look at text similarity. A [`CandidateSource`] narrows
//! the records to plausible matches (FTS5 keyword search in SQLite), then
//! [`MemoryScorer`] orders them by
//!
//! ```text
//! score = weight(important) × 0.5^(age_days / half_life_days)
//! ```
//!
//! and keeps the top `k`. A retention sweep deletes non-important records
//! older than the configured age.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::fingerprint::{exchange_key, normalize_exchange_text, strip_sources_section};
use crate::models::InteractionRecord;

/// FTS5 queries use at most this many distinct terms.
const MAX_QUERY_TERMS: usize = 16;

// ═══════════════════════════════════════════════════════════════════════
// Scoring
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct ScoredInteraction {
    pub record: InteractionRecord,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct MemoryScorer {
    half_life_days: f64,
    important_weight: f64,
    normal_weight: f64,
    top_k: usize,
}

impl MemoryScorer {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            half_life_days: config.half_life_days,
            important_weight: config.important_weight,
            normal_weight: config.normal_weight,
            top_k: config.top_k,
        }
    }

    /// `0.5^(age / half_life)`; ages in the future count as zero.
    pub fn decay(&self, age: Duration) -> f64 {
        let days = age.num_milliseconds().max(0) as f64 / 86_400_000.0;
        0.5f64.powf(days / self.half_life_days)
    }

    pub fn weight(&self, important: bool) -> f64 {
        if important {
            self.important_weight
        } else {
            self.normal_weight
        }
    }

    pub fn score(&self, record: &InteractionRecord, now: DateTime<Utc>) -> f64 {
        self.weight(record.important) * self.decay(now - record.created_at)
    }

    /// Best `top_k` records, highest score first; ties go to the newer
    /// record, then the smaller id.
    pub fn rank(&self, records: Vec<InteractionRecord>, now: DateTime<Utc>) -> Vec<ScoredInteraction> {
        let mut scored: Vec<ScoredInteraction> = records
            .into_iter()
            .map(|record| ScoredInteraction {
                score: self.score(&record, now),
                record,
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        scored.truncate(self.top_k);
        scored
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Store traits
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same key already exists; nothing was written.
    Existing(InteractionRecord),
}

#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// Insert unless a record with the same `memory_key` exists.
    async fn insert(&self, record: &InteractionRecord) -> Result<InsertOutcome>;

    /// Raise the importance flag of `id`. The flag never goes back down;
    /// returns whether the record changed.
    async fn update_importance(&self, id: &str, important: bool) -> Result<bool>;

    async fn find_by_key(&self, memory_key: &str) -> Result<Option<InteractionRecord>>;

    /// Every record, newest first.
    async fn list_all(&self) -> Result<Vec<InteractionRecord>>;

    /// Delete non-important records created before `cutoff`.
    async fn delete_older_than_unless_important(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn count(&self) -> Result<i64>;
}

/// Narrows stored records to plausible matches for a query.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn candidates(&self, query: &str, limit: i64) -> Result<Vec<InteractionRecord>>;
}

/// Lowercased distinct alphanumeric terms of `text`, in first-seen order.
fn query_terms(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| seen.insert(t.clone()))
        .take(MAX_QUERY_TERMS)
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// SQLite
// ═══════════════════════════════════════════════════════════════════════

pub struct SqliteInteractionStore {
    pool: SqlitePool,
}

impl SqliteInteractionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &SqliteRow) -> InteractionRecord {
    let created: i64 = row.get("created_at");
    let important: i64 = row.get("important");
    InteractionRecord {
        id: row.get("id"),
        memory_key: row.get("memory_key"),
        query: row.get("query"),
        response: row.get("response"),
        created_at: Utc.timestamp_millis_opt(created).single().unwrap_or_default(),
        important: important != 0,
    }
}

const SELECT_INTERACTION: &str =
    "SELECT id, memory_key, query, response, created_at, important FROM interactions";

#[async_trait]
impl InteractionStore for SqliteInteractionStore {
    async fn insert(&self, record: &InteractionRecord) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO interactions (id, memory_key, query, response, created_at, important)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(memory_key) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.memory_key)
        .bind(&record.query)
        .bind(&record.response)
        .bind(record.created_at.timestamp_millis())
        .bind(record.important as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let outcome = if inserted == 1 {
            sqlx::query("INSERT INTO interactions_fts (interaction_id, query, response) VALUES (?, ?, ?)")
                .bind(&record.id)
                .bind(&record.query)
                .bind(&record.response)
                .execute(&mut *tx)
                .await?;
            InsertOutcome::Inserted
        } else {
            let row = sqlx::query(&format!("{} WHERE memory_key = ?", SELECT_INTERACTION))
                .bind(&record.memory_key)
                .fetch_one(&mut *tx)
                .await?;
            InsertOutcome::Existing(row_to_record(&row))
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn update_importance(&self, id: &str, important: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE interactions SET important = ? WHERE id = ? AND important < ?")
            .bind(important as i64)
            .bind(id)
            .bind(important as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_key(&self, memory_key: &str) -> Result<Option<InteractionRecord>> {
        let row = sqlx::query(&format!("{} WHERE memory_key = ?", SELECT_INTERACTION))
            .bind(memory_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_record))
    }

    async fn list_all(&self) -> Result<Vec<InteractionRecord>> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at DESC, id", SELECT_INTERACTION))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn delete_older_than_unless_important(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = cutoff.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM interactions_fts WHERE interaction_id IN (
                SELECT id FROM interactions WHERE created_at < ? AND important = 0
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM interactions WHERE created_at < ? AND important = 0")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }

    async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM interactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl CandidateSource for SqliteInteractionStore {
    async fn candidates(&self, query: &str, limit: i64) -> Result<Vec<InteractionRecord>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            let rows = sqlx::query(&format!("{} ORDER BY created_at DESC LIMIT ?", SELECT_INTERACTION))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
            return Ok(rows.iter().map(row_to_record).collect());
        }

        // Quote every term so FTS5 operators in user text stay literal.
        let fts_query = terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR ");

        let rows = sqlx::query(&format!(
            r#"
            {} WHERE id IN (
                SELECT interaction_id FROM interactions_fts
                WHERE interactions_fts MATCH ?
                ORDER BY rank
                LIMIT ?
            )
            "#,
            SELECT_INTERACTION
        ))
        .bind(&fts_query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemoryInteractionStore {
    records: Mutex<HashMap<String, InteractionRecord>>,
}

impl InMemoryInteractionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, InteractionRecord>>> {
        self.records
            .lock()
            .map_err(|_| anyhow!("interaction store lock poisoned"))
    }
}

fn newest_first(a: &InteractionRecord, b: &InteractionRecord) -> Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl InteractionStore for InMemoryInteractionStore {
    async fn insert(&self, record: &InteractionRecord) -> Result<InsertOutcome> {
        let mut records = self.records()?;
        if let Some(existing) = records.get(&record.memory_key) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        records.insert(record.memory_key.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update_importance(&self, id: &str, important: bool) -> Result<bool> {
        let mut records = self.records()?;
        match records.values_mut().find(|r| r.id == id) {
            Some(record) if important && !record.important => {
                record.important = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_by_key(&self, memory_key: &str) -> Result<Option<InteractionRecord>> {
        Ok(self.records()?.get(memory_key).cloned())
    }

    async fn list_all(&self) -> Result<Vec<InteractionRecord>> {
        let mut all: Vec<_> = self.records()?.values().cloned().collect();
        all.sort_by(newest_first);
        Ok(all)
    }

    async fn delete_older_than_unless_important(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|_, r| r.important || r.created_at >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn count(&self) -> Result<i64> {
        Ok(self.records()?.len() as i64)
    }
}

#[async_trait]
impl CandidateSource for InMemoryInteractionStore {
    async fn candidates(&self, query: &str, limit: i64) -> Result<Vec<InteractionRecord>> {
        let terms = query_terms(query);
        let mut hits: Vec<(usize, InteractionRecord)> = self
            .records()?
            .values()
            .filter_map(|r| {
                let haystack = query_terms(&format!("{} {}", r.query, r.response));
                let overlap = terms.iter().filter(|t| haystack.contains(t)).count();
                (terms.is_empty() || overlap > 0).then(|| (overlap, r.clone()))
            })
            .collect();
        hits.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| newest_first(&a.1, &b.1)));
        Ok(hits
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, r)| r)
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Facade
// ═══════════════════════════════════════════════════════════════════════

/// What storing an exchange did.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Inserted(InteractionRecord),
    /// Existing record flipped to important.
    Upgraded(InteractionRecord),
    /// Existing record left as it was.
    Unchanged(InteractionRecord),
}

impl StoreOutcome {
    pub fn record(&self) -> &InteractionRecord {
        match self {
            StoreOutcome::Inserted(r) | StoreOutcome::Upgraded(r) | StoreOutcome::Unchanged(r) => r,
        }
    }
}

pub struct InteractionMemory {
    store: Arc<dyn InteractionStore>,
    candidates: Option<Arc<dyn CandidateSource>>,
    scorer: MemoryScorer,
    config: MemoryConfig,
}

impl InteractionMemory {
    pub fn new(store: Arc<dyn InteractionStore>, config: &MemoryConfig) -> Self {
        Self {
            store,
            candidates: None,
            scorer: MemoryScorer::new(config),
            config: config.clone(),
        }
    }

    /// SQLite-backed memory with FTS5 candidate filtering.
    pub fn sqlite(pool: SqlitePool, config: &MemoryConfig) -> Self {
        let store = Arc::new(SqliteInteractionStore::new(pool));
        Self::new(store.clone(), config).with_candidates(store)
    }

    pub fn with_candidates(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.candidates = Some(source);
        self
    }

    pub async fn remember(&self, query: &str, response: &str, important: bool) -> Result<StoreOutcome> {
        self.remember_at(query, response, important, Utc::now()).await
    }

    /// Store an exchange as of `now`, or upgrade the importance of an
    /// identical earlier one.
    pub async fn remember_at(
        &self,
        query: &str,
        response: &str,
        important: bool,
        now: DateTime<Utc>,
    ) -> Result<StoreOutcome> {
        let query: String = strip_sources_section(query)
            .chars()
            .take(self.config.max_query_chars)
            .collect();
        let response = strip_sources_section(response);
        let memory_key = exchange_key(
            &normalize_exchange_text(&query),
            &normalize_exchange_text(response),
        );

        let record = InteractionRecord {
            id: Uuid::new_v4().to_string(),
            memory_key,
            query,
            response: response.to_string(),
            created_at: now,
            important,
        };

        match self.store.insert(&record).await? {
            InsertOutcome::Inserted => {
                info!(id = %record.id, important, "Stored new interaction");
                Ok(StoreOutcome::Inserted(record))
            }
            InsertOutcome::Existing(mut existing) => {
                if important && self.store.update_importance(&existing.id, true).await? {
                    info!(id = %existing.id, "Interaction marked important");
                    existing.important = true;
                    Ok(StoreOutcome::Upgraded(existing))
                } else {
                    debug!(id = %existing.id, "Duplicate interaction; no update needed");
                    Ok(StoreOutcome::Unchanged(existing))
                }
            }
        }
    }

    pub async fn recall(&self, query: &str) -> Result<Vec<ScoredInteraction>> {
        self.recall_at(query, Utc::now()).await
    }

    /// Candidate records for `query`, ranked by recency and importance.
    pub async fn recall_at(&self, query: &str, now: DateTime<Utc>) -> Result<Vec<ScoredInteraction>> {
        let records = match &self.candidates {
            Some(source) => source.candidates(query, self.config.candidate_limit).await?,
            None => self.store.list_all().await?,
        };
        Ok(self.scorer.rank(records, now))
    }

    pub async fn list(&self) -> Result<Vec<InteractionRecord>> {
        self.store.list_all().await
    }

    pub async fn sweep(&self) -> Result<u64> {
        self.sweep_at(Utc::now()).await
    }

    /// Delete non-important records older than the retention window.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let Some(cutoff) = Duration::try_days(self.config.retention_days)
            .and_then(|window| now.checked_sub_signed(window))
        else {
            // Window reaches before the earliest representable time.
            debug!(retention_days = self.config.retention_days, "Retention window unbounded; nothing to sweep");
            return Ok(0);
        };
        let removed = self.store.delete_older_than_unless_important(cutoff).await?;
        if removed > 0 {
            info!(removed, retention_days = self.config.retention_days, "Deleted old interactions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn record(id: &str, age_days: i64, important: bool, now: DateTime<Utc>) -> InteractionRecord {
        InteractionRecord {
            id: id.into(),
            memory_key: format!("key-{}", id),
            query: format!("query {}", id),
            response: "response".into(),
            created_at: now - Duration::days(age_days),
            important,
        }
    }

    fn scorer() -> MemoryScorer {
        MemoryScorer::new(&MemoryConfig::default())
    }

    #[test]
    fn decay_halves_every_half_life() {
        let s = scorer();
        assert!((s.decay(Duration::zero()) - 1.0).abs() < 1e-12);
        assert!((s.decay(Duration::days(3)) - 0.5).abs() < 1e-12);
        assert!((s.decay(Duration::days(6)) - 0.25).abs() < 1e-12);
        assert!((s.decay(Duration::days(-2)) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn newer_scores_at_least_older() {
        let s = scorer();
        let now = Utc::now();
        for important in [false, true] {
            for age in 0..30 {
                let newer = s.score(&record("a", age, important, now), now);
                let older = s.score(&record("b", age + 1, important, now), now);
                assert!(newer >= older);
            }
        }
    }

    #[test]
    fn importance_never_hurts_at_equal_age() {
        let s = scorer();
        let now = Utc::now();
        for age in [0, 1, 5, 40] {
            assert!(
                s.score(&record("i", age, true, now), now) >= s.score(&record("n", age, false, now), now)
            );
        }
    }

    #[test]
    fn rank_keeps_top_k_with_stable_ties() {
        let s = scorer();
        let now = Utc::now();
        let ranked = s.rank(
            vec![
                record("old", 9, false, now),
                record("b", 1, false, now),
                record("a", 1, false, now),
                record("vip", 6, true, now),
            ],
            now,
        );
        let ids: Vec<_> = ranked.iter().map(|r| r.record.id.as_str()).collect();
        // vip: 2 × 0.25 = 0.5; a/b: 0.5^(1/3) ≈ 0.79
        assert_eq!(ids, vec!["a", "b", "vip"]);
    }

    #[test]
    fn query_terms_are_distinct_and_lowercased() {
        assert_eq!(query_terms("What is RAG? what IS rag!"), vec!["what", "is", "rag"]);
        assert!(query_terms("?!").is_empty());
    }

    #[tokio::test]
    async fn repeat_exchange_upgrades_importance() {
        let memory = InteractionMemory::new(Arc::new(InMemoryInteractionStore::new()), &MemoryConfig::default());

        let first = memory
            .remember("what is RAG?", "Retrieval augmented generation.", false)
            .await
            .unwrap();
        assert!(matches!(first, StoreOutcome::Inserted(_)));

        let second = memory
            .remember("What is **RAG**?", "Retrieval augmented generation.\n\nSources: rag.pdf", true)
            .await
            .unwrap();
        assert!(matches!(second, StoreOutcome::Upgraded(_)));
        assert_eq!(second.record().id, first.record().id);
        assert_eq!(second.record().created_at, first.record().created_at);

        let third = memory
            .remember("what is RAG?", "Retrieval augmented generation.", false)
            .await
            .unwrap();
        assert!(matches!(third, StoreOutcome::Unchanged(ref r) if r.important));

        let all = memory.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].important);
    }

    #[tokio::test]
    async fn long_queries_are_truncated() {
        let config = MemoryConfig {
            max_query_chars: 10,
            ..MemoryConfig::default()
        };
        let memory = InteractionMemory::new(Arc::new(InMemoryInteractionStore::new()), &config);
        let stored = memory.remember(&"é".repeat(50), "answer", false).await.unwrap();
        assert_eq!(stored.record().query.chars().count(), 10);
    }

    #[tokio::test]
    async fn sweep_spares_important_and_recent() {
        let now = Utc::now();
        let store = Arc::new(InMemoryInteractionStore::new());
        for r in [
            record("old", 10, false, now),
            record("old-vip", 10, true, now),
            record("fresh", 1, false, now),
        ] {
            store.insert(&r).await.unwrap();
        }
        let memory = InteractionMemory::new(store.clone(), &MemoryConfig::default());
        assert_eq!(memory.sweep_at(now).await.unwrap(), 1);

        let ids: Vec<_> = memory.list().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["fresh", "old-vip"]);
    }

    #[tokio::test]
    async fn sweep_with_huge_retention_deletes_nothing() {
        let now = Utc::now();
        let store = Arc::new(InMemoryInteractionStore::new());
        store.insert(&record("ancient", 10_000, false, now)).await.unwrap();
        let config = MemoryConfig {
            retention_days: 1_000_000_000,
            ..MemoryConfig::default()
        };
        let memory = InteractionMemory::new(store, &config);
        assert_eq!(memory.sweep_at(now).await.unwrap(), 0);
        assert_eq!(memory.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sqlite_store_dedups_and_searches() {
        let pool = db::connect_in_memory().await.unwrap();
        let memory = InteractionMemory::sqlite(pool, &MemoryConfig::default());

        memory
            .remember("what is RAG?", "Retrieval augmented generation.", false)
            .await
            .unwrap();
        memory
            .remember("how do I bake bread?", "Flour, water, salt, yeast.", false)
            .await
            .unwrap();
        let again = memory
            .remember("what is RAG?", "Retrieval augmented generation.", true)
            .await
            .unwrap();
        assert!(matches!(again, StoreOutcome::Upgraded(_)));
        assert_eq!(memory.list().await.unwrap().len(), 2);

        let hits = memory.recall("tell me about rag").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].record.important);
        assert_eq!(
            hits[0].record.conversation(),
            "User: what is RAG?\nAI: Retrieval augmented generation."
        );
    }

    #[tokio::test]
    async fn sqlite_sweep_removes_fts_rows() {
        let pool = db::connect_in_memory().await.unwrap();
        let store = SqliteInteractionStore::new(pool.clone());
        let now = Utc::now();
        store.insert(&record("old", 10, false, now)).await.unwrap();
        store.insert(&record("vip", 10, true, now)).await.unwrap();

        let removed = store
            .delete_older_than_unless_important(now - Duration::days(3))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let fts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM interactions_fts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fts, 1);
    }
}
