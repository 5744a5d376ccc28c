//! Ingestion coordinator.
//!
//! [`Pipeline::process`] walks one file through the ingestion state
//! machine and returns an [`IngestReport`] with the transition trail:
//!
//! ```text
//! Detected → Validating → Extracting → Chunking → Deduplicating → Indexing → Archiving → Idle
//!                 │            │            └──────────┴──────────────┴──────────┴──▶ Detected (rolled back)
//!                 └────────────┴──▶ Skipped
//! ```
//!
//! [`Coordinator`] owns the poll loop: it lists the watched folder each
//! tick, consumes [`WatchEvent`]s, settles files with a
//! [`StabilityTracker`], and runs eligible files concurrently (bounded by a
//! semaphore, never two runs for the same path). On shutdown, runs that
//! have not reached indexing roll back their fingerprint claims and leave
//! the file in place; the rest get a grace period to finish, after which
//! runs still indexing are aborted and rolled back the same way.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, timeout, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::archive_file;
use crate::chunk::chunk_with_hints;
use crate::config::{ChunkingConfig, Config, IndexConfig, WatchConfig};
use crate::dedup::{Claim, ClaimSet, DuplicateDetector};
use crate::error::IngestError;
use crate::extract::{extract_text, ExtractError, Extracted};
use crate::fingerprint::file_fingerprint;
use crate::index::{IndexRecord, PermanentIndexError, VectorIndex};
use crate::memory::InteractionMemory;
use crate::models::{display_name, DocumentMeta, FileFormat, SourceFile};
use crate::stability::{Observation, SkipReason, StabilityTracker, StabilityValidator, Verdict};
use crate::watcher::{list_candidates, WatchEvent};

/// Where a file is in its ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Detected,
    Validating,
    Extracting,
    Chunking,
    Deduplicating,
    Indexing,
    Archiving,
    Skipped,
}

impl IngestState {
    pub fn can_advance_to(self, next: IngestState) -> bool {
        use IngestState::*;
        matches!(
            (self, next),
            (Idle, Detected)
                | (Detected, Validating)
                | (Validating, Extracting)
                | (Validating, Skipped)
                | (Extracting, Chunking)
                | (Extracting, Skipped)
                | (Chunking, Deduplicating)
                | (Deduplicating, Indexing)
                // file-level duplicate, or every chunk already indexed
                | (Deduplicating, Archiving)
                | (Indexing, Archiving)
                | (Archiving, Idle)
                // rollback: file stays in the watched folder
                | (Chunking, Detected)
                | (Deduplicating, Detected)
                | (Indexing, Detected)
                | (Archiving, Detected)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestState::Idle => "idle",
            IngestState::Detected => "detected",
            IngestState::Validating => "validating",
            IngestState::Extracting => "extracting",
            IngestState::Chunking => "chunking",
            IngestState::Deduplicating => "deduplicating",
            IngestState::Indexing => "indexing",
            IngestState::Archiving => "archiving",
            IngestState::Skipped => "skipped",
        }
    }
}

/// One file's run through the state machine.
#[derive(Debug)]
struct FileRun {
    path: PathBuf,
    name: String,
    trail: Vec<IngestState>,
}

impl FileRun {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            name: display_name(path),
            trail: vec![IngestState::Detected],
        }
    }

    fn state(&self) -> IngestState {
        self.trail.last().copied().unwrap_or(IngestState::Idle)
    }

    fn advance(&mut self, next: IngestState) {
        let current = self.state();
        if !current.can_advance_to(next) {
            error!(
                file = %self.name,
                from = current.as_str(),
                to = next.as_str(),
                "Illegal ingest transition"
            );
        }
        self.trail.push(next);
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Archived {
        archived_to: PathBuf,
        chunks_indexed: usize,
        chunks_duplicate: usize,
    },
    /// Whole-file duplicate: archived without indexing.
    Duplicate { of: String, archived_to: PathBuf },
    Skipped(IngestError),
    Failed(IngestError),
    /// Cancelled before indexing; claims withdrawn, file left in place.
    RolledBack,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub path: PathBuf,
    pub outcome: Outcome,
    pub trail: Vec<IngestState>,
}

impl IngestReport {
    pub fn error(&self) -> Option<&IngestError> {
        match &self.outcome {
            Outcome::Skipped(e) | Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn final_state(&self) -> IngestState {
        self.trail.last().copied().unwrap_or(IngestState::Idle)
    }

    fn skipped(path: &Path, reason: SkipReason) -> Self {
        Self {
            path: path.to_path_buf(),
            outcome: Outcome::Skipped(reason.into()),
            trail: vec![IngestState::Detected, IngestState::Validating, IngestState::Skipped],
        }
    }

    fn rolled_back(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            outcome: Outcome::RolledBack,
            trail: vec![IngestState::Detected],
        }
    }
}

/// Process-level health; flips when a shared store is unreachable.
#[derive(Debug)]
pub struct Health {
    healthy: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            last_error: Mutex::new(None),
        }
    }
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn report_store_failure(&self, message: &str) {
        if self.healthy.swap(false, Ordering::SeqCst) {
            error!(error = %message, "Store unavailable; marking unhealthy");
        }
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    pub fn store_ok(&self) {
        if !self.healthy.swap(true, Ordering::SeqCst) {
            info!("Store reachable again");
        }
    }
}

/// Two-stage stop signal for ingestion runs.
///
/// `cancel` stops a run at its next checkpoint before indexing. `abort`
/// also interrupts indexing in progress; either way the run withdraws its
/// claims and leaves the file in place.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    cancel: CancellationToken,
    abort: CancellationToken,
}

impl Shutdown {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            abort: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Interrupt runs that are past the point of cancellation.
    pub fn abort(&self) {
        self.abort.cancel();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Pipeline: one file
// ═══════════════════════════════════════════════════════════════════════

pub struct Pipeline {
    validator: StabilityValidator,
    chunking: ChunkingConfig,
    index_config: IndexConfig,
    archive_dir: PathBuf,
    detector: DuplicateDetector,
    index: Arc<dyn VectorIndex>,
    health: Arc<Health>,
}

impl Pipeline {
    pub fn new(config: &Config, detector: DuplicateDetector, index: Arc<dyn VectorIndex>) -> Result<Self> {
        Ok(Self {
            validator: StabilityValidator::new(&config.watch)?,
            chunking: config.chunking.clone(),
            index_config: config.index.clone(),
            archive_dir: config.paths.archive_dir.clone(),
            detector,
            index,
            health: Arc::new(Health::default()),
        })
    }

    pub fn health(&self) -> Arc<Health> {
        self.health.clone()
    }

    pub fn validator(&self) -> &StabilityValidator {
        &self.validator
    }

    /// Run one settled file through extraction, chunking, dedup, indexing
    /// and archival.
    pub async fn process(&self, path: &Path, shutdown: &Shutdown) -> IngestReport {
        let mut run = FileRun::new(path);
        let outcome = self.drive(&mut run, shutdown).await;
        log_outcome(&run.name, &outcome);
        IngestReport {
            path: run.path,
            outcome,
            trail: run.trail,
        }
    }

    async fn drive(&self, run: &mut FileRun, shutdown: &Shutdown) -> Outcome {
        run.advance(IngestState::Validating);
        let detected = match self.validate(&run.path).await {
            Ok(detected) => detected,
            Err(reason) => {
                run.advance(IngestState::Skipped);
                return Outcome::Skipped(reason.into());
            }
        };

        run.advance(IngestState::Extracting);
        let Some(format) = detected else {
            run.advance(IngestState::Skipped);
            return Outcome::Skipped(ExtractError::unsupported(&run.path).into());
        };
        let path = run.path.clone();
        let extracted = tokio::task::spawn_blocking(move || -> Result<(String, Extracted), IngestError> {
            let bytes = std::fs::read(&path).map_err(|e| SkipReason::Unreadable(e.to_string()))?;
            let fingerprint = file_fingerprint(&bytes);
            Ok((fingerprint, extract_text(&bytes, format)?))
        })
        .await;
        let (source_id, extracted) = match extracted {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                run.advance(IngestState::Skipped);
                return Outcome::Skipped(e);
            }
            Err(e) => {
                run.advance(IngestState::Skipped);
                return Outcome::Failed(IngestError::Internal(e.to_string()));
            }
        };

        run.advance(IngestState::Chunking);
        let meta = DocumentMeta {
            source_id: source_id.clone(),
            file_name: run.name.clone(),
            format,
        };
        let chunking = self.chunking.clone();
        let chunks = match tokio::task::spawn_blocking(move || {
            chunk_with_hints(&extracted.text, &extracted.hints.offsets, &meta, &chunking)
        })
        .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                run.advance(IngestState::Detected);
                return Outcome::Failed(IngestError::Internal(e.to_string()));
            }
        };
        if shutdown.is_cancelled() {
            run.advance(IngestState::Detected);
            return Outcome::RolledBack;
        }

        run.advance(IngestState::Deduplicating);
        let mut claims = ClaimSet::new(run.name.clone());
        match self.claim_file(&source_id, &mut claims).await {
            Ok(()) => {}
            Err(IngestError::DuplicateDetected { of }) => {
                info!(file = %run.name, original = %of, "Duplicate file; archiving without indexing");
                run.advance(IngestState::Archiving);
                return match self.archive(&run.path).await {
                    Ok(archived_to) => {
                        run.advance(IngestState::Idle);
                        Outcome::Duplicate { of, archived_to }
                    }
                    Err(e) => {
                        run.advance(IngestState::Detected);
                        Outcome::Failed(e)
                    }
                };
            }
            Err(err) => return self.abandon(run, claims, Outcome::Failed(err)).await,
        }

        let filter = match self.detector.filter_chunks(chunks, &mut claims).await {
            Ok(filter) => filter,
            Err(e) => {
                let err = self.store_failure(e);
                return self.abandon(run, claims, Outcome::Failed(err)).await;
            }
        };
        self.health.store_ok();
        if shutdown.is_cancelled() {
            return self.abandon(run, claims, Outcome::RolledBack).await;
        }

        let chunks_duplicate = filter.dropped.len();
        let chunks_indexed = filter.kept.len();
        if chunks_indexed > 0 {
            run.advance(IngestState::Indexing);
            let records: Vec<IndexRecord> = filter.kept.iter().map(IndexRecord::from).collect();
            let name = run.name.clone();
            let indexed = tokio::select! {
                indexed = self.index_with_retry(&records, &name) => indexed,
                _ = shutdown.abort.cancelled() => {
                    warn!(file = %name, "Shutdown grace elapsed while indexing; rolling back");
                    return self.abandon(run, claims, Outcome::RolledBack).await;
                }
            };
            if let Err(e) = indexed {
                return self.abandon(run, claims, Outcome::Failed(e)).await;
            }
        } else {
            info!(file = %run.name, "Every chunk already indexed");
        }
        claims.commit();

        run.advance(IngestState::Archiving);
        match self.archive(&run.path).await {
            Ok(archived_to) => {
                run.advance(IngestState::Idle);
                Outcome::Archived {
                    archived_to,
                    chunks_indexed,
                    chunks_duplicate,
                }
            }
            Err(e) => {
                run.advance(IngestState::Detected);
                Outcome::Failed(e)
            }
        }
    }

    async fn validate(&self, path: &Path) -> Result<Option<FileFormat>, SkipReason> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| SkipReason::Unreadable(e.to_string()))?;
        if !meta.is_file() {
            return Err(SkipReason::NotAFile);
        }
        self.validator.screen(path, meta.len())
    }

    /// Claim the whole-file fingerprint; content already claimed by another
    /// source comes back as [`IngestError::DuplicateDetected`].
    async fn claim_file(&self, source_id: &str, claims: &mut ClaimSet) -> Result<(), IngestError> {
        match self.detector.check_file(source_id, claims).await {
            Ok(Claim::New) => Ok(()),
            Ok(Claim::DuplicateOf(of)) => {
                self.health.store_ok();
                Err(IngestError::DuplicateDetected { of })
            }
            Err(e) => Err(self.store_failure(e)),
        }
    }

    async fn index_with_retry(&self, records: &[IndexRecord], file: &str) -> Result<(), IngestError> {
        let attempts = self.index_config.max_retries + 1;
        let limit = Duration::from_secs(self.index_config.timeout_secs);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                // Exponential backoff: base, 2×base, 4×base, ...
                let delay = Duration::from_millis(self.index_config.backoff_ms << (attempt - 2).min(6));
                tokio::time::sleep(delay).await;
            }

            match timeout(limit, self.index.add_batch(records)).await {
                Ok(Ok(())) => {
                    debug!(file = %file, chunks = records.len(), index = self.index.name(), "Batch indexed");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    reason = format!("{:#}", e);
                    if e.downcast_ref::<PermanentIndexError>().is_some() {
                        return Err(IngestError::IndexingFailure { attempts: attempt, reason });
                    }
                }
                Err(_) => reason = format!("timed out after {}s", limit.as_secs()),
            }
            warn!(file = %file, attempt, max = attempts, error = %reason, "Indexing attempt failed");
        }

        Err(IngestError::IndexingFailure { attempts, reason })
    }

    async fn archive(&self, path: &Path) -> Result<PathBuf, IngestError> {
        let path = path.to_path_buf();
        let dir = self.archive_dir.clone();
        match tokio::task::spawn_blocking(move || archive_file(&path, &dir)).await {
            Ok(Ok(dest)) => Ok(dest),
            Ok(Err(e)) => Err(IngestError::Archive(format!("{:#}", e))),
            Err(e) => Err(IngestError::Internal(e.to_string())),
        }
    }

    fn store_failure(&self, err: anyhow::Error) -> IngestError {
        let err = IngestError::store(err);
        self.health.report_store_failure(&err.to_string());
        err
    }

    async fn abandon(&self, run: &mut FileRun, claims: ClaimSet, outcome: Outcome) -> Outcome {
        let released = self.detector.rollback(claims).await;
        debug!(file = %run.name, released, "Fingerprint claims withdrawn");
        run.advance(IngestState::Detected);
        outcome
    }
}

fn log_outcome(file: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Archived {
            archived_to,
            chunks_indexed,
            chunks_duplicate,
        } => info!(
            file = %file,
            chunks = chunks_indexed,
            duplicate_chunks = chunks_duplicate,
            archived_to = %archived_to.display(),
            "Ingested"
        ),
        Outcome::Duplicate { of, archived_to } => info!(
            file = %file,
            original = %of,
            archived_to = %archived_to.display(),
            "Archived duplicate"
        ),
        Outcome::Skipped(e) => warn!(file = %file, error = %e, "Skipped; left in place"),
        Outcome::Failed(e @ IngestError::IndexingFailure { .. }) => {
            error!(file = %file, error = %e, "Indexing gave up; left for manual review")
        }
        Outcome::Failed(e) => error!(file = %file, error = %e, "Ingestion failed; left in place"),
        Outcome::RolledBack => info!(file = %file, "Rolled back on shutdown; left in place"),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Coordinator: the poll loop
// ═══════════════════════════════════════════════════════════════════════

/// Counts of what a coordinator run did.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub archived: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub chunks_indexed: usize,
    pub chunks_duplicate: usize,
    /// Every report, kept only for one-shot runs.
    pub reports: Vec<IngestReport>,
}

impl RunSummary {
    fn record(&mut self, report: IngestReport, keep: bool) {
        match &report.outcome {
            Outcome::Archived {
                chunks_indexed,
                chunks_duplicate,
                ..
            } => {
                self.archived += 1;
                self.chunks_indexed += chunks_indexed;
                self.chunks_duplicate += chunks_duplicate;
            }
            Outcome::Duplicate { .. } => self.duplicates += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failed(_) => self.failed += 1,
            Outcome::RolledBack => self.rolled_back += 1,
        }
        if keep {
            self.reports.push(report);
        }
    }
}

pub struct Coordinator {
    pipeline: Arc<Pipeline>,
    watch: WatchConfig,
    watch_dir: PathBuf,
    sweep: Option<(Arc<InteractionMemory>, Duration)>,
}

impl Coordinator {
    pub fn new(config: &Config, pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            watch: config.watch.clone(),
            watch_dir: config.paths.watch_dir.clone(),
            sweep: None,
        }
    }

    /// Also run the interaction retention sweep every `every`, starting
    /// immediately.
    pub fn with_memory_sweep(mut self, memory: Arc<InteractionMemory>, every: Duration) -> Self {
        self.sweep = Some((memory, every));
        self
    }

    pub fn health(&self) -> Arc<Health> {
        self.pipeline.health()
    }

    /// Watch until `cancel` fires. Files already in the folder are picked
    /// up on the first tick.
    pub async fn watch(self, events: mpsc::Receiver<WatchEvent>, cancel: CancellationToken) -> Result<RunSummary> {
        let initial = list_candidates(&self.watch_dir)?;
        self.drive(initial, Some(events), cancel, false).await
    }

    /// Settle and process `paths`, returning once every one has an outcome.
    pub async fn run_once(self, paths: Vec<PathBuf>, cancel: CancellationToken) -> Result<RunSummary> {
        self.drive(paths, None, cancel, true).await
    }

    async fn drive(
        self,
        initial: Vec<PathBuf>,
        mut events: Option<mpsc::Receiver<WatchEvent>>,
        cancel: CancellationToken,
        until_idle: bool,
    ) -> Result<RunSummary> {
        let Coordinator {
            pipeline,
            watch,
            watch_dir,
            sweep,
        } = self;

        let mut state = LoopState::new(pipeline.validator().clone(), initial, until_idle);
        let shutdown = Shutdown::new(cancel.clone());
        let semaphore = Arc::new(Semaphore::new(watch.max_concurrent_files));
        let mut tasks: JoinSet<IngestReport> = JoinSet::new();

        let mut ticker = interval(Duration::from_millis(watch.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweeper = sweep.as_ref().map(|(_, every)| interval(*every));

        info!(
            dir = %watch_dir.display(),
            files = state.pending.len(),
            concurrency = watch.max_concurrent_files,
            "Coordinator started"
        );

        loop {
            if until_idle && state.pending.is_empty() && tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if !until_idle {
                        state.enqueue_listing(&watch_dir);
                    }
                    for file in state.observe_pending() {
                        spawn_run(&mut tasks, &pipeline, &semaphore, &state.in_flight, file.path, &shutdown);
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    state.handle_join(joined);
                }
                event = next_event(&mut events) => {
                    match event {
                        Some(WatchEvent::Changed(path)) => {
                            if let Some(name) = path.file_name() {
                                state.pending.insert(watch_dir.join(name));
                            }
                        }
                        Some(WatchEvent::Rescan) => state.enqueue_listing(&watch_dir),
                        None => {
                            debug!("Event channel closed; polling only");
                            events = None;
                        }
                    }
                }
                _ = next_tick(&mut sweeper) => {
                    if let Some((memory, _)) = &sweep {
                        match memory.sweep().await {
                            Ok(removed) => info!(removed, "Interaction retention sweep"),
                            Err(e) => pipeline.health.report_store_failure(&format!("{:#}", e)),
                        }
                    }
                }
            }
        }

        let grace = Duration::from_secs(watch.shutdown_grace_secs);
        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), grace_secs = grace.as_secs(), "Waiting for in-flight files");
        }
        if !drain(&mut tasks, &mut state, grace).await {
            warn!(remaining = tasks.len(), "Grace period elapsed; rolling back runs still indexing");
            shutdown.abort();
            if !drain(&mut tasks, &mut state, ABORT_SETTLE).await {
                error!(remaining = tasks.len(), "Runs did not stop after abort; killing them");
                tasks.abort_all();
                while let Some(joined) = tasks.join_next().await {
                    state.handle_join(joined);
                }
            }
        }

        let summary = state.summary;
        info!(
            archived = summary.archived,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            failed = summary.failed,
            rolled_back = summary.rolled_back,
            "Coordinator stopped"
        );
        Ok(summary)
    }
}

/// How long aborted runs get to withdraw their claims.
const ABORT_SETTLE: Duration = Duration::from_secs(10);

/// Join runs until none are left or `limit` passes; true if all finished.
async fn drain(tasks: &mut JoinSet<IngestReport>, state: &mut LoopState, limit: Duration) -> bool {
    timeout(limit, async {
        while let Some(joined) = tasks.join_next().await {
            state.handle_join(joined);
        }
    })
    .await
    .is_ok()
}

async fn next_event(events: &mut Option<mpsc::Receiver<WatchEvent>>) -> Option<WatchEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn spawn_run(
    tasks: &mut JoinSet<IngestReport>,
    pipeline: &Arc<Pipeline>,
    semaphore: &Arc<Semaphore>,
    in_flight: &Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
    shutdown: &Shutdown,
) {
    let guard = PathGuard::acquire(in_flight.clone(), path.clone());
    let pipeline = pipeline.clone();
    let semaphore = semaphore.clone();
    let shutdown = shutdown.clone();

    tasks.spawn(async move {
        let _guard = guard;
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit,
            _ = shutdown.cancel.cancelled() => return IngestReport::rolled_back(&path),
        };
        let Ok(_permit) = permit else {
            return IngestReport::rolled_back(&path);
        };
        pipeline.process(&path, &shutdown).await
    });
}

/// Marks a path as in flight until dropped.
struct PathGuard {
    set: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl PathGuard {
    fn acquire(set: Arc<Mutex<HashSet<PathBuf>>>, path: PathBuf) -> Self {
        set.lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.clone());
        Self { set, path }
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.path);
    }
}

struct LoopState {
    tracker: StabilityTracker,
    /// Paths waiting to settle.
    pending: BTreeSet<PathBuf>,
    /// Paths left alone until their size or mtime changes.
    parked: HashMap<PathBuf, (u64, SystemTime)>,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
    summary: RunSummary,
    one_shot: bool,
}

impl LoopState {
    fn new(validator: StabilityValidator, initial: Vec<PathBuf>, one_shot: bool) -> Self {
        Self {
            tracker: StabilityTracker::new(validator),
            pending: initial.into_iter().collect(),
            parked: HashMap::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            summary: RunSummary::default(),
            one_shot,
        }
    }

    fn enqueue_listing(&mut self, dir: &Path) {
        match list_candidates(dir) {
            Ok(paths) => {
                let listed: HashSet<&PathBuf> = paths.iter().collect();
                self.parked.retain(|path, _| listed.contains(path));
                self.pending.extend(paths);
            }
            Err(e) => warn!(dir = %dir.display(), error = %format!("{:#}", e), "Failed to list watched folder"),
        }
    }

    fn is_in_flight(&self, path: &Path) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }

    /// Observe every pending path once; returns the ones now eligible.
    fn observe_pending(&mut self) -> Vec<SourceFile> {
        let now = Instant::now();
        let mut eligible = Vec::new();
        let paths: Vec<PathBuf> = self.pending.iter().cloned().collect();

        for path in paths {
            if self.is_in_flight(&path) {
                self.pending.remove(&path);
                continue;
            }

            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    self.pending.remove(&path);
                    self.tracker.forget(&path);
                    self.parked.remove(&path);
                    if self.one_shot {
                        self.skip(&path, SkipReason::Unreadable(e.to_string()));
                    }
                    continue;
                }
            };
            let obs = Observation::from_metadata(&meta, now);

            if let Some(parked) = self.parked.get(&path) {
                if *parked == (obs.size, obs.modified) {
                    self.pending.remove(&path);
                    self.tracker.forget(&path);
                    continue;
                }
                debug!(path = %path.display(), "Parked file changed; retrying");
                self.parked.remove(&path);
            }

            match self.tracker.observe(&path, obs) {
                Verdict::Deferred => {}
                Verdict::Eligible(file) => {
                    debug!(
                        path = %path.display(),
                        format = ?file.format,
                        size = file.size,
                        state = ?file.state,
                        "Settled"
                    );
                    self.pending.remove(&path);
                    eligible.push(file);
                }
                Verdict::Skip(reason) => {
                    self.pending.remove(&path);
                    self.parked.insert(path.clone(), (obs.size, obs.modified));
                    self.skip(&path, reason);
                }
            }
        }
        eligible
    }

    fn skip(&mut self, path: &Path, reason: SkipReason) {
        match &reason {
            SkipReason::Hidden | SkipReason::SystemFile | SkipReason::UnsupportedExtension(_) => {
                debug!(path = %path.display(), reason = %reason, "Ignored")
            }
            SkipReason::NeverStabilized { .. } => {
                warn!(path = %path.display(), reason = %reason, "Still changing; left for next cycle")
            }
            _ => info!(path = %path.display(), reason = %reason, "Skipped"),
        }
        self.summary
            .record(IngestReport::skipped(path, reason), self.one_shot);
    }

    fn handle_join(&mut self, joined: Result<IngestReport, JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Ingestion task did not finish");
                self.summary.failed += 1;
                return;
            }
        };

        if report.error().is_some_and(IngestError::parks_file) {
            // A tick may have re-observed the path while the run held it.
            self.tracker.forget(&report.path);
            if let Ok(meta) = std::fs::metadata(&report.path) {
                let obs = Observation::from_metadata(&meta, Instant::now());
                self.parked.insert(report.path.clone(), (obs.size, obs.modified));
            }
        }
        self.summary.record(report, self.one_shot);
    }
}
