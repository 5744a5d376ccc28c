//! TOML configuration for Ragi.
//!
//! Every section except `[db]` and `[paths]` is optional; missing keys fall
//! back to the defaults below. [`load_config`] validates the parsed values
//! so the pipeline can assume a consistent configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Folder watched for new documents (not recursive).
    pub watch_dir: PathBuf,
    /// Destination for fully processed files.
    pub archive_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Extra file-name globs to ignore, on top of the built-in OS sentinels.
    #[serde(default)]
    pub ignore_globs: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            ignore_globs: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_ms: default_settle_ms(),
            max_wait_secs: default_max_wait_secs(),
            debounce_ms: default_debounce_ms(),
            max_concurrent_files: default_max_concurrent_files(),
            queue_capacity: default_queue_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    ["pdf", "csv", "json", "jsonl", "txt", "md"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_settle_ms() -> u64 {
    2_000
}
fn default_max_wait_secs() -> u64 {
    120
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_max_concurrent_files() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    256
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

/// Adaptive chunking tiers.
///
/// A document of `t` estimated tokens uses tier `i`, the first with
/// `t <= thresholds[i]`; documents above the last threshold use the last
/// tier. `sizes` and `overlaps` therefore hold one more entry than
/// `thresholds`.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<usize>,
    #[serde(default = "default_sizes")]
    pub sizes: Vec<usize>,
    #[serde(default = "default_overlaps")]
    pub overlaps: Vec<f64>,
    #[serde(default = "default_max_overlap_ratio")]
    pub max_overlap_ratio: f64,
    /// Search window around the target cut, as a fraction of the target size.
    #[serde(default = "default_boundary_tolerance")]
    pub boundary_tolerance: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            thresholds: default_thresholds(),
            sizes: default_sizes(),
            overlaps: default_overlaps(),
            max_overlap_ratio: default_max_overlap_ratio(),
            boundary_tolerance: default_boundary_tolerance(),
        }
    }
}

fn default_min_tokens() -> usize {
    128
}
fn default_max_tokens() -> usize {
    1_536
}
fn default_thresholds() -> Vec<usize> {
    vec![500, 2_000, 20_000]
}
fn default_sizes() -> Vec<usize> {
    vec![256, 512, 1_024, 1_536]
}
fn default_overlaps() -> Vec<f64> {
    vec![0.05, 0.10, 0.15, 0.20]
}
fn default_max_overlap_ratio() -> f64 {
    0.25
}
fn default_boundary_tolerance() -> f64 {
    0.15
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `sqlite` keeps chunks in the local database; `http` posts batches
    /// to an external vector store.
    #[serde(default = "default_index_kind")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: default_index_kind(),
            url: None,
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_index_kind() -> String {
    "sqlite".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1_000
}
fn default_timeout_secs() -> u64 {
    30
}

/// Longest accepted interaction retention window (a century).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    #[serde(default = "default_important_weight")]
    pub important_weight: f64,
    #[serde(default = "default_normal_weight")]
    pub normal_weight: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    /// Candidates fetched from the similarity filter before ranking.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            half_life_days: default_half_life_days(),
            important_weight: default_important_weight(),
            normal_weight: default_normal_weight(),
            top_k: default_top_k(),
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_query_chars: default_max_query_chars(),
            candidate_limit: default_candidate_limit(),
        }
    }
}

fn default_half_life_days() -> f64 {
    3.0
}
fn default_important_weight() -> f64 {
    2.0
}
fn default_normal_weight() -> f64 {
    1.0
}
fn default_top_k() -> usize {
    3
}
fn default_retention_days() -> i64 {
    3
}
fn default_sweep_interval_secs() -> u64 {
    3_600
}
fn default_max_query_chars() -> usize {
    1_500
}
fn default_candidate_limit() -> i64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate watch
    if config.watch.extensions.is_empty() {
        bail!("watch.extensions must not be empty");
    }
    if config.watch.max_concurrent_files == 0 {
        bail!("watch.max_concurrent_files must be >= 1");
    }
    if config.watch.queue_capacity == 0 {
        bail!("watch.queue_capacity must be >= 1");
    }
    if config.paths.watch_dir == config.paths.archive_dir {
        bail!("paths.archive_dir must differ from paths.watch_dir");
    }

    // Validate chunking
    let c = &config.chunking;
    if c.min_tokens == 0 {
        bail!("chunking.min_tokens must be > 0");
    }
    if c.min_tokens > c.max_tokens {
        bail!("chunking.min_tokens must be <= chunking.max_tokens");
    }
    if c.sizes.len() != c.thresholds.len() + 1 || c.overlaps.len() != c.sizes.len() {
        bail!(
            "chunking.sizes and chunking.overlaps need exactly one more entry than chunking.thresholds"
        );
    }
    if c.thresholds.windows(2).any(|w| w[0] >= w[1]) {
        bail!("chunking.thresholds must be strictly ascending");
    }
    if !(0.0..1.0).contains(&c.max_overlap_ratio) {
        bail!("chunking.max_overlap_ratio must be in [0.0, 1.0)");
    }
    if c.overlaps.iter().any(|o| !(0.0..1.0).contains(o)) {
        bail!("chunking.overlaps must be in [0.0, 1.0)");
    }
    if !(0.0..=0.5).contains(&c.boundary_tolerance) {
        bail!("chunking.boundary_tolerance must be in [0.0, 0.5]");
    }

    // Validate index
    match config.index.kind.as_str() {
        "sqlite" => {}
        "http" => {
            if config.index.url.as_deref().map_or(true, str::is_empty) {
                bail!("index.url must be specified when index.kind is 'http'");
            }
        }
        other => bail!(
            "Unknown index kind: '{}'. Must be sqlite or http.",
            other
        ),
    }
    if config.index.timeout_secs == 0 {
        bail!("index.timeout_secs must be > 0");
    }

    // Validate memory
    let m = &config.memory;
    if m.half_life_days <= 0.0 {
        bail!("memory.half_life_days must be > 0");
    }
    if m.normal_weight <= 0.0 {
        bail!("memory.normal_weight must be > 0");
    }
    if m.important_weight < m.normal_weight {
        bail!("memory.important_weight must be >= memory.normal_weight");
    }
    if m.top_k == 0 {
        bail!("memory.top_k must be >= 1");
    }
    if !(0..=MAX_RETENTION_DAYS).contains(&m.retention_days) {
        bail!("memory.retention_days must be in [0, {}]", MAX_RETENTION_DAYS);
    }
    if m.candidate_limit < 1 {
        bail!("memory.candidate_limit must be >= 1");
    }
    if m.sweep_interval_secs == 0 {
        bail!("memory.sweep_interval_secs must be > 0");
    }

    Ok(())
}
