//! Decides whether a file in the watched folder is safe to ingest.
//!
//! Two layers:
//!
//! 1. [`StabilityValidator::screen`] — static checks on the name and size
//!    (hidden files, OS sentinels, partial downloads, unsupported
//!    extensions, zero-byte files).
//! 2. [`StabilityTracker::observe`] — a file is stable once its size and
//!    modification time are unchanged across two observations at least one
//!    settle interval apart. Files that keep changing past the maximum wait
//!    window are given up on for this cycle.
//!
//! Neither layer touches the filesystem; callers stat the file and pass an
//! [`Observation`] in, which keeps the decision deterministic under test.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use thiserror::Error;

use crate::config::WatchConfig;
use crate::models::{FileFormat, SourceFile, StabilityState};

/// File names left behind by operating systems, editors, and browsers.
const SENTINEL_GLOBS: &[&str] = &[
    "Thumbs.db",
    "ehthumbs.db",
    "desktop.ini",
    "Icon\r",
    "~$*",
    "*~",
    "*.tmp",
    "*.part",
    "*.crdownload",
    "*.download",
    "*.swp",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("hidden file")]
    Hidden,
    #[error("system or temporary file")]
    SystemFile,
    #[error("unsupported extension '{0}'")]
    UnsupportedExtension(String),
    #[error("file is empty")]
    Empty,
    #[error("not a regular file")]
    NotAFile,
    #[error("file did not stabilize within {}s", .waited.as_secs())]
    NeverStabilized { waited: Duration },
    #[error("file disappeared or is unreadable: {0}")]
    Unreadable(String),
}

/// One stat of a file, stamped with when it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub size: u64,
    pub modified: SystemTime,
    pub at: Instant,
}

impl Observation {
    pub fn from_metadata(meta: &Metadata, at: Instant) -> Self {
        Self {
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            at,
        }
    }

    fn same_content_as(&self, other: &Observation) -> bool {
        self.size == other.size && self.modified == other.modified
    }
}

/// Outcome of observing a file once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Eligible(SourceFile),
    Deferred,
    Skip(SkipReason),
}

/// Static eligibility rules plus settle timing.
#[derive(Debug, Clone)]
pub struct StabilityValidator {
    sentinels: GlobSet,
    extensions: Vec<String>,
    settle: Duration,
    max_wait: Duration,
}

impl StabilityValidator {
    pub fn new(config: &WatchConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in SENTINEL_GLOBS
            .iter()
            .copied()
            .chain(config.ignore_globs.iter().map(String::as_str))
        {
            builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
        }
        Ok(Self {
            sentinels: builder.build()?,
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            settle: Duration::from_millis(config.settle_ms),
            max_wait: Duration::from_secs(config.max_wait_secs),
        })
    }

    /// Static checks on name and size. Returns the detected format, or
    /// `None` for an allowed extension no extractor understands.
    pub fn screen(&self, path: &Path, size: u64) -> Result<Option<FileFormat>, SkipReason> {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => return Err(SkipReason::NotAFile),
        };
        if name.starts_with('.') {
            return Err(SkipReason::Hidden);
        }
        if self.sentinels.is_match(name) {
            return Err(SkipReason::SystemFile);
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !self.extensions.iter().any(|e| *e == ext) {
            return Err(SkipReason::UnsupportedExtension(ext));
        }
        if size == 0 {
            return Err(SkipReason::Empty);
        }
        Ok(FileFormat::from_extension(&ext))
    }
}

struct Tracked {
    file: SourceFile,
    first_seen: Instant,
    /// Earliest observation with the current size and mtime.
    steady_since: Observation,
}

/// Per-path settle bookkeeping for the coordinator's poll loop.
pub struct StabilityTracker {
    validator: StabilityValidator,
    files: HashMap<PathBuf, Tracked>,
}

impl StabilityTracker {
    pub fn new(validator: StabilityValidator) -> Self {
        Self {
            validator,
            files: HashMap::new(),
        }
    }

    /// Record an observation of `path` and decide what to do with it.
    ///
    /// `Eligible` and `Skip` end tracking for the path; a later call starts
    /// a fresh settle cycle.
    pub fn observe(&mut self, path: &Path, obs: Observation) -> Verdict {
        let format = match self.validator.screen(path, obs.size) {
            Ok(format) => format,
            Err(reason) => {
                self.files.remove(path);
                return Verdict::Skip(reason);
            }
        };

        if !self.files.contains_key(path) {
            self.files.insert(
                path.to_path_buf(),
                Tracked {
                    file: SourceFile {
                        path: path.to_path_buf(),
                        format,
                        size: obs.size,
                        modified: obs.modified,
                        state: StabilityState::Settling,
                    },
                    first_seen: obs.at,
                    steady_since: obs,
                },
            );
            return Verdict::Deferred;
        }
        let Some(tracked) = self.files.get_mut(path) else {
            return Verdict::Deferred;
        };

        if !obs.same_content_as(&tracked.steady_since) {
            tracked.steady_since = obs;
            tracked.file.size = obs.size;
            tracked.file.modified = obs.modified;
            tracked.file.state = StabilityState::Settling;
        } else if obs.at.saturating_duration_since(tracked.steady_since.at) >= self.validator.settle
        {
            if let Some(Tracked { mut file, .. }) = self.files.remove(path) {
                file.state = StabilityState::Stable;
                return Verdict::Eligible(file);
            }
            return Verdict::Deferred;
        }

        let waited = obs.at.saturating_duration_since(tracked.first_seen);
        if waited >= self.validator.max_wait {
            self.files.remove(path);
            return Verdict::Skip(SkipReason::NeverStabilized { waited });
        }
        Verdict::Deferred
    }

    pub fn forget(&mut self, path: &Path) {
        self.files.remove(path);
    }

    pub fn is_tracking(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> StabilityValidator {
        let config = WatchConfig {
            settle_ms: 2_000,
            max_wait_secs: 10,
            ..WatchConfig::default()
        };
        StabilityValidator::new(&config).unwrap()
    }

    fn obs(size: u64, mtime_secs: u64, at: Instant) -> Observation {
        Observation {
            size,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_secs),
            at,
        }
    }

    #[test]
    fn screen_rejects_hidden_and_sentinels() {
        let v = validator();
        assert_eq!(v.screen(Path::new("/in/.notes.md"), 10), Err(SkipReason::Hidden));
        assert_eq!(v.screen(Path::new("/in/Thumbs.db"), 10), Err(SkipReason::SystemFile));
        assert_eq!(v.screen(Path::new("/in/~$report.txt"), 10), Err(SkipReason::SystemFile));
        assert_eq!(
            v.screen(Path::new("/in/paper.pdf.crdownload"), 10),
            Err(SkipReason::SystemFile)
        );
    }

    #[test]
    fn screen_rejects_unsupported_extension() {
        let v = validator();
        assert_eq!(
            v.screen(Path::new("/in/slides.pptx"), 10),
            Err(SkipReason::UnsupportedExtension("pptx".into()))
        );
        assert_eq!(
            v.screen(Path::new("/in/README"), 10),
            Err(SkipReason::UnsupportedExtension(String::new()))
        );
    }

    #[test]
    fn screen_rejects_zero_byte_file() {
        assert_eq!(validator().screen(Path::new("/in/empty.txt"), 0), Err(SkipReason::Empty));
    }

    #[test]
    fn screen_detects_format() {
        let v = validator();
        assert_eq!(v.screen(Path::new("/in/A.PDF"), 10), Ok(Some(FileFormat::Pdf)));
        assert_eq!(v.screen(Path::new("/in/rows.csv"), 10), Ok(Some(FileFormat::Csv)));
    }

    #[test]
    fn screen_passes_allowed_extension_without_extractor() {
        let config = WatchConfig {
            extensions: vec!["txt".into(), "docx".into()],
            ..WatchConfig::default()
        };
        let v = StabilityValidator::new(&config).unwrap();
        assert_eq!(v.screen(Path::new("/in/memo.docx"), 10), Ok(None));
        assert_eq!(
            v.screen(Path::new("/in/notes.md"), 10),
            Err(SkipReason::UnsupportedExtension("md".into()))
        );
    }

    #[test]
    fn stable_after_settle_interval() {
        let mut tracker = StabilityTracker::new(validator());
        let path = Path::new("/in/notes.md");
        let t0 = Instant::now();

        assert_eq!(tracker.observe(path, obs(100, 1, t0)), Verdict::Deferred);
        assert_eq!(
            tracker.observe(path, obs(100, 1, t0 + Duration::from_millis(500))),
            Verdict::Deferred
        );
        let Verdict::Eligible(file) = tracker.observe(path, obs(100, 1, t0 + Duration::from_millis(2_000))) else {
            panic!("expected the file to be eligible");
        };
        assert_eq!(file.path, path);
        assert_eq!(file.format, Some(FileFormat::Markdown));
        assert_eq!(file.size, 100);
        assert_eq!(file.state, StabilityState::Stable);
        assert!(!tracker.is_tracking(path));
    }

    #[test]
    fn growing_file_stays_deferred() {
        let mut tracker = StabilityTracker::new(validator());
        let path = Path::new("/in/upload.txt");
        let t0 = Instant::now();

        for step in 0..4u64 {
            let at = t0 + Duration::from_secs(step * 2);
            let verdict = tracker.observe(path, obs(100 + step * 50, step, at));
            assert_eq!(verdict, Verdict::Deferred, "step {}", step);
        }
        assert!(tracker.is_tracking(path));
    }

    #[test]
    fn gives_up_after_max_wait() {
        let mut tracker = StabilityTracker::new(validator());
        let path = Path::new("/in/stream.csv");
        let t0 = Instant::now();

        tracker.observe(path, obs(1, 0, t0));
        let verdict = tracker.observe(path, obs(2, 1, t0 + Duration::from_secs(11)));
        assert!(matches!(
            verdict,
            Verdict::Skip(SkipReason::NeverStabilized { .. })
        ));
        assert!(!tracker.is_tracking(path));
    }

    #[test]
    fn mtime_change_resets_settle() {
        let mut tracker = StabilityTracker::new(validator());
        let path = Path::new("/in/data.json");
        let t0 = Instant::now();

        tracker.observe(path, obs(10, 1, t0));
        // Same size, touched: not stable yet even though 2s elapsed.
        assert_eq!(
            tracker.observe(path, obs(10, 2, t0 + Duration::from_secs(2))),
            Verdict::Deferred
        );
        assert!(matches!(
            tracker.observe(path, obs(10, 2, t0 + Duration::from_secs(4))),
            Verdict::Eligible(SourceFile { format: Some(FileFormat::Json), .. })
        ));
    }

    #[test]
    fn skip_drops_tracking() {
        let mut tracker = StabilityTracker::new(validator());
        let path = Path::new("/in/notes.txt");
        let t0 = Instant::now();
        tracker.observe(path, obs(5, 1, t0));
        assert!(tracker.is_tracking(path));
        // Truncated to zero while settling.
        assert_eq!(
            tracker.observe(path, obs(0, 2, t0 + Duration::from_secs(1))),
            Verdict::Skip(SkipReason::Empty)
        );
        assert!(!tracker.is_tracking(path));
    }
}
