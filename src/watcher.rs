//! Filesystem notifications for the watched folder.
//!
//! Debounced `notify` events are forwarded into the coordinator's bounded
//! channel as [`WatchEvent::Changed`]. The debouncer thread never blocks:
//! when the channel is full the event is dropped, and the coordinator's
//! periodic rescan picks the file up instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A path in the watched folder was created or modified.
    Changed(PathBuf),
    /// Re-list the whole folder.
    Rescan,
}

/// Keeps the OS watch alive; dropping it stops notifications.
pub struct FolderWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    dir: PathBuf,
}

impl FolderWatcher {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Start watching `dir` (non-recursively) and feed events into `tx`.
pub fn spawn_watcher(
    dir: &Path,
    debounce: Duration,
    tx: mpsc::Sender<WatchEvent>,
) -> Result<FolderWatcher> {
    let mut debouncer = new_debouncer(
        debounce,
        move |events: Result<Vec<DebouncedEvent>, notify::Error>| {
            let events = match events {
                Ok(evts) => evts,
                Err(e) => {
                    warn!(error = %e, "Watch error; requesting rescan");
                    let _ = tx.try_send(WatchEvent::Rescan);
                    return;
                }
            };

            for event in events {
                match tx.try_send(WatchEvent::Changed(event.path)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        debug!(event = ?dropped, "Event queue full; left for rescan");
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
        },
    )
    .context("creating folder watcher")?;

    debouncer
        .watcher()
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", dir.display()))?;

    Ok(FolderWatcher {
        _debouncer: debouncer,
        dir: dir.to_path_buf(),
    })
}

/// Regular files directly inside `dir`, sorted by path.
pub fn list_candidates(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
