//! Periodically refreshed, atomically swapped, read-mostly file snapshot.
//!
//! Readers take the current `Arc<T>` without blocking. A refresh stats the
//! backing file, skips the read when the modification time is unchanged, and
//! otherwise parses a fresh value and swaps it in whole.

use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Result of one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Modification time unchanged; nothing read.
    Unchanged,
    /// File parsed and swapped in.
    Loaded,
    /// File absent; last snapshot kept.
    Missing,
    /// File present but unreadable; last snapshot kept.
    Failed,
}

pub struct FileSnapshot<T> {
    label: &'static str,
    path: PathBuf,
    current: ArcSwap<T>,
    last_modified: Mutex<Option<SystemTime>>,
    missing_reported: AtomicBool,
    parse: fn(&str) -> T,
}

impl<T> FileSnapshot<T> {
    /// Start from `initial`; nothing is read until the first refresh.
    pub fn new(label: &'static str, path: impl Into<PathBuf>, initial: T, parse: fn(&str) -> T) -> Self {
        Self {
            label,
            path: path.into(),
            current: ArcSwap::from_pointee(initial),
            last_modified: Mutex::new(None),
            missing_reported: AtomicBool::new(false),
            parse,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<T> {
        self.current.load_full()
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !self.missing_reported.swap(true, Ordering::Relaxed) {
                    warn!(file = self.label, path = %self.path.display(), "file not found, keeping last snapshot");
                }
                return RefreshOutcome::Missing;
            }
            Err(e) => {
                warn!(file = self.label, path = %self.path.display(), error = %e, "cannot stat file");
                return RefreshOutcome::Failed;
            }
        };
        if self.missing_reported.swap(false, Ordering::Relaxed) {
            info!(file = self.label, path = %self.path.display(), "file is back");
        }

        let modified = metadata.modified().ok();
        if modified.is_some() && modified == *self.last_modified() {
            return RefreshOutcome::Unchanged;
        }

        let content = match tokio::fs::read(&self.path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(file = self.label, path = %self.path.display(), error = %e, "cannot read file");
                return RefreshOutcome::Failed;
            }
        };
        self.current.store(Arc::new((self.parse)(&content)));
        *self.last_modified() = modified;
        debug!(file = self.label, path = %self.path.display(), "snapshot reloaded");
        RefreshOutcome::Loaded
    }

    fn last_modified(&self) -> std::sync::MutexGuard<'_, Option<SystemTime>> {
        self.last_modified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + Sync + 'static> FileSnapshot<T> {
    /// Refresh every `period`, starting one period from now.
    pub fn spawn_refresh(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let snapshot = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                snapshot.refresh().await;
            }
        })
    }
}
