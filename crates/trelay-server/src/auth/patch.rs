//! Source-IP authorization for cross-connect (`TCP-*`) patch requests.
//!
//! Backed by a tab-delimited file; every `SRCIP\t<ip>` line grants that
//! source address. The set is rebuilt on each change and swapped whole.

use super::snapshot::{FileSnapshot, RefreshOutcome};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Column 0 key for an authorized source address.
pub const SOURCE_IP_KEY: &str = "SRCIP";

pub struct PatchAuthorizationCache {
    snapshot: Arc<FileSnapshot<HashSet<String>>>,
    refresher: Option<JoinHandle<()>>,
}

impl PatchAuthorizationCache {
    /// An empty cache bound to `path`. Nothing is loaded yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot: Arc::new(FileSnapshot::new(
                "patch authorization",
                path,
                HashSet::new(),
                parse_patch_file,
            )),
            refresher: None,
        }
    }

    /// Load once, then keep refreshing every `period` in the background.
    pub async fn start(path: impl Into<PathBuf>, period: Duration) -> Self {
        let mut cache = Self::new(path);
        cache.refresh().await;
        cache.refresher = Some(cache.snapshot.spawn_refresh(period));
        cache
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        let outcome = self.snapshot.refresh().await;
        if outcome == RefreshOutcome::Loaded {
            info!(
                path = %self.snapshot.path().display(),
                entries = self.len(),
                "patch authorization list loaded"
            );
        }
        outcome
    }

    pub fn is_authorized(&self, source_ip: &str) -> bool {
        self.snapshot.load().contains(source_ip.trim())
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background refresh.
    pub fn stop(&mut self) {
        if let Some(task) = self.refresher.take() {
            task.abort();
        }
    }
}

impl Drop for PatchAuthorizationCache {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Collect the trimmed column-1 address of every `SRCIP` line.
pub fn parse_patch_file(content: &str) -> HashSet<String> {
    content
        .lines()
        .filter_map(|line| {
            let mut columns = line.split('\t');
            if columns.next()?.trim() != SOURCE_IP_KEY {
                return None;
            }
            let ip = columns.next()?.trim();
            (!ip.is_empty()).then(|| ip.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    const SAMPLE: &str = "# patch interfaces\n\
                          SRCIP\t10.1.1.1\n\
                          SRCIP\t 10.1.1.2 \tcore-a\n\
                          DEVICE\t10.9.9.9\n\
                          SRCIP\t\n\
                          SRCIP 10.1.1.3\n";

    #[test]
    fn parses_tagged_lines_only() {
        let set = parse_patch_file(SAMPLE);
        assert_eq!(set.len(), 2);
        assert!(set.contains("10.1.1.1"));
        assert!(set.contains("10.1.1.2"));
        assert!(!set.contains("10.9.9.9"));
    }

    #[tokio::test]
    async fn lookup_reflects_loaded_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PatchInterfaceDB.txt");
        std::fs::write(&path, SAMPLE).unwrap();

        let cache = PatchAuthorizationCache::start(&path, Duration::from_secs(60)).await;
        assert!(cache.is_authorized("10.1.1.1"));
        assert!(cache.is_authorized("10.1.1.2"));
        assert!(!cache.is_authorized("10.1.1.3"));
        assert!(!cache.is_authorized(""));
    }

    #[tokio::test]
    async fn same_mtime_never_changes_the_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PatchInterfaceDB.txt");
        std::fs::write(&path, "SRCIP\t10.1.1.1\n").unwrap();
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(stamp)
            .unwrap();

        let cache = PatchAuthorizationCache::new(&path);
        assert_eq!(cache.refresh().await, RefreshOutcome::Loaded);

        std::fs::write(&path, "SRCIP\t10.2.2.2\n").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(stamp).unwrap();
        assert_eq!(cache.refresh().await, RefreshOutcome::Unchanged);
        assert!(cache.is_authorized("10.1.1.1"));
        assert!(!cache.is_authorized("10.2.2.2"));

        file.set_modified(stamp + Duration::from_secs(1)).unwrap();
        assert_eq!(cache.refresh().await, RefreshOutcome::Loaded);
        assert!(cache.is_authorized("10.2.2.2"));
        assert!(!cache.is_authorized("10.1.1.1"));
    }

    #[tokio::test]
    async fn missing_file_keeps_last_known_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PatchInterfaceDB.txt");
        std::fs::write(&path, "SRCIP\t10.1.1.1\n").unwrap();

        let cache = PatchAuthorizationCache::new(&path);
        cache.refresh().await;
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cache.refresh().await, RefreshOutcome::Missing);
        assert!(cache.is_authorized("10.1.1.1"));
    }

    #[tokio::test]
    async fn never_loaded_cache_denies_everything() {
        let cache = PatchAuthorizationCache::start("/nonexistent/patches.txt", Duration::from_secs(60)).await;
        assert!(cache.is_empty());
        assert!(!cache.is_authorized("10.1.1.1"));
    }

    #[tokio::test]
    async fn readers_see_whole_snapshots_during_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PatchInterfaceDB.txt");
        let full: String = (0..200).map(|i| format!("SRCIP\t10.0.{}.{}\n", i / 250, i % 250)).collect();
        std::fs::write(&path, &full).unwrap();

        let cache = Arc::new(PatchAuthorizationCache::new(&path));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let n = cache.len();
                        assert!(n == 0 || n == 200, "partial snapshot of {n}");
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        cache.refresh().await;
        for r in readers {
            r.await.unwrap();
        }
        assert_eq!(cache.len(), 200);
    }
}
