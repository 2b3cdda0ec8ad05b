//! Detects changes made to a storage behind the cache's back.

use dashmap::DashSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::entry::CacheEntry;
use super::scanner::{Reuse, ScanDepth, Scanner};
use super::storage_cache::StorageCache;
use crate::vfs::path::join_internal;
use crate::vfs::{Storage, VfsResult};

/// When cached metadata is checked against the storage on read.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WatchPolicy {
    /// Trust the cache.
    Never,
    /// Check each path the first time it is read.
    #[default]
    Once,
    /// Check on every read.
    Always,
}

/// Watcher for one storage.
pub struct Watcher {
    storage: Arc<dyn Storage>,
    cache: Arc<StorageCache>,
    scanner: Scanner,
    policy: RwLock<WatchPolicy>,
    checked: DashSet<String>,
}

impl Watcher {
    pub fn new(storage: Arc<dyn Storage>, cache: Arc<StorageCache>, policy: WatchPolicy) -> Self {
        Self {
            scanner: Scanner::new(Arc::clone(&storage), Arc::clone(&cache)),
            storage,
            cache,
            policy: RwLock::new(policy),
            checked: DashSet::new(),
        }
    }

    pub fn policy(&self) -> WatchPolicy {
        *self.policy.read()
    }

    pub fn set_policy(&self, policy: WatchPolicy) {
        *self.policy.write() = policy;
    }

    /// Rescan `path` if the storage changed it since it was cached.
    ///
    /// Returns true when the cache was updated.
    pub async fn check_update(&self, path: &str, cached: &CacheEntry) -> VfsResult<bool> {
        if self.needs_update(path, cached).await? {
            self.update(path, cached).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Whether the policy calls for a check and the storage reports a change.
    pub async fn needs_update(&self, path: &str, cached: &CacheEntry) -> VfsResult<bool> {
        let due = match self.policy() {
            WatchPolicy::Never => false,
            WatchPolicy::Once => self.checked.insert(path.to_string()),
            WatchPolicy::Always => true,
        };
        if !due {
            return Ok(false);
        }
        self.storage.has_updated(path, cached.storage_mtime).await
    }

    /// Bring the cache for `path` in line with the storage.
    pub async fn update(&self, path: &str, cached: &CacheEntry) -> VfsResult<()> {
        tracing::debug!(storage = %self.storage.id(), path, "external change detected");
        if cached.is_dir() {
            self.scanner
                .scan(path, ScanDepth::Shallow, Reuse::ETAG)
                .await?;
            self.clean_folder(path).await?;
        } else {
            self.scanner.scan_file(path, Reuse::empty()).await?;
        }
        self.cache.correct_folder_size(path)?;
        Ok(())
    }

    /// Drop cached child directories the storage no longer has.
    async fn clean_folder(&self, path: &str) -> VfsResult<()> {
        for child in self.cache.contents(path)? {
            if child.is_dir() && !self.storage.is_dir(&join_internal(path, &child.name)).await {
                self.cache.remove(&child.path)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("storage", &self.storage.id())
            .field("policy", &self.policy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheDb;
    use crate::vfs::{MemoryBackend, SetAttr};
    use std::str::FromStr;
    use std::time::{Duration, UNIX_EPOCH};

    async fn fixture(policy: WatchPolicy) -> (Arc<MemoryBackend>, Arc<StorageCache>, Watcher) {
        let storage = Arc::new(MemoryBackend::new());
        storage.mkdir("folder", 0o755).await.unwrap();
        storage.write_all("folder/bar.txt", b"bar").await.unwrap();

        let db = Arc::new(CacheDb::in_memory().unwrap());
        let cache = Arc::new(StorageCache::new(db, storage.id()).unwrap());
        Scanner::new(storage.clone(), cache.clone())
            .scan("", ScanDepth::Recursive, Reuse::empty())
            .await
            .unwrap();
        let watcher = Watcher::new(storage.clone(), cache.clone(), policy);
        (storage, cache, watcher)
    }

    async fn modify(storage: &MemoryBackend, path: &str, data: &[u8]) {
        storage.write_all(path, data).await.unwrap();
        storage
            .setattr(
                path,
                SetAttr::new().with_mtime(UNIX_EPOCH + Duration::from_secs(4_000_000_000)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_always_picks_up_changes() {
        let (storage, cache, watcher) = fixture(WatchPolicy::Always).await;
        let cached = cache.get("folder/bar.txt").unwrap().unwrap();
        assert!(!watcher.check_update("folder/bar.txt", &cached).await.unwrap());

        modify(&storage, "folder/bar.txt", b"much longer").await;
        assert!(watcher.check_update("folder/bar.txt", &cached).await.unwrap());

        assert_eq!(cache.get("folder/bar.txt").unwrap().unwrap().size, 11);
        assert_eq!(cache.get("folder").unwrap().unwrap().size, 11);
        assert_eq!(cache.get("").unwrap().unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_once_checks_a_path_once() {
        let (storage, cache, watcher) = fixture(WatchPolicy::Once).await;
        let cached = cache.get("folder/bar.txt").unwrap().unwrap();
        assert!(!watcher.check_update("folder/bar.txt", &cached).await.unwrap());

        modify(&storage, "folder/bar.txt", b"changed").await;
        assert!(!watcher.check_update("folder/bar.txt", &cached).await.unwrap());
        assert_eq!(cache.get("folder/bar.txt").unwrap().unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_never_trusts_cache() {
        let (storage, cache, watcher) = fixture(WatchPolicy::Never).await;
        modify(&storage, "folder/bar.txt", b"changed").await;
        let cached = cache.get("folder/bar.txt").unwrap().unwrap();
        assert!(!watcher.check_update("folder/bar.txt", &cached).await.unwrap());

        watcher.set_policy(WatchPolicy::Always);
        assert!(watcher.check_update("folder/bar.txt", &cached).await.unwrap());
    }

    #[tokio::test]
    async fn test_removed_folder_cleaned() {
        let (storage, cache, watcher) = fixture(WatchPolicy::Always).await;
        storage.remove_tree("folder").await.unwrap();
        storage
            .setattr("", SetAttr::new().with_mtime(UNIX_EPOCH + Duration::from_secs(4_000_000_000)))
            .await
            .unwrap();

        let root = cache.get("").unwrap().unwrap();
        assert!(watcher.check_update("", &root).await.unwrap());
        assert!(cache.get("folder").unwrap().is_none());
        assert!(cache.get("folder/bar.txt").unwrap().is_none());
        assert_eq!(cache.get("").unwrap().unwrap().size, 0);
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(WatchPolicy::from_str("always").unwrap(), WatchPolicy::Always);
        assert_eq!(WatchPolicy::Never.to_string(), "never");
        assert_eq!(WatchPolicy::default(), WatchPolicy::Once);
    }
}
