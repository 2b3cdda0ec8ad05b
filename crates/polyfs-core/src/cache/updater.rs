//! Keeps the cache in step with mutations made through a view.
//!
//! Every change ends in [`Updater::propagate_change`], which corrects
//! directory sizes and gives every ancestor a fresh etag and an mtime no
//! older than the change.

use std::sync::Arc;
use std::time::SystemTime;

use super::entry::{CacheUpdate, new_etag};
use super::scanner::{Reuse, ScanDepth, Scanner};
use super::storage_cache::StorageCache;
use crate::vfs::path::{internal_parent, is_partial_file};
use crate::vfs::types::to_unix_secs;
use crate::vfs::{Storage, VfsResult};

/// Cache synchronization for one storage.
#[derive(Debug, Clone)]
pub struct Updater {
    cache: Arc<StorageCache>,
    scanner: Scanner,
}

fn now() -> i64 {
    to_unix_secs(SystemTime::now())
}

impl Updater {
    pub fn new(storage: Arc<dyn Storage>, cache: Arc<StorageCache>) -> Self {
        Self {
            scanner: Scanner::new(storage, Arc::clone(&cache)),
            cache,
        }
    }

    /// Refresh `path` after it was written, created or touched.
    ///
    /// `mtime` overrides the logical mtime (touch). Without
    /// `content_changed` the etag survives if the storage reports the same
    /// size and mtime as before.
    pub async fn update(&self, path: &str, mtime: Option<i64>, content_changed: bool) -> VfsResult<()> {
        if is_partial_file(path) {
            return Ok(());
        }
        let reuse = if content_changed {
            Reuse::SIZE
        } else {
            Reuse::SIZE | Reuse::ETAG
        };
        let entry = self.scanner.scan(path, ScanDepth::Shallow, reuse).await?;

        if let (Some(file_id), Some(mtime)) = (entry.and_then(|e| e.file_id), mtime) {
            self.cache
                .update(file_id, &CacheUpdate::new().with_mtime(mtime))?;
        }
        self.propagate_change(path, mtime.unwrap_or_else(now))
    }

    /// Admit a whole new subtree, e.g. the target of a copy.
    pub async fn add_tree(&self, path: &str) -> VfsResult<()> {
        self.scanner
            .scan(path, ScanDepth::Recursive, Reuse::empty())
            .await?;
        self.propagate_change(path, now())
    }

    /// Forget `path` after it was deleted.
    pub fn remove(&self, path: &str) -> VfsResult<()> {
        self.cache.remove(path)?;
        self.propagate_change(path, now())
    }

    /// Follow a rename inside this storage. File ids are kept.
    pub async fn rename_within(&self, source: &str, target: &str) -> VfsResult<()> {
        self.cache.move_entry(source, target)?;
        self.scanner
            .scan(target, ScanDepth::Shallow, Reuse::SIZE | Reuse::ETAG)
            .await?;
        let time = now();
        self.propagate_change(source, time)?;
        self.propagate_change(target, time)
    }

    /// Follow a move from `source_updater`'s storage into this one.
    ///
    /// The objects are new on this storage and get new file ids.
    pub async fn rename_across(
        &self,
        source_updater: &Updater,
        source: &str,
        target: &str,
    ) -> VfsResult<()> {
        source_updater.remove(source)?;
        self.add_tree(target).await
    }

    /// Correct sizes above `path` and mint a new etag on every ancestor up
    /// to the storage root, bumping their mtime to at least `time`.
    pub fn propagate_change(&self, path: &str, time: i64) -> VfsResult<()> {
        if path.is_empty() {
            return Ok(());
        }
        let parent = internal_parent(path);
        self.cache.correct_folder_size(parent)?;

        let mut current = path;
        while !current.is_empty() {
            current = internal_parent(current);
            let Some(entry) = self.cache.get(current)? else {
                continue;
            };
            let Some(file_id) = entry.file_id else {
                continue;
            };
            self.cache.update(
                file_id,
                &CacheUpdate::new()
                    .with_etag(new_etag())
                    .with_mtime(entry.mtime.max(time)),
            )?;
        }
        Ok(())
    }
}
