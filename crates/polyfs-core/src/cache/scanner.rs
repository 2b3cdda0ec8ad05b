//! Reconciles the metadata cache with what a storage actually holds.

use bitflags::bitflags;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::entry::{CacheEntry, CacheUpdate, SIZE_UNKNOWN, guess_mimetype, new_etag};
use super::storage_cache::StorageCache;
use crate::vfs::path::{internal_parent, is_partial_file, join_internal};
use crate::vfs::{Storage, VfsResult};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

bitflags! {
    /// Cached values a rescan may keep when the object looks unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Reuse: u8 {
        /// Keep the etag when size and storage mtime are unchanged.
        const ETAG = 1;
        /// Keep a directory's aggregate size instead of resetting it.
        const SIZE = 2;
    }
}

/// How far a scan descends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDepth {
    /// The path and its direct children.
    Shallow,
    /// The whole subtree.
    Recursive,
}

/// Scanner bound to one storage and its cache.
#[derive(Clone)]
pub struct Scanner {
    storage: Arc<dyn Storage>,
    cache: Arc<StorageCache>,
}

impl Scanner {
    pub fn new(storage: Arc<dyn Storage>, cache: Arc<StorageCache>) -> Self {
        Self { storage, cache }
    }

    /// Refresh the entry for a single path.
    ///
    /// Returns `None` for partial uploads and for paths the storage no
    /// longer has; the latter are dropped from the cache.
    pub async fn scan_file(&self, path: &str, reuse: Reuse) -> VfsResult<Option<CacheEntry>> {
        if is_partial_file(path) {
            return Ok(None);
        }

        let attr = match self.storage.stat(path).await {
            Ok(attr) => attr,
            Err(e) if e.is_not_found() => {
                self.cache.remove(path)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let cached = self.cache.get(path)?;
        let storage_mtime = attr.mtime_secs();
        let is_dir = attr.is_dir();

        let size = if is_dir {
            match &cached {
                Some(c) if reuse.contains(Reuse::SIZE) => c.size,
                _ => SIZE_UNKNOWN,
            }
        } else {
            attr.size as i64
        };

        let mut update = CacheUpdate::new()
            .with_size(size)
            .with_storage_mtime(storage_mtime)
            .with_mimetype(guess_mimetype(path, is_dir));

        match &cached {
            Some(c) => {
                let unchanged =
                    c.storage_mtime == storage_mtime && (is_dir || c.size == size);
                if !unchanged {
                    update = update.with_mtime(storage_mtime).with_checksum(None);
                }
                if !(unchanged && reuse.contains(Reuse::ETAG)) {
                    update = update.with_etag(self.mint_etag(path).await?);
                }
                if !unchanged {
                    tracing::debug!(storage = %self.storage.id(), path, size, "cache entry changed");
                }
            }
            None => {
                update = update
                    .with_mtime(storage_mtime)
                    .with_etag(self.mint_etag(path).await?);
                tracing::debug!(storage = %self.storage.id(), path, size, "cache entry added");
            }
        }

        self.cache.put(path, &update)?;
        self.cache.get(path)
    }

    /// Scan `path` and, if it is a directory, its children to `depth`.
    ///
    /// Directory sizes of the scanned tree and of every ancestor are
    /// recomputed afterwards.
    pub async fn scan(
        &self,
        path: &str,
        depth: ScanDepth,
        reuse: Reuse,
    ) -> VfsResult<Option<CacheEntry>> {
        let Some(entry) = self.scan_file(path, reuse).await? else {
            return Ok(None);
        };
        if entry.is_dir() {
            self.scan_children(path, depth, reuse).await?;
            self.cache.correct_folder_size(path)?;
        } else if !path.is_empty() {
            self.cache.correct_folder_size(internal_parent(path))?;
        }
        self.cache.get(path)
    }

    fn scan_children<'a>(
        &'a self,
        path: &'a str,
        depth: ScanDepth,
        reuse: Reuse,
    ) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move {
            let listing = self.storage.readdir(path).await?;
            let mut seen = HashSet::with_capacity(listing.len());

            for child in &listing {
                let child_path = join_internal(path, &child.name);
                if is_partial_file(&child_path) {
                    continue;
                }
                seen.insert(child.name.clone());

                if child.kind.is_dir() {
                    match depth {
                        ScanDepth::Recursive => {
                            if self.scan_file(&child_path, reuse).await?.is_some() {
                                self.scan_children(&child_path, depth, reuse).await?;
                                self.cache.calculate_folder_size(&child_path)?;
                            }
                        }
                        ScanDepth::Shallow => {
                            self.scan_file(&child_path, reuse | Reuse::SIZE).await?;
                        }
                    }
                } else {
                    self.scan_file(&child_path, reuse).await?;
                }
            }

            self.remove_ghosts(path, &seen)?;
            Ok(())
        })
    }

    /// Drop cached children of `path` the storage did not list.
    fn remove_ghosts(&self, path: &str, seen: &HashSet<String>) -> VfsResult<()> {
        let mut removed = false;
        for cached in self.cache.contents(path)? {
            if !seen.contains(&cached.name) {
                tracing::debug!(storage = %self.storage.id(), path = %cached.path, "removing ghost entry");
                self.cache.remove(&cached.path)?;
                removed = true;
            }
        }
        if removed {
            self.cache.purge_orphans()?;
        }
        Ok(())
    }

    async fn mint_etag(&self, path: &str) -> VfsResult<String> {
        Ok(self.storage.etag(path).await?.unwrap_or_else(new_etag))
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("storage", &self.storage.id())
            .finish()
    }
}
