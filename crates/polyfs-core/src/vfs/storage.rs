//! Storage capability interface.
//!
//! Every backend implements [`Storage`]. The trait is path-based (no inodes)
//! and paths are always internal to the storage: relative, no leading `/`,
//! with `""` naming the storage root. The [`MountRegistry`] translates
//! logical paths into these.
//!
//! Optional capabilities are exposed as extension traits that a caller
//! queries for at runtime (see [`Storage::as_transfer`]).
//!
//! [`MountRegistry`]: super::MountRegistry

use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use super::path::join_internal;
use super::types::{DirEntry, FileAttr, SetAttr, StatFs};
use super::VfsResult;
use crate::lock::{LockKind, LockingProvider};

/// Bytes moved per read/write round trip when streaming content.
pub const COPY_CHUNK_SIZE: u32 = 64 * 1024;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Core storage operations.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stable identifier. Keys the metadata cache and the lock table, so two
    /// instances pointing at the same data must return the same id.
    fn id(&self) -> &str;

    // ========================================================================
    // Reading
    // ========================================================================

    /// Get file attributes.
    async fn stat(&self, path: &str) -> VfsResult<FileAttr>;

    /// Read directory entries, sorted by name.
    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>>;

    /// Read up to `size` bytes starting at `offset`.
    /// Returns fewer bytes if EOF is reached.
    async fn read(&self, path: &str, offset: u64, size: u32) -> VfsResult<Vec<u8>>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write `data` at `offset`. Returns the number of bytes written.
    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> VfsResult<u32>;

    /// Create a new, empty file. Fails if the path exists.
    async fn create(&self, path: &str, mode: u32) -> VfsResult<FileAttr>;

    /// Create a directory. The parent must exist.
    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<FileAttr>;

    /// Remove a file.
    async fn unlink(&self, path: &str) -> VfsResult<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &str) -> VfsResult<()>;

    /// Rename a file or directory, replacing whatever is at `to`.
    async fn rename(&self, from: &str, to: &str) -> VfsResult<()>;

    /// Truncate a file to the specified size.
    async fn truncate(&self, path: &str, size: u64) -> VfsResult<()>;

    /// Set file attributes.
    async fn setattr(&self, path: &str, attr: SetAttr) -> VfsResult<FileAttr>;

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Returns true if this storage is read-only.
    fn read_only(&self) -> bool;

    /// Get filesystem statistics.
    async fn statfs(&self) -> VfsResult<StatFs>;

    /// Backend-provided version token, if the backend has one.
    async fn etag(&self, _path: &str) -> VfsResult<Option<String>> {
        Ok(None)
    }

    /// Whether the object changed since the cached storage mtime `since`.
    ///
    /// Used by the watcher. A vanished object counts as updated.
    async fn has_updated(&self, path: &str, since: i64) -> VfsResult<bool> {
        match self.stat(path).await {
            Ok(attr) => Ok(attr.mtime_secs() != since),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Location on the local filesystem, for storages backed by one.
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Backend-to-backend transfer fast path, if supported.
    fn as_transfer(&self) -> Option<&dyn CrossStorageTransfer> {
        None
    }

    // ========================================================================
    // Lock cooperation
    // ========================================================================

    /// Acquire a lock on `path` in `provider`.
    fn acquire_lock(
        &self,
        path: &str,
        kind: LockKind,
        provider: &dyn LockingProvider,
    ) -> VfsResult<()> {
        provider.acquire(&lock_key(self.id(), path), kind)
    }

    /// Release a lock on `path` in `provider`.
    fn release_lock(&self, path: &str, kind: LockKind, provider: &dyn LockingProvider) {
        provider.release(&lock_key(self.id(), path), kind)
    }

    /// Convert a held lock on `path` to `kind`.
    fn change_lock(
        &self,
        path: &str,
        kind: LockKind,
        provider: &dyn LockingProvider,
    ) -> VfsResult<()> {
        provider.change_lock(&lock_key(self.id(), path), kind)
    }

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if a path exists.
    async fn exists(&self, path: &str) -> bool {
        self.stat(path).await.is_ok()
    }

    /// Check if a path is a directory.
    async fn is_dir(&self, path: &str) -> bool {
        self.stat(path).await.map(|a| a.is_dir()).unwrap_or(false)
    }

    /// Read entire file contents.
    async fn read_all(&self, path: &str) -> VfsResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(path, out.len() as u64, COPY_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Replace entire file contents, creating the file if needed.
    async fn write_all(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        if self.exists(path).await {
            self.truncate(path, 0).await?;
        } else {
            self.create(path, 0o644).await?;
        }
        if !data.is_empty() {
            self.write(path, 0, data).await?;
        }
        Ok(())
    }

    /// Append to a file, creating it if needed.
    async fn append(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        let offset = match self.stat(path).await {
            Ok(attr) => attr.size,
            Err(e) if e.is_not_found() => {
                self.create(path, 0o644).await?;
                0
            }
            Err(e) => return Err(e),
        };
        self.write(path, offset, data).await?;
        Ok(())
    }

    /// Copy a file or directory tree within this storage.
    async fn copy(&self, from: &str, to: &str) -> VfsResult<()> {
        copy_within(self, from, to).await
    }

    /// Remove a file or a directory with everything below it.
    async fn remove_tree(&self, path: &str) -> VfsResult<()> {
        remove_tree(self, path).await
    }
}

/// Backend-to-backend transfer, bypassing the streamed fallback.
#[async_trait]
pub trait CrossStorageTransfer: Send + Sync {
    /// Whether this storage can pull directly from `source`.
    fn accepts(&self, source: &dyn Storage) -> bool;

    /// Copy `source_path` on `source` to `target_path` on this storage.
    async fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> VfsResult<()>;

    /// Move `source_path` on `source` to `target_path` on this storage.
    async fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> VfsResult<()>;
}

/// Key under which a storage path is locked.
pub fn lock_key(storage_id: &str, path: &str) -> String {
    format!("{}::{}", storage_id, path.trim_matches('/'))
}

fn copy_within<'a, S: Storage + ?Sized>(
    storage: &'a S,
    from: &'a str,
    to: &'a str,
) -> BoxFuture<'a, VfsResult<()>> {
    Box::pin(async move {
        let attr = storage.stat(from).await?;
        if attr.is_dir() {
            storage.mkdir(to, attr.perm).await?;
            for entry in storage.readdir(from).await? {
                let child_from = join_internal(from, &entry.name);
                let child_to = join_internal(to, &entry.name);
                copy_within(storage, &child_from, &child_to).await?;
            }
            Ok(())
        } else {
            let data = storage.read_all(from).await?;
            storage.write_all(to, &data).await
        }
    })
}

fn remove_tree<'a, S: Storage + ?Sized>(storage: &'a S, path: &'a str) -> BoxFuture<'a, VfsResult<()>> {
    Box::pin(async move {
        let attr = storage.stat(path).await?;
        if !attr.is_dir() {
            return storage.unlink(path).await;
        }
        for entry in storage.readdir(path).await? {
            let child = join_internal(path, &entry.name);
            remove_tree(storage, &child).await?;
        }
        storage.rmdir(path).await
    })
}
