//! File metadata as seen through a view.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{CacheEntry, Permissions};
use crate::vfs::path::basename;

/// Metadata of one path, including what sub-mounts below it contribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    path: String,
    internal_path: String,
    mount_point: String,
    storage_id: String,
    entry: CacheEntry,
    child_etags: Vec<String>,
    sub_size: i64,
    mount_root: bool,
}

impl FileInfo {
    pub fn new(
        path: impl Into<String>,
        internal_path: impl Into<String>,
        mount_point: impl Into<String>,
        storage_id: impl Into<String>,
        entry: CacheEntry,
    ) -> Self {
        let internal_path = internal_path.into();
        Self {
            path: path.into(),
            mount_root: internal_path.is_empty(),
            internal_path,
            mount_point: mount_point.into(),
            storage_id: storage_id.into(),
            entry,
            child_etags: Vec::new(),
            sub_size: 0,
        }
    }

    /// Fold the root entry of a mount below this path into the aggregate.
    pub fn add_sub_entry(&mut self, sub: &CacheEntry) {
        if self.sub_size >= 0 {
            self.sub_size = if sub.size_known() {
                self.sub_size + sub.size
            } else {
                -1
            };
        }
        self.entry.mtime = self.entry.mtime.max(sub.mtime);
        self.child_etags.push(sub.etag.clone());
    }

    /// Path relative to the view root.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn internal_path(&self) -> &str {
        &self.internal_path
    }

    /// Logical path of the mount holding this entry.
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    /// `None` for objects the cache does not track.
    pub fn file_id(&self) -> Option<i64> {
        self.entry.file_id
    }

    pub fn name(&self) -> &str {
        basename(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.entry.is_dir()
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    pub fn mimetype(&self) -> &str {
        &self.entry.mimetype
    }

    pub fn mime_part(&self) -> &str {
        self.entry.mime_part()
    }

    pub fn permissions(&self) -> Permissions {
        self.entry.permissions
    }

    pub fn mtime(&self) -> i64 {
        self.entry.mtime
    }

    pub fn is_encrypted(&self) -> bool {
        self.entry.encrypted
    }

    pub fn checksum(&self) -> Option<&str> {
        self.entry.checksum.as_deref()
    }

    /// Whether this path is where a storage is attached.
    pub fn is_mount_root(&self) -> bool {
        self.mount_root
    }

    /// Size in bytes including sub-mounts, `-1` if any part is unknown.
    pub fn size(&self) -> i64 {
        if !self.entry.size_known() || self.sub_size < 0 {
            -1
        } else {
            self.entry.size + self.sub_size
        }
    }

    /// Version token covering this entry and every sub-mount below it.
    pub fn etag(&self) -> String {
        if self.child_etags.is_empty() {
            return self.entry.etag.clone();
        }
        let mut name = self.entry.etag.clone();
        for child in &self.child_etags {
            name.push(':');
            name.push_str(child);
        }
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
            .simple()
            .to_string()
    }
}
