//! Cached metadata records.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::vfs::path::basename;

/// Mimetype stored for directories.
pub const DIR_MIMETYPE: &str = "httpd/unix-directory";

/// Size of a directory whose aggregate is not known yet.
pub const SIZE_UNKNOWN: i64 = -1;

bitflags! {
    /// What the current principal may do with an entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permissions: u32 {
        const READ = 1;
        const UPDATE = 2;
        const CREATE = 4;
        const DELETE = 8;
        const SHARE = 16;
        const ALL = 31;
    }
}

/// One cached file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// `None` for transient entries that were never admitted to the cache.
    pub file_id: Option<i64>,
    /// Internal path within the storage, `""` for its root.
    pub path: String,
    /// Parent file id, `-1` for the storage root.
    pub parent: i64,
    pub name: String,
    /// Bytes; directories carry the sum of their children, `-1` if unknown.
    pub size: i64,
    /// Logical mtime, bumped by change propagation.
    pub mtime: i64,
    /// Mtime as last reported by the storage.
    pub storage_mtime: i64,
    pub etag: String,
    pub mimetype: String,
    pub permissions: Permissions,
    pub encrypted: bool,
    pub checksum: Option<String>,
}

impl CacheEntry {
    /// Entry for an object the cache does not track (e.g. a `.part` upload).
    pub fn transient(path: &str, size: i64, mtime: i64, is_dir: bool) -> Self {
        Self {
            file_id: None,
            path: path.to_string(),
            parent: -1,
            name: basename(path).to_string(),
            size,
            mtime,
            storage_mtime: mtime,
            etag: String::new(),
            mimetype: guess_mimetype(path, is_dir),
            permissions: Permissions::ALL,
            encrypted: false,
            checksum: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mimetype == DIR_MIMETYPE
    }

    /// Top-level part of the mimetype (`text` for `text/plain`).
    pub fn mime_part(&self) -> &str {
        self.mimetype.split('/').next().unwrap_or("")
    }

    /// Whether the aggregate size has been computed.
    pub fn size_known(&self) -> bool {
        self.size >= 0
    }
}

/// Sparse set of fields to write into an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUpdate {
    pub size: Option<i64>,
    pub mtime: Option<i64>,
    pub storage_mtime: Option<i64>,
    pub etag: Option<String>,
    pub mimetype: Option<String>,
    pub permissions: Option<Permissions>,
    pub encrypted: Option<bool>,
    /// `Some(None)` clears the checksum.
    pub checksum: Option<Option<String>>,
}

impl CacheUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mtime(mut self, mtime: i64) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn with_storage_mtime(mut self, storage_mtime: i64) -> Self {
        self.storage_mtime = Some(storage_mtime);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = Some(encrypted);
        self
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the set fields to an in-memory entry.
    pub fn apply(&self, entry: &mut CacheEntry) {
        if let Some(size) = self.size {
            entry.size = size;
        }
        if let Some(mtime) = self.mtime {
            entry.mtime = mtime;
        }
        if let Some(storage_mtime) = self.storage_mtime {
            entry.storage_mtime = storage_mtime;
        }
        if let Some(etag) = &self.etag {
            entry.etag = etag.clone();
        }
        if let Some(mimetype) = &self.mimetype {
            entry.mimetype = mimetype.clone();
        }
        if let Some(permissions) = self.permissions {
            entry.permissions = permissions;
        }
        if let Some(encrypted) = self.encrypted {
            entry.encrypted = encrypted;
        }
        if let Some(checksum) = &self.checksum {
            entry.checksum = checksum.clone();
        }
    }
}

/// Mimetype for a path, guessed from its extension.
pub fn guess_mimetype(path: &str, is_dir: bool) -> String {
    if is_dir {
        return DIR_MIMETYPE.to_string();
    }
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Fresh opaque version token.
pub fn new_etag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
