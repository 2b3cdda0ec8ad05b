//! Values exchanged between storages and the view.
//!
//! Storages speak in `SystemTime`; the cache keeps whole unix seconds, so
//! [`to_unix_secs`] and [`from_unix_secs`] sit at that boundary.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// What a storage reports for one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttr {
    /// Bytes. Directories report 0; their aggregate lives in the cache.
    pub size: u64,
    pub kind: FileType,
    /// Unix mode bits (e.g. 0o644).
    pub perm: u32,
    pub mtime: SystemTime,
}

impl FileAttr {
    pub fn file(size: u64, perm: u32) -> Self {
        Self {
            size,
            kind: FileType::File,
            perm,
            mtime: SystemTime::now(),
        }
    }

    pub fn directory(perm: u32) -> Self {
        Self {
            size: 0,
            kind: FileType::Directory,
            perm,
            mtime: SystemTime::now(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Mtime at cache resolution.
    pub fn mtime_secs(&self) -> i64 {
        to_unix_secs(self.mtime)
    }
}

/// One `readdir` result: a child name, never a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Sparse attribute change for [`Storage::setattr`](super::Storage::setattr).
///
/// `touch` sets only the mtime; `size` resizes with zero fill.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    pub perm: Option<u32>,
}

impl SetAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }
}

/// Space accounting of a storage, in bytes.
///
/// `None` means the storage has no quota (memory) or cannot tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatFs {
    pub total_bytes: Option<u64>,
    pub used_bytes: u64,
    pub available_bytes: Option<u64>,
}

impl StatFs {
    /// No limit beyond what is already stored.
    pub fn unlimited(used_bytes: u64) -> Self {
        Self {
            total_bytes: None,
            used_bytes,
            available_bytes: None,
        }
    }
}

/// How [`View::fopen`](crate::View::fopen) opens a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OpenMode {
    /// From the start of an existing file.
    Read,
    /// Create or truncate.
    Write,
    /// Create if missing, continue at the end.
    Append,
}

impl OpenMode {
    pub fn is_write(&self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// Whole unix seconds; pre-epoch times clamp to 0.
pub fn to_unix_secs(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn from_unix_secs(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_constructors() {
        let file = FileAttr::file(1024, 0o644);
        assert!(file.is_file());
        assert_eq!(file.size, 1024);

        let dir = FileAttr::directory(0o755);
        assert!(dir.is_dir());
        assert!(!dir.is_file());
        assert_eq!(dir.size, 0);
    }

    #[test]
    fn test_unix_secs_truncate() {
        let t = from_unix_secs(1_700_000_000) + Duration::from_millis(700);
        assert_eq!(to_unix_secs(t), 1_700_000_000);
        assert_eq!(from_unix_secs(-5), UNIX_EPOCH);
        let attr = FileAttr {
            mtime: t,
            ..FileAttr::file(1, 0o644)
        };
        assert_eq!(attr.mtime_secs(), 1_700_000_000);
    }

    #[test]
    fn test_open_mode() {
        assert!(!OpenMode::Read.is_write());
        assert!(OpenMode::Write.is_write());
        assert!(OpenMode::Append.is_write());
        assert_eq!(OpenMode::Append.to_string(), "append");
    }

    #[test]
    fn test_unlimited_space() {
        let stat = StatFs::unlimited(42);
        assert_eq!(stat.used_bytes, 42);
        assert!(stat.total_bytes.is_none());
        assert!(stat.available_bytes.is_none());
    }
}
