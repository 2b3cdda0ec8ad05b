//! SQLite persistence for the metadata cache.
//!
//! One database holds every storage's rows; each storage gets a numeric id
//! in `storages` and its entries live in `filecache` keyed by
//! `(storage, path)`.

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

use crate::vfs::VfsResult;

const SCHEMA: &str = r#"
-- One row per storage id
CREATE TABLE IF NOT EXISTS storages (
    numeric_id INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE
);

-- One row per cached file or directory
CREATE TABLE IF NOT EXISTS filecache (
    fileid INTEGER PRIMARY KEY AUTOINCREMENT,
    storage INTEGER NOT NULL,
    path TEXT NOT NULL,
    parent INTEGER NOT NULL,
    name TEXT NOT NULL,
    mimetype TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT -1,
    mtime INTEGER NOT NULL DEFAULT 0,
    storage_mtime INTEGER NOT NULL DEFAULT 0,
    etag TEXT NOT NULL,
    permissions INTEGER NOT NULL DEFAULT 0,
    encrypted INTEGER NOT NULL DEFAULT 0,
    checksum TEXT,
    UNIQUE (storage, path)
);
CREATE INDEX IF NOT EXISTS idx_filecache_parent ON filecache(storage, parent);
CREATE INDEX IF NOT EXISTS idx_filecache_mimetype ON filecache(storage, mimetype);
"#;

/// Database handle shared by every [`StorageCache`](super::StorageCache).
pub struct CacheDb {
    conn: Mutex<Connection>,
}

impl CacheDb {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> VfsResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> VfsResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Numeric id for a storage id, registering it on first use.
    pub fn storage_numeric_id(&self, storage_id: &str) -> VfsResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO storages (id) VALUES (?1)",
            params![storage_id],
        )?;
        let id = conn.query_row(
            "SELECT numeric_id FROM storages WHERE id = ?1",
            params![storage_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Storage id registered under a numeric id.
    pub fn storage_string_id(&self, numeric_id: i64) -> VfsResult<Option<String>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT id FROM storages WHERE numeric_id = ?1",
                params![numeric_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Locate a file id: `(storage numeric id, internal path)`.
    pub fn get_by_id(&self, file_id: i64) -> VfsResult<Option<(i64, String)>> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT storage, path FROM filecache WHERE fileid = ?1",
                params![file_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(found)
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<R>) -> VfsResult<R> {
        let mut conn = self.conn.lock();
        Ok(f(&mut conn)?)
    }
}

impl std::fmt::Debug for CacheDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDb").finish_non_exhaustive()
    }
}
