//! Per-storage view of the metadata cache.

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::sync::Arc;

use super::db::CacheDb;
use super::entry::{
    CacheEntry, CacheUpdate, DIR_MIMETYPE, Permissions, SIZE_UNKNOWN, guess_mimetype, new_etag,
};
use crate::vfs::VfsResult;
use crate::vfs::path::{basename, internal_parent};

const COLUMNS: &str = "fileid, path, parent, name, size, mtime, storage_mtime, etag, mimetype, \
                       permissions, encrypted, checksum";

/// How much the cache knows about a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// No entry.
    NotFound,
    /// Directory admitted as a parent but never listed.
    Partial,
    /// Directory listed, aggregate size not known yet.
    Shallow,
    /// Entry with a known size.
    Complete,
}

/// Metadata cache of a single storage.
///
/// Shared by every mount of that storage.
pub struct StorageCache {
    db: Arc<CacheDb>,
    storage_id: String,
    numeric_id: i64,
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        file_id: Some(row.get(0)?),
        path: row.get(1)?,
        parent: row.get(2)?,
        name: row.get(3)?,
        size: row.get(4)?,
        mtime: row.get(5)?,
        storage_mtime: row.get(6)?,
        etag: row.get(7)?,
        mimetype: row.get(8)?,
        permissions: Permissions::from_bits_truncate(row.get(9)?),
        encrypted: row.get(10)?,
        checksum: row.get(11)?,
    })
}

fn subtree_prefix(path: &str) -> (String, i64) {
    let prefix = format!("{}/", path);
    let len = prefix.chars().count() as i64;
    (prefix, len)
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn get_row(conn: &Connection, storage: i64, path: &str) -> rusqlite::Result<Option<CacheEntry>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM filecache WHERE storage = ?1 AND path = ?2"),
        params![storage, path],
        row_to_entry,
    )
    .optional()
}

fn update_row(conn: &Connection, file_id: i64, update: &CacheUpdate) -> rusqlite::Result<()> {
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(size) = update.size {
        sets.push("size = ?");
        values.push(Value::Integer(size));
    }
    if let Some(mtime) = update.mtime {
        sets.push("mtime = ?");
        values.push(Value::Integer(mtime));
    }
    if let Some(storage_mtime) = update.storage_mtime {
        sets.push("storage_mtime = ?");
        values.push(Value::Integer(storage_mtime));
    }
    if let Some(etag) = &update.etag {
        sets.push("etag = ?");
        values.push(Value::Text(etag.clone()));
    }
    if let Some(mimetype) = &update.mimetype {
        sets.push("mimetype = ?");
        values.push(Value::Text(mimetype.clone()));
    }
    if let Some(permissions) = update.permissions {
        sets.push("permissions = ?");
        values.push(Value::Integer(permissions.bits() as i64));
    }
    if let Some(encrypted) = update.encrypted {
        sets.push("encrypted = ?");
        values.push(Value::Integer(encrypted as i64));
    }
    if let Some(checksum) = &update.checksum {
        sets.push("checksum = ?");
        values.push(match checksum {
            Some(sum) => Value::Text(sum.clone()),
            None => Value::Null,
        });
    }

    if sets.is_empty() {
        return Ok(());
    }
    values.push(Value::Integer(file_id));
    let sql = format!("UPDATE filecache SET {} WHERE fileid = ?", sets.join(", "));
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn insert_row(
    conn: &Connection,
    storage: i64,
    path: &str,
    parent: i64,
    update: &CacheUpdate,
) -> rusqlite::Result<i64> {
    let mtime = update.mtime.unwrap_or(0);
    conn.execute(
        "INSERT INTO filecache (storage, path, parent, name, mimetype, size, mtime, storage_mtime,
                                etag, permissions, encrypted, checksum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            storage,
            path,
            parent,
            basename(path),
            update
                .mimetype
                .clone()
                .unwrap_or_else(|| guess_mimetype(path, false)),
            update.size.unwrap_or(SIZE_UNKNOWN),
            mtime,
            update.storage_mtime.unwrap_or(mtime),
            update.etag.clone().unwrap_or_else(new_etag),
            update.permissions.unwrap_or(Permissions::ALL).bits(),
            update.encrypted.unwrap_or(false),
            update.checksum.clone().flatten(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// File id of the parent of `path`, admitting missing ancestors as
/// unlisted directories.
fn ensure_parent(conn: &Connection, storage: i64, path: &str, mtime: i64) -> rusqlite::Result<i64> {
    if path.is_empty() {
        return Ok(-1);
    }
    let parent = internal_parent(path);
    if let Some(entry) = get_row(conn, storage, parent)? {
        return Ok(entry.file_id.unwrap_or(-1));
    }
    let grandparent = ensure_parent(conn, storage, parent, mtime)?;
    let dir = CacheUpdate::new()
        .with_mimetype(DIR_MIMETYPE)
        .with_size(SIZE_UNKNOWN)
        .with_mtime(mtime);
    insert_row(conn, storage, parent, grandparent, &dir)
}

fn delete_subtree(conn: &Connection, storage: i64, path: &str) -> rusqlite::Result<usize> {
    if path.is_empty() {
        return conn.execute("DELETE FROM filecache WHERE storage = ?1", params![storage]);
    }
    let (prefix, len) = subtree_prefix(path);
    conn.execute(
        "DELETE FROM filecache WHERE storage = ?1 AND (path = ?2 OR substr(path, 1, ?3) = ?4)",
        params![storage, path, len, prefix],
    )
}

impl StorageCache {
    /// Cache for `storage_id`, registering the storage on first use.
    pub fn new(db: Arc<CacheDb>, storage_id: &str) -> VfsResult<Self> {
        let numeric_id = db.storage_numeric_id(storage_id)?;
        Ok(Self {
            db,
            storage_id: storage_id.to_string(),
            numeric_id,
        })
    }

    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    pub fn numeric_id(&self) -> i64 {
        self.numeric_id
    }

    /// Entry at an internal path.
    pub fn get(&self, path: &str) -> VfsResult<Option<CacheEntry>> {
        let storage = self.numeric_id;
        self.db.with(|conn| get_row(conn, storage, path))
    }

    /// Entry by file id, if it belongs to this storage.
    pub fn get_by_id(&self, file_id: i64) -> VfsResult<Option<CacheEntry>> {
        let storage = self.numeric_id;
        self.db.with(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM filecache WHERE storage = ?1 AND fileid = ?2"),
                params![storage, file_id],
                row_to_entry,
            )
            .optional()
        })
    }

    /// Internal path of a file id.
    pub fn path_by_id(&self, file_id: i64) -> VfsResult<Option<String>> {
        Ok(self.get_by_id(file_id)?.map(|e| e.path))
    }

    /// Direct children of a directory, ordered by name.
    pub fn contents(&self, path: &str) -> VfsResult<Vec<CacheEntry>> {
        let storage = self.numeric_id;
        self.db.with(|conn| {
            let Some(parent) = get_row(conn, storage, path)?.and_then(|e| e.file_id) else {
                return Ok(Vec::new());
            };
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM filecache WHERE storage = ?1 AND parent = ?2 ORDER BY name"
            ))?;
            let rows = stmt.query_map(params![storage, parent], row_to_entry)?;
            rows.collect()
        })
    }

    /// Insert or update the entry at `path`. Returns its file id.
    pub fn put(&self, path: &str, update: &CacheUpdate) -> VfsResult<i64> {
        let storage = self.numeric_id;
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            let id = match get_row(&tx, storage, path)?.and_then(|e| e.file_id) {
                Some(id) => {
                    update_row(&tx, id, update)?;
                    id
                }
                None => {
                    let parent = ensure_parent(&tx, storage, path, update.mtime.unwrap_or(0))?;
                    insert_row(&tx, storage, path, parent, update)?
                }
            };
            tx.commit()?;
            Ok(id)
        })
    }

    /// Update an entry by file id.
    pub fn update(&self, file_id: i64, update: &CacheUpdate) -> VfsResult<()> {
        self.db.with(|conn| update_row(conn, file_id, update))
    }

    /// Remove an entry and everything below it.
    pub fn remove(&self, path: &str) -> VfsResult<usize> {
        let storage = self.numeric_id;
        let removed = self.db.with(|conn| delete_subtree(conn, storage, path))?;
        if removed > 0 {
            tracing::debug!(storage = %self.storage_id, path, removed, "removed cache entries");
        }
        Ok(removed)
    }

    /// Move an entry and its descendants, keeping their file ids.
    ///
    /// Whatever was cached at `target` is replaced.
    pub fn move_entry(&self, source: &str, target: &str) -> VfsResult<()> {
        let storage = self.numeric_id;
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            let Some(entry) = get_row(&tx, storage, source)? else {
                return Ok(());
            };
            let Some(file_id) = entry.file_id else {
                return Ok(());
            };

            delete_subtree(&tx, storage, target)?;
            let parent = ensure_parent(&tx, storage, target, entry.mtime)?;
            let mimetype = if entry.is_dir() {
                entry.mimetype.clone()
            } else {
                guess_mimetype(target, false)
            };
            tx.execute(
                "UPDATE filecache SET path = ?1, name = ?2, parent = ?3, mimetype = ?4 WHERE fileid = ?5",
                params![target, basename(target), parent, mimetype, file_id],
            )?;

            let (source_prefix, source_len) = subtree_prefix(source);
            let (target_prefix, _) = subtree_prefix(target);
            tx.execute(
                "UPDATE filecache SET path = ?1 || substr(path, ?2)
                 WHERE storage = ?3 AND substr(path, 1, ?4) = ?5",
                params![target_prefix, source_len + 1, storage, source_len, source_prefix],
            )?;
            tx.commit()
        })
    }

    /// What the cache knows about `path`.
    pub fn status(&self, path: &str) -> VfsResult<CacheStatus> {
        let Some(entry) = self.get(path)? else {
            return Ok(CacheStatus::NotFound);
        };
        if entry.size_known() {
            return Ok(CacheStatus::Complete);
        }
        if entry.is_dir() && self.contents(path)?.is_empty() {
            Ok(CacheStatus::Partial)
        } else {
            Ok(CacheStatus::Shallow)
        }
    }

    /// Recompute a directory's size from its direct children.
    ///
    /// A child of unknown size makes the directory unknown too. Files
    /// return their own size unchanged.
    pub fn calculate_folder_size(&self, path: &str) -> VfsResult<i64> {
        let storage = self.numeric_id;
        self.db.with(|conn| {
            let Some(entry) = get_row(conn, storage, path)? else {
                return Ok(SIZE_UNKNOWN);
            };
            let Some(file_id) = entry.file_id else {
                return Ok(SIZE_UNKNOWN);
            };
            if !entry.is_dir() {
                return Ok(entry.size);
            }
            let (sum, min): (i64, i64) = conn.query_row(
                "SELECT COALESCE(SUM(size), 0), COALESCE(MIN(size), 0)
                 FROM filecache WHERE storage = ?1 AND parent = ?2",
                params![storage, file_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let total = if min < 0 { SIZE_UNKNOWN } else { sum };
            if total != entry.size {
                update_row(conn, file_id, &CacheUpdate::new().with_size(total))?;
            }
            Ok(total)
        })
    }

    /// Recompute sizes of `path` and every ancestor up to the storage root.
    pub fn correct_folder_size(&self, path: &str) -> VfsResult<()> {
        let mut current = path;
        loop {
            self.calculate_folder_size(current)?;
            if current.is_empty() {
                return Ok(());
            }
            current = internal_parent(current);
        }
    }

    /// Entries whose name contains `query` (ASCII case-insensitive).
    pub fn search(&self, query: &str) -> VfsResult<Vec<CacheEntry>> {
        let storage = self.numeric_id;
        let pattern = format!("%{}%", escape_like(query));
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM filecache
                 WHERE storage = ?1 AND path <> '' AND name LIKE ?2 ESCAPE '\\' ORDER BY path"
            ))?;
            let rows = stmt.query_map(params![storage, pattern], row_to_entry)?;
            rows.collect()
        })
    }

    /// Entries by mimetype: `text/plain` matches exactly, `text` matches
    /// every `text/*` type.
    pub fn search_by_mime(&self, mimetype: &str) -> VfsResult<Vec<CacheEntry>> {
        let storage = self.numeric_id;
        self.db.with(|conn| {
            let (sql, needle) = if mimetype.contains('/') {
                (
                    format!(
                        "SELECT {COLUMNS} FROM filecache
                         WHERE storage = ?1 AND mimetype = ?2 ORDER BY path"
                    ),
                    mimetype.to_string(),
                )
            } else {
                (
                    format!(
                        "SELECT {COLUMNS} FROM filecache
                         WHERE storage = ?1 AND substr(mimetype, 1, length(?2)) = ?2 ORDER BY path"
                    ),
                    format!("{}/", mimetype),
                )
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![storage, needle], row_to_entry)?;
            rows.collect()
        })
    }

    /// Drop entries whose parent no longer exists.
    pub fn purge_orphans(&self) -> VfsResult<usize> {
        let storage = self.numeric_id;
        self.db.with(|conn| {
            let mut total = 0;
            loop {
                let removed = conn.execute(
                    "DELETE FROM filecache WHERE storage = ?1 AND parent <> -1
                     AND parent NOT IN (SELECT fileid FROM filecache WHERE storage = ?1)",
                    params![storage],
                )?;
                if removed == 0 {
                    return Ok(total);
                }
                total += removed;
            }
        })
    }

    /// Number of cached entries.
    pub fn len(&self) -> VfsResult<usize> {
        let storage = self.numeric_id;
        self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM filecache WHERE storage = ?1",
                params![storage],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
        })
    }

    pub fn is_empty(&self) -> VfsResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Forget everything cached for this storage.
    pub fn clear(&self) -> VfsResult<()> {
        self.remove("")?;
        Ok(())
    }
}

impl std::fmt::Debug for StorageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCache")
            .field("storage_id", &self.storage_id)
            .field("numeric_id", &self.numeric_id)
            .finish()
    }
}
