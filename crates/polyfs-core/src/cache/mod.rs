//! Metadata cache.
//!
//! - [`CacheDb`] - SQLite database shared by all storages
//! - [`StorageCache`] - the rows of one storage
//! - [`Scanner`] - reconciles the cache with a storage listing
//! - [`Watcher`] - notices changes made behind the cache's back
//! - [`Updater`] - follows mutations made through a view

mod db;
mod entry;
mod scanner;
mod storage_cache;
mod updater;
mod watcher;

pub use db::CacheDb;
pub use entry::{
    CacheEntry, CacheUpdate, DIR_MIMETYPE, Permissions, SIZE_UNKNOWN, guess_mimetype, new_etag,
};
pub use scanner::{Reuse, ScanDepth, Scanner};
pub use storage_cache::{CacheStatus, StorageCache};
pub use updater::Updater;
pub use watcher::{WatchPolicy, Watcher};
