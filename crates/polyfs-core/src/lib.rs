//! # polyfs-core
//!
//! A virtual filesystem stitched together from independent storages.
//!
//! A [`Filesystem`] owns a mount table of storages (memory, local
//! directories) attached at logical paths, plus the state every view
//! shares:
//! - a SQLite metadata cache with scanner, watcher and updater
//! - an advisory shared/exclusive lock table
//! - a hook bus for pre/post operation listeners
//!
//! All path operations go through a [`View`], a window rooted at some
//! logical prefix. The view resolves paths to mounts, takes locks, fires
//! hooks, calls the storage and keeps the cache in step, including moves
//! and copies that cross from one storage to another.

pub mod cache;
pub mod config;
pub mod filesystem;
pub mod hooks;
pub mod lock;
pub mod view;
pub mod vfs;

pub use cache::{CacheDb, CacheEntry, CacheUpdate, Permissions, WatchPolicy};
pub use config::{BackendConfig, FilesystemConfig, MountConfig};
pub use filesystem::Filesystem;
pub use hooks::{HookBus, HookControl, HookEvent, HookPhase, HookSignal, ListenerId, matches_pattern};
pub use lock::{LockKind, LockingProvider, MemoryLockingProvider, MountLock, NoopLockingProvider};
pub use view::{FileHandle, FileInfo, View};
pub use vfs::{
    CrossStorageTransfer, DirEntry, FileAttr, FileType, LocalBackend, MemoryBackend, Mount,
    MountOptions, MountRegistry, OpenMode, PathLimits, SetAttr, StatFs, Storage, VfsError,
    VfsResult,
};
