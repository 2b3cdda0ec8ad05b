//! Virtual Filesystem abstraction.
//!
//! This module provides the storage-facing half of the filesystem.
//! Key components:
//!
//! - [`Storage`] - Core trait every backend implements
//! - [`CrossStorageTransfer`] - Optional backend-to-backend fast path
//! - [`MountRegistry`] - Routes logical paths to storages
//! - [`MemoryBackend`] - In-memory storage (scratch, testing)
//! - [`LocalBackend`] - Local filesystem access (with path security)
//!
//! ## Design Decisions
//!
//! - **Path-based, no inodes**: Storages see relative internal paths,
//!   `""` being the storage root.
//! - **Explicit offset/size**: Read/write take offset and size so handles
//!   need no backend state.
//! - **Longest-prefix routing**: The registry routes to the most specific
//!   mount point that matches.

pub mod backends;
mod error;
mod mount;
pub mod path;
pub mod storage;
pub mod types;

pub use backends::{LocalBackend, MemoryBackend};
pub use error::{VfsError, VfsResult};
pub use mount::{Mount, MountOptions, MountRegistry};
pub use path::PathLimits;
pub use storage::{CrossStorageTransfer, Storage};
pub use types::{DirEntry, FileAttr, FileType, OpenMode, SetAttr, StatFs};
