//! Mount registry with longest-prefix routing.
//!
//! Maps logical path prefixes to storages. A storage may be mounted at
//! several points; all of them share one [`StorageCache`].

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::{VfsError, VfsResult};
use super::path::normalize_path;
use super::storage::Storage;
use crate::cache::{CacheDb, Scanner, StorageCache, Updater, WatchPolicy, Watcher};

/// Per-mount options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// When reads check the storage for external changes.
    #[serde(rename = "filesystem_check_changes")]
    pub watch_policy: WatchPolicy,
    /// The mount is a share received from another principal.
    pub shared: bool,
    /// Whether deleting the mount point may detach the mount.
    pub removable: bool,
    /// Free-form options for storages and front-ends.
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            watch_policy: WatchPolicy::default(),
            shared: false,
            removable: true,
            extra: BTreeMap::new(),
        }
    }
}

impl MountOptions {
    pub fn with_watch_policy(mut self, policy: WatchPolicy) -> Self {
        self.watch_policy = policy;
        self
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_removable(mut self, removable: bool) -> Self {
        self.removable = removable;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// A storage attached at a logical path.
pub struct Mount {
    /// Normalized with a trailing `/` (`/` for the root).
    point: String,
    storage: Arc<dyn Storage>,
    cache: Arc<StorageCache>,
    watcher: Arc<Watcher>,
    options: MountOptions,
    movable: bool,
}

impl Mount {
    /// Mount point with trailing `/`.
    pub fn point(&self) -> &str {
        &self.point
    }

    /// Mount point as a logical path (`/` or `/a/b`).
    pub fn path(&self) -> &str {
        if self.point == "/" {
            "/"
        } else {
            self.point.trim_end_matches('/')
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn storage_id(&self) -> &str {
        self.storage.id()
    }

    /// Numeric id of the storage in the cache database.
    pub fn numeric_id(&self) -> i64 {
        self.cache.numeric_id()
    }

    pub fn cache(&self) -> &Arc<StorageCache> {
        &self.cache
    }

    pub fn watcher(&self) -> &Arc<Watcher> {
        &self.watcher
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(Arc::clone(&self.storage), Arc::clone(&self.cache))
    }

    pub fn updater(&self) -> Updater {
        Updater::new(Arc::clone(&self.storage), Arc::clone(&self.cache))
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn is_movable(&self) -> bool {
        self.movable
    }

    pub fn is_shared(&self) -> bool {
        self.options.shared
    }

    pub fn is_removable(&self) -> bool {
        self.options.removable
    }

    pub fn is_root(&self) -> bool {
        self.point == "/"
    }

    /// Internal path for a normalized logical path under this mount.
    pub fn internal_path(&self, path: &str) -> Option<String> {
        let candidate = with_trailing_slash(path);
        candidate
            .strip_prefix(&self.point)
            .map(|rest| rest.trim_end_matches('/').to_string())
    }

    /// Logical path for an internal path of this mount.
    pub fn logical_path(&self, internal: &str) -> String {
        if internal.is_empty() {
            self.path().to_string()
        } else {
            format!("{}{}", self.point, internal)
        }
    }

    fn relocated(&self, point: String) -> Self {
        Self {
            point,
            storage: Arc::clone(&self.storage),
            cache: Arc::clone(&self.cache),
            watcher: Arc::clone(&self.watcher),
            options: self.options.clone(),
            movable: self.movable,
        }
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("point", &self.point)
            .field("storage", &self.storage.id())
            .field("movable", &self.movable)
            .field("options", &self.options)
            .finish()
    }
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Normalize a mount point: leading `/`, trailing `/`.
fn normalize_point(point: &str) -> VfsResult<String> {
    Ok(with_trailing_slash(&normalize_path(point)?))
}

/// Routes logical paths to mounted storages.
///
/// Mount points are matched by longest prefix. For example, if `/mnt` and
/// `/mnt/project` are both mounted, a path like `/mnt/project/src/main.rs`
/// will be routed to the `/mnt/project` mount.
pub struct MountRegistry {
    db: Arc<CacheDb>,
    mounts: RwLock<BTreeMap<String, Arc<Mount>>>,
    caches: DashMap<String, Arc<StorageCache>>,
}

impl MountRegistry {
    pub fn new(db: Arc<CacheDb>) -> Self {
        Self {
            db,
            mounts: RwLock::new(BTreeMap::new()),
            caches: DashMap::new(),
        }
    }

    pub fn cache_db(&self) -> &Arc<CacheDb> {
        &self.db
    }

    /// Cache of a storage, shared by all of its mounts.
    pub fn cache_for(&self, storage: &dyn Storage) -> VfsResult<Arc<StorageCache>> {
        if let Some(cache) = self.caches.get(storage.id()) {
            return Ok(Arc::clone(&cache));
        }
        let cache = Arc::new(StorageCache::new(Arc::clone(&self.db), storage.id())?);
        Ok(Arc::clone(
            self.caches
                .entry(storage.id().to_string())
                .or_insert(cache)
                .value(),
        ))
    }

    /// Attach `storage` at `point`, replacing any mount already there.
    pub fn mount(
        &self,
        storage: Arc<dyn Storage>,
        point: &str,
        options: MountOptions,
    ) -> VfsResult<Arc<Mount>> {
        self.insert(storage, point, options, false)
    }

    /// Attach a mount whose point can later be moved with [`move_mount`](Self::move_mount).
    pub fn mount_movable(
        &self,
        storage: Arc<dyn Storage>,
        point: &str,
        options: MountOptions,
    ) -> VfsResult<Arc<Mount>> {
        self.insert(storage, point, options, true)
    }

    fn insert(
        &self,
        storage: Arc<dyn Storage>,
        point: &str,
        options: MountOptions,
        movable: bool,
    ) -> VfsResult<Arc<Mount>> {
        let point = normalize_point(point)?;
        let cache = self.cache_for(storage.as_ref())?;
        let watcher = Arc::new(Watcher::new(
            Arc::clone(&storage),
            Arc::clone(&cache),
            options.watch_policy,
        ));
        let mount = Arc::new(Mount {
            point: point.clone(),
            storage,
            cache,
            watcher,
            options,
            movable,
        });
        tracing::debug!(point = %point, storage = %mount.storage_id(), movable, "mounted");
        self.mounts.write().insert(point, Arc::clone(&mount));
        Ok(mount)
    }

    /// Detach the mount at `point`.
    pub fn unmount(&self, point: &str) -> Option<Arc<Mount>> {
        let point = normalize_point(point).ok()?;
        let removed = self.mounts.write().remove(&point);
        if removed.is_some() {
            tracing::debug!(point = %point, "unmounted");
        }
        removed
    }

    /// Mount responsible for `path` and the storage-internal path.
    pub fn resolve(&self, path: &str) -> VfsResult<(Arc<Mount>, String)> {
        let mount = self
            .find(path)
            .ok_or_else(|| VfsError::no_mount_point(path))?;
        let internal = mount
            .internal_path(path)
            .ok_or_else(|| VfsError::no_mount_point(path))?;
        Ok((mount, internal))
    }

    /// Most specific mount containing `path`.
    pub fn find(&self, path: &str) -> Option<Arc<Mount>> {
        let candidate = with_trailing_slash(path);
        let mounts = self.mounts.read();
        mounts
            .iter()
            .filter(|(point, _)| candidate.starts_with(point.as_str()))
            .max_by_key(|(point, _)| point.len())
            .map(|(_, mount)| Arc::clone(mount))
    }

    /// Mount attached exactly at `path`, if any.
    pub fn get(&self, path: &str) -> Option<Arc<Mount>> {
        let point = normalize_point(path).ok()?;
        self.mounts.read().get(&point).cloned()
    }

    /// All mounts strictly below `path`.
    pub fn find_in(&self, path: &str) -> Vec<Arc<Mount>> {
        let prefix = with_trailing_slash(path);
        self.mounts
            .read()
            .range(prefix.clone()..)
            .take_while(|(point, _)| point.starts_with(&prefix))
            .filter(|(point, _)| **point != prefix)
            .map(|(_, mount)| Arc::clone(mount))
            .collect()
    }

    /// Every mount of the storage with this numeric id.
    pub fn mounts_for_storage(&self, numeric_id: i64) -> Vec<Arc<Mount>> {
        self.mounts
            .read()
            .values()
            .filter(|m| m.numeric_id() == numeric_id)
            .cloned()
            .collect()
    }

    /// All mounts, ordered by point.
    pub fn list(&self) -> Vec<Arc<Mount>> {
        self.mounts.read().values().cloned().collect()
    }

    /// Relocate a movable mount. Only the registry changes; the storage
    /// content is not touched.
    ///
    /// Returns false if nothing is mounted at `old` or it is not movable.
    pub fn move_mount(&self, old: &str, new: &str) -> VfsResult<bool> {
        let old = normalize_point(old)?;
        let new = normalize_point(new)?;
        let mut mounts = self.mounts.write();
        let Some(mount) = mounts.get(&old).cloned() else {
            return Ok(false);
        };
        if !mount.is_movable() || mount.is_root() {
            return Ok(false);
        }
        if mounts.contains_key(&new) {
            return Err(VfsError::already_exists(new));
        }
        mounts.remove(&old);
        mounts.insert(new.clone(), Arc::new(mount.relocated(new.clone())));
        tracing::debug!(from = %old, to = %new, "moved mount");
        Ok(true)
    }
}

impl std::fmt::Debug for MountRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountRegistry")
            .field("mounts", &self.mounts.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
