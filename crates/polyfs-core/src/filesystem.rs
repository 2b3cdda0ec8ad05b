//! Process-wide filesystem context.
//!
//! Owns what every [`View`] shares: the mount registry, the cache
//! database, the lock table and the hook bus. Views are cheap handles onto
//! it.

use std::sync::Arc;

use crate::cache::{CacheDb, Reuse, ScanDepth};
use crate::config::FilesystemConfig;
use crate::hooks::HookBus;
use crate::lock::{LockingProvider, MemoryLockingProvider, NoopLockingProvider};
use crate::view::View;
use crate::vfs::path::{PathLimits, normalize_path};
use crate::vfs::{Mount, MountOptions, MountRegistry, Storage, VfsResult};

pub struct Filesystem {
    registry: Arc<MountRegistry>,
    locking: Arc<dyn LockingProvider>,
    hooks: Arc<HookBus>,
    limits: PathLimits,
}

impl Filesystem {
    pub fn new(db: CacheDb, locking: Arc<dyn LockingProvider>) -> Self {
        Self {
            registry: Arc::new(MountRegistry::new(Arc::new(db))),
            locking,
            hooks: Arc::new(HookBus::new()),
            limits: PathLimits::default(),
        }
    }

    /// In-memory cache with in-process locking.
    pub fn in_memory() -> VfsResult<Self> {
        Ok(Self::new(
            CacheDb::in_memory()?,
            Arc::new(MemoryLockingProvider::new()),
        ))
    }

    /// Build the cache, lock table and mounts described by `config`.
    pub fn from_config(config: &FilesystemConfig) -> VfsResult<Self> {
        config.validate()?;
        let db = match &config.cache.path {
            Some(path) => CacheDb::open(path)?,
            None => CacheDb::in_memory()?,
        };
        let locking: Arc<dyn LockingProvider> = if config.locking.enabled {
            Arc::new(MemoryLockingProvider::new())
        } else {
            Arc::new(NoopLockingProvider)
        };

        let fs = Self::new(db, locking).with_limits(config.limits);
        for mount in &config.mounts {
            let storage = mount.backend.build()?;
            if mount.movable {
                fs.mount_movable(storage, &mount.point, mount.options.clone())?;
            } else {
                fs.mount(storage, &mount.point, mount.options.clone())?;
            }
        }
        tracing::info!(
            mounts = config.mounts.len(),
            locking = config.locking.enabled,
            persistent_cache = config.cache.path.is_some(),
            "filesystem ready"
        );
        Ok(fs)
    }

    pub fn with_limits(mut self, limits: PathLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn registry(&self) -> &Arc<MountRegistry> {
        &self.registry
    }

    pub fn cache_db(&self) -> &Arc<CacheDb> {
        self.registry.cache_db()
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    pub fn locking(&self) -> &Arc<dyn LockingProvider> {
        &self.locking
    }

    pub fn limits(&self) -> PathLimits {
        self.limits
    }

    /// A view rooted at `root`.
    pub fn view(&self, root: &str) -> VfsResult<View> {
        View::new(
            root,
            Arc::clone(&self.registry),
            Arc::clone(&self.locking),
            Arc::clone(&self.hooks),
            self.limits,
        )
    }

    pub fn mount(
        &self,
        storage: Arc<dyn Storage>,
        point: &str,
        options: MountOptions,
    ) -> VfsResult<Arc<Mount>> {
        self.registry.mount(storage, point, options)
    }

    pub fn mount_movable(
        &self,
        storage: Arc<dyn Storage>,
        point: &str,
        options: MountOptions,
    ) -> VfsResult<Arc<Mount>> {
        self.registry.mount_movable(storage, point, options)
    }

    pub fn unmount(&self, point: &str) -> Option<Arc<Mount>> {
        self.registry.unmount(point)
    }

    /// Recursively rescan `path` and every mount below it.
    ///
    /// Returns the number of mounts scanned.
    pub async fn scan(&self, path: &str) -> VfsResult<usize> {
        let path = normalize_path(path)?;
        let mut scanned = 0;

        if let Some(mount) = self.registry.find(&path) {
            if let Some(internal) = mount.internal_path(&path) {
                mount
                    .scanner()
                    .scan(&internal, ScanDepth::Recursive, Reuse::ETAG)
                    .await?;
                scanned += 1;
            }
        }
        for mount in self.registry.find_in(&path) {
            mount
                .scanner()
                .scan("", ScanDepth::Recursive, Reuse::ETAG)
                .await?;
            scanned += 1;
        }
        tracing::info!(path = %path, mounts = scanned, "scan complete");
        Ok(scanned)
    }
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("registry", &self.registry)
            .field("limits", &self.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilesystemConfig;
    use crate::lock::LockKind;
    use crate::vfs::MemoryBackend;

    #[tokio::test]
    async fn test_from_config_mounts_backends() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi there").unwrap();
        let text = format!(
            r#"
            [cache]
            path = "{}"

            [[mounts]]
            point = "/"
            backend = {{ type = "memory" }}

            [[mounts]]
            point = "/disk"
            backend = {{ type = "local", root = "{}" }}
            "#,
            dir.path().join("cache.db").display(),
            dir.path().display()
        );
        let config = FilesystemConfig::from_toml_str(&text).unwrap();
        let fs = Filesystem::from_config(&config).unwrap();

        assert_eq!(fs.registry().list().len(), 2);
        assert_eq!(fs.scan("/").await.unwrap(), 2);

        let view = fs.view("/").unwrap();
        let info = view.get_file_info("/disk/hello.txt", false).await.unwrap().unwrap();
        assert_eq!(info.size(), 8);
        assert_eq!(info.mimetype(), "text/plain");
    }

    #[tokio::test]
    async fn test_locking_disabled() {
        let config = FilesystemConfig::from_toml_str(
            r#"
            [locking]
            enabled = false

            [[mounts]]
            point = "/"
            backend = { type = "memory" }
            "#,
        )
        .unwrap();
        let fs = Filesystem::from_config(&config).unwrap();
        let view = fs.view("/").unwrap();

        view.lock_file("/f", LockKind::Exclusive, Default::default()).unwrap();
        assert!(view.file_put_contents("/f", b"x").await.unwrap());
        assert_eq!(view.lock_state("/f").unwrap(), None);
    }

    #[tokio::test]
    async fn test_views_share_state() {
        let fs = Filesystem::in_memory().unwrap();
        fs.mount(Arc::new(MemoryBackend::new()), "/", MountOptions::default())
            .unwrap();
        let a = fs.view("/").unwrap();
        let b = fs.view("/").unwrap();

        a.file_put_contents("/shared.txt", b"1").await.unwrap();
        assert!(b.file_exists("/shared.txt").await.unwrap());

        a.lock_file("/shared.txt", LockKind::Exclusive, Default::default())
            .unwrap();
        assert!(b.file_get_contents("/shared.txt").await.unwrap_err().is_locked());
        a.unlock_file("/shared.txt", LockKind::Exclusive, Default::default())
            .unwrap();
        assert!(b.file_get_contents("/shared.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scan_counts_nested_mounts() {
        let fs = Filesystem::in_memory().unwrap();
        fs.mount(Arc::new(MemoryBackend::new()), "/", MountOptions::default())
            .unwrap();
        let sub = Arc::new(MemoryBackend::new());
        sub.write_all("x.txt", b"xyz").await.unwrap();
        fs.mount(sub, "/a/sub", MountOptions::default()).unwrap();

        assert_eq!(fs.scan("/a").await.unwrap(), 2);
        let view = fs.view("/").unwrap();
        let root = view.get_file_info("/", true).await.unwrap().unwrap();
        assert_eq!(root.size(), 3);
    }
}
