//! Rooted window onto the mounted filesystem.
//!
//! Every operation resolves its path through the [`MountRegistry`], takes
//! the locks it needs, fires pre hooks, calls the storage, brings the cache
//! up to date and fires post hooks. Locks live in a [`LockGuard`] scoped to
//! the call, so they are released on every exit path.
//!
//! Backend errors propagate. `Ok(false)` means the operation was refused
//! without side effects: a hook cancelled it, it targets the view root, an
//! ancestor of the target is a file, or a cross-storage transfer failed
//! and was rolled back.

mod handle;
mod info;
mod transfer;

pub use handle::FileHandle;
pub use info::FileInfo;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::cache::{
    CacheEntry, CacheStatus, CacheUpdate, Permissions, Reuse, ScanDepth, StorageCache, new_etag,
};
use crate::hooks::{HookBus, HookControl, HookEvent, HookPhase, HookSignal};
use crate::lock::{LockGuard, LockKind, LockingProvider, MountLock};
use crate::vfs::path::{self, PathLimits};
use crate::vfs::storage::lock_key;
use crate::vfs::types::to_unix_secs;
use crate::vfs::{
    FileAttr, Mount, MountRegistry, OpenMode, SetAttr, Storage, VfsError, VfsResult,
};
use transfer::TransferKind;

/// A view path resolved to its mount.
#[derive(Debug, Clone)]
struct Resolved {
    /// Relative to the view root.
    rel: String,
    /// Global logical path.
    abs: String,
    mount: Arc<Mount>,
    internal: String,
}

impl Resolved {
    fn storage(&self) -> &Arc<dyn Storage> {
        self.mount.storage()
    }

    /// Whether a non-root mount is attached exactly here.
    fn is_mount_point(&self) -> bool {
        self.internal.is_empty() && !self.mount.is_root()
    }
}

/// Report lock conflicts with the path the caller used.
fn relabel(err: VfsError, path: &str) -> VfsError {
    match err {
        VfsError::Locked { kind, .. } => VfsError::locked(path, kind),
        other => other,
    }
}

/// Hooks fired around a write: `create` or `update`, then `write`.
fn write_signals(exists: bool) -> [HookSignal; 2] {
    if exists {
        [HookSignal::Update, HookSignal::Write]
    } else {
        [HookSignal::Create, HookSignal::Write]
    }
}

/// Placeholder for a directory that only exists because mounts sit below it.
fn virtual_entry(internal: &str) -> CacheEntry {
    let mut entry = CacheEntry::transient(internal, 0, 0, true);
    entry.permissions = Permissions::READ;
    entry
}

/// Adjust a mount root's permissions to what can be done with the mount.
fn apply_mount_permissions(entry: &mut CacheEntry, mount: &Mount) {
    if mount.is_movable() {
        entry.permissions |= Permissions::UPDATE | Permissions::DELETE;
    } else {
        entry.permissions.remove(Permissions::UPDATE);
        if !mount.is_removable() {
            entry.permissions.remove(Permissions::DELETE);
        }
    }
}

fn mime_matches(info: &FileInfo, filter: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(exact) if exact.contains('/') => info.mimetype() == exact,
        Some(part) => info.mime_part() == part,
    }
}

fn now_secs() -> i64 {
    to_unix_secs(SystemTime::now())
}

/// Filesystem operations relative to a fixed root.
#[derive(Clone)]
pub struct View {
    root: String,
    registry: Arc<MountRegistry>,
    locking: Arc<dyn LockingProvider>,
    hooks: Arc<HookBus>,
    limits: PathLimits,
}

impl View {
    pub fn new(
        root: &str,
        registry: Arc<MountRegistry>,
        locking: Arc<dyn LockingProvider>,
        hooks: Arc<HookBus>,
        limits: PathLimits,
    ) -> VfsResult<Self> {
        path::verify_path(root, &limits)?;
        Ok(Self {
            root: path::normalize_path(root)?,
            registry,
            locking,
            hooks,
            limits,
        })
    }

    /// Logical path this view is rooted at.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn registry(&self) -> &Arc<MountRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Path space
    // ------------------------------------------------------------------

    /// Global logical path for a view path.
    pub fn get_absolute_path(&self, path: &str) -> VfsResult<String> {
        let rel = self.relative(path)?;
        Ok(self.absolute(&rel))
    }

    /// View path for a global logical path, `None` if it lies outside the root.
    pub fn get_relative_path(&self, absolute: &str) -> Option<String> {
        let absolute = path::normalize_path(absolute).ok()?;
        if self.root == "/" {
            return Some(absolute);
        }
        if absolute == self.root {
            return Some("/".to_string());
        }
        absolute
            .strip_prefix(&self.root)
            .filter(|rest| rest.starts_with('/'))
            .map(str::to_string)
    }

    fn relative(&self, path: &str) -> VfsResult<String> {
        path::verify_path(path, &self.limits)?;
        let rel = path::normalize_path(path)?;
        if self.absolute(&rel).len() > self.limits.max_path_length {
            return Err(VfsError::invalid_path(format!(
                "path exceeds {} characters",
                self.limits.max_path_length
            )));
        }
        Ok(rel)
    }

    fn absolute(&self, rel: &str) -> String {
        if self.root == "/" {
            rel.to_string()
        } else if rel == "/" {
            self.root.clone()
        } else {
            format!("{}{}", self.root, rel)
        }
    }

    fn resolve(&self, path: &str) -> VfsResult<Resolved> {
        let rel = self.relative(path)?;
        let abs = self.absolute(&rel);
        let (mount, internal) = self.registry.resolve(&abs)?;
        Ok(Resolved {
            rel,
            abs,
            mount,
            internal,
        })
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    fn guard(&self) -> LockGuard {
        LockGuard::new(Arc::clone(&self.locking))
    }

    /// Storage paths a lock on `r` covers.
    ///
    /// A mount point is locked in its parent storage and, with
    /// [`MountLock::PointAndRoot`], at the root of the mounted storage.
    fn lock_targets(&self, r: &Resolved, mount_lock: MountLock) -> Vec<(Arc<dyn Storage>, String)> {
        if !r.is_mount_point() {
            return vec![(Arc::clone(r.storage()), r.internal.clone())];
        }
        let mut targets = Vec::with_capacity(2);
        if let Some(parent) = self.registry.find(&path::dirname(&r.abs)) {
            if let Some(internal) = parent.internal_path(&r.abs) {
                targets.push((Arc::clone(parent.storage()), internal));
            }
        }
        if mount_lock == MountLock::PointAndRoot || targets.is_empty() {
            targets.push((Arc::clone(r.storage()), String::new()));
        }
        targets
    }

    fn lock(
        &self,
        guard: &mut LockGuard,
        r: &Resolved,
        kind: LockKind,
        mount_lock: MountLock,
    ) -> VfsResult<()> {
        for (storage, internal) in self.lock_targets(r, mount_lock) {
            guard
                .acquire(&storage, &internal, kind)
                .map_err(|e| relabel(e, &r.rel))?;
        }
        Ok(())
    }

    /// Lock `path` beyond the current call. Release with
    /// [`unlock_file`](Self::unlock_file).
    pub fn lock_file(&self, path: &str, kind: LockKind, mount_lock: MountLock) -> VfsResult<()> {
        let r = self.resolve(path)?;
        let mut guard = self.guard();
        self.lock(&mut guard, &r, kind, mount_lock)?;
        guard.detach();
        Ok(())
    }

    pub fn unlock_file(&self, path: &str, kind: LockKind, mount_lock: MountLock) -> VfsResult<()> {
        let r = self.resolve(path)?;
        for (storage, internal) in self.lock_targets(&r, mount_lock).iter().rev() {
            storage.release_lock(internal, kind, self.locking.as_ref());
        }
        Ok(())
    }

    /// Convert a lock taken with [`lock_file`](Self::lock_file).
    pub fn change_lock(&self, path: &str, kind: LockKind, mount_lock: MountLock) -> VfsResult<()> {
        let r = self.resolve(path)?;
        let targets = self.lock_targets(&r, mount_lock);
        for (idx, (storage, internal)) in targets.iter().enumerate() {
            if let Err(e) = storage.change_lock(internal, kind, self.locking.as_ref()) {
                let previous = match kind {
                    LockKind::Shared => LockKind::Exclusive,
                    LockKind::Exclusive => LockKind::Shared,
                };
                for (storage, internal) in targets[..idx].iter().rev() {
                    let _ = storage.change_lock(internal, previous, self.locking.as_ref());
                }
                return Err(relabel(e, &r.rel));
            }
        }
        Ok(())
    }

    /// Lock currently held on `path`.
    ///
    /// For a mount point this is the lock on the point in the parent storage.
    pub fn lock_state(&self, path: &str) -> VfsResult<Option<LockKind>> {
        let r = self.resolve(path)?;
        Ok(self
            .lock_targets(&r, MountLock::PointOnly)
            .first()
            .and_then(|(storage, internal)| self.locking.state(&lock_key(storage.id(), internal))))
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    fn emit(&self, signals: &[HookSignal], phase: HookPhase, path: &str, target: Option<&str>) -> HookControl {
        if path::is_partial_file(path) {
            return HookControl::Continue;
        }
        for &signal in signals {
            let mut event = HookEvent::new(signal, phase, path);
            if let Some(target) = target {
                event = event.with_target(target);
            }
            if self.hooks.emit(&event) == HookControl::Cancel && phase == HookPhase::Pre {
                return HookControl::Cancel;
            }
        }
        HookControl::Continue
    }

    /// Fire pre hooks; false if a listener cancelled.
    fn pre(&self, signals: &[HookSignal], path: &str, target: Option<&str>) -> bool {
        self.emit(signals, HookPhase::Pre, path, target) == HookControl::Continue
    }

    fn post(&self, signals: &[HookSignal], path: &str, target: Option<&str>) {
        self.emit(signals, HookPhase::Post, path, target);
    }

    // ------------------------------------------------------------------
    // Cache access
    // ------------------------------------------------------------------

    /// Cache entry for `internal`, scanning or refreshing it first when needed.
    ///
    /// Partial uploads are reported from the storage with no file id.
    async fn mount_entry(&self, mount: &Mount, internal: &str) -> VfsResult<Option<CacheEntry>> {
        let cache = mount.cache();
        let entry = match cache.get(internal)? {
            Some(cached) if cached.size_known() => {
                if self.refresh(mount, internal, &cached).await? {
                    cache.get(internal)?
                } else {
                    Some(cached)
                }
            }
            _ => {
                mount
                    .scanner()
                    .scan(internal, ScanDepth::Shallow, Reuse::ETAG | Reuse::SIZE)
                    .await?
            }
        };

        if entry.is_none() && path::is_partial_file(internal) {
            return match mount.storage().stat(internal).await {
                Ok(attr) => Ok(Some(CacheEntry::transient(
                    internal,
                    attr.size as i64,
                    attr.mtime_secs(),
                    attr.is_dir(),
                ))),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            };
        }
        Ok(entry)
    }

    async fn cache_entry(&self, r: &Resolved) -> VfsResult<Option<CacheEntry>> {
        self.mount_entry(&r.mount, &r.internal).await
    }

    /// Let the watcher pick up external changes to `internal`.
    ///
    /// Skipped while another operation holds the path exclusively.
    async fn refresh(&self, mount: &Mount, internal: &str, cached: &CacheEntry) -> VfsResult<bool> {
        let watcher = mount.watcher();
        if !watcher.needs_update(internal, cached).await? {
            return Ok(false);
        }
        let mut guard = self.guard();
        match guard.acquire(mount.storage(), internal, LockKind::Shared) {
            Ok(()) => {}
            Err(e) if e.is_locked() => return Ok(false),
            Err(e) => return Err(e),
        }
        watcher.update(internal, cached).await?;
        mount.updater().propagate_change(internal, now_secs())?;
        Ok(true)
    }

    fn has_mounts_below(&self, abs: &str) -> bool {
        !self.registry.find_in(abs).is_empty()
    }

    fn file_info(&self, r: &Resolved, mut entry: CacheEntry) -> FileInfo {
        if r.is_mount_point() {
            apply_mount_permissions(&mut entry, &r.mount);
        }
        FileInfo::new(
            r.rel.clone(),
            r.internal.clone(),
            r.mount.path(),
            r.mount.storage_id(),
            entry,
        )
    }

    /// Create missing ancestors of `r` inside its storage.
    ///
    /// Returns false if one of them exists as a file.
    async fn ensure_parents(&self, r: &Resolved) -> VfsResult<bool> {
        let storage = r.storage();
        let Some((parents, _)) = r.internal.rsplit_once('/') else {
            return Ok(true);
        };
        let mut current = String::new();
        for name in parents.split('/') {
            current = path::join_internal(&current, name);
            match storage.stat(&current).await {
                Ok(attr) if attr.is_dir() => {}
                Ok(_) => return Ok(false),
                Err(e) if e.is_not_found() => {
                    storage.mkdir(&current, 0o755).await?;
                    r.mount.scanner().scan_file(&current, Reuse::empty()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self), name = "view.stat")]
    pub async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let r = self.resolve(path)?;
        match r.storage().stat(&r.internal).await {
            Err(e) if e.is_not_found() && self.has_mounts_below(&r.abs) => {
                Ok(FileAttr::directory(0o555))
            }
            Err(e) if e.is_not_found() => Err(VfsError::not_found(r.rel)),
            other => other,
        }
    }

    pub async fn file_exists(&self, path: &str) -> VfsResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn is_dir(&self, path: &str) -> VfsResult<bool> {
        match self.stat(path).await {
            Ok(attr) => Ok(attr.is_dir()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn is_file(&self, path: &str) -> VfsResult<bool> {
        match self.stat(path).await {
            Ok(attr) => Ok(attr.is_file()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Size of a file, or the aggregate size of a directory (0 while unknown).
    pub async fn filesize(&self, path: &str) -> VfsResult<u64> {
        let attr = self.stat(path).await?;
        if attr.is_file() {
            return Ok(attr.size);
        }
        Ok(self
            .get_file_info(path, true)
            .await?
            .map(|info| info.size().max(0) as u64)
            .unwrap_or(0))
    }

    pub async fn filemtime(&self, path: &str) -> VfsResult<SystemTime> {
        Ok(self.stat(path).await?.mtime)
    }

    /// Cached metadata for `path`.
    ///
    /// With `include_mounts`, directory sizes and etags account for every
    /// mount below the path.
    #[tracing::instrument(skip(self), name = "view.get_file_info")]
    pub async fn get_file_info(&self, path: &str, include_mounts: bool) -> VfsResult<Option<FileInfo>> {
        let r = self.resolve(path)?;
        let (entry, is_virtual) = match self.cache_entry(&r).await? {
            Some(entry) => (entry, false),
            None if self.has_mounts_below(&r.abs) => (virtual_entry(&r.internal), true),
            None => return Ok(None),
        };

        let mut info = self.file_info(&r, entry);
        if (include_mounts || is_virtual) && info.is_dir() {
            for sub in self.registry.find_in(&r.abs) {
                if let Some(root) = self.mount_entry(&sub, "").await? {
                    info.add_sub_entry(&root);
                }
            }
        }
        Ok(Some(info))
    }

    /// Children of `path`, sorted by name.
    ///
    /// Mounts attached directly below `path` replace a same-named entry;
    /// deeper mounts show up through a (possibly synthesized) directory.
    /// `mime_filter` matches a full mimetype (`text/plain`) exactly or a
    /// top-level type (`text`) by prefix.
    #[tracing::instrument(skip(self), name = "view.get_directory_content")]
    pub async fn get_directory_content(
        &self,
        path: &str,
        mime_filter: Option<&str>,
    ) -> VfsResult<Vec<FileInfo>> {
        let r = self.resolve(path)?;
        let mut files: BTreeMap<String, FileInfo> = BTreeMap::new();

        match self.cache_entry(&r).await? {
            Some(dir) if dir.is_dir() => {
                let cache = r.mount.cache();
                if cache.status(&r.internal)? != CacheStatus::Complete {
                    r.mount
                        .scanner()
                        .scan(&r.internal, ScanDepth::Shallow, Reuse::ETAG | Reuse::SIZE)
                        .await?;
                }
                for child in cache.contents(&r.internal)? {
                    let name = child.name.clone();
                    let info = FileInfo::new(
                        path::join(&r.rel, &name),
                        child.path.clone(),
                        r.mount.path(),
                        r.mount.storage_id(),
                        child,
                    );
                    files.insert(name, info);
                }
            }
            Some(_) => return Ok(Vec::new()),
            None if !self.has_mounts_below(&r.abs) => return Ok(Vec::new()),
            None => {}
        }

        let prefix_len = if r.abs == "/" { 1 } else { r.abs.len() + 1 };
        for sub in self.registry.find_in(&r.abs) {
            let Some(relative) = sub.path().get(prefix_len..) else {
                continue;
            };
            let Some(root) = self.mount_entry(&sub, "").await? else {
                continue;
            };
            match relative.split_once('/') {
                None => {
                    let mut entry = root;
                    apply_mount_permissions(&mut entry, &sub);
                    let info = FileInfo::new(
                        path::join(&r.rel, relative),
                        "",
                        sub.path(),
                        sub.storage_id(),
                        entry,
                    );
                    files.insert(relative.to_string(), info);
                }
                Some((name, _)) => {
                    let info = files.entry(name.to_string()).or_insert_with(|| {
                        let internal = path::join_internal(&r.internal, name);
                        FileInfo::new(
                            path::join(&r.rel, name),
                            internal.clone(),
                            r.mount.path(),
                            r.mount.storage_id(),
                            virtual_entry(&internal),
                        )
                    });
                    info.add_sub_entry(&root);
                }
            }
        }

        Ok(files
            .into_values()
            .filter(|info| mime_matches(info, mime_filter))
            .collect())
    }

    /// Cached entries whose name contains `query`, across every mount in the view.
    pub async fn search(&self, query: &str) -> VfsResult<Vec<FileInfo>> {
        self.search_caches(|cache| cache.search(query))
    }

    /// Cached entries with mimetype `mimetype` (or top-level type, without `/`).
    pub async fn search_by_mime(&self, mimetype: &str) -> VfsResult<Vec<FileInfo>> {
        self.search_caches(|cache| cache.search_by_mime(mimetype))
    }

    fn search_caches(
        &self,
        query: impl Fn(&StorageCache) -> VfsResult<Vec<CacheEntry>>,
    ) -> VfsResult<Vec<FileInfo>> {
        let mut mounts = self.registry.find_in(&self.root);
        if let Some(containing) = self.registry.find(&self.root) {
            mounts.insert(0, containing);
        }

        let mut results = Vec::new();
        for mount in mounts {
            for entry in query(mount.cache().as_ref())? {
                let logical = mount.logical_path(&entry.path);
                // shadowed by a mount attached below this one
                if self.registry.find(&logical).map(|m| m.point() == mount.point()) != Some(true) {
                    continue;
                }
                let Some(rel) = self.get_relative_path(&logical) else {
                    continue;
                };
                let internal = entry.path.clone();
                results.push(FileInfo::new(rel, internal, mount.path(), mount.storage_id(), entry));
            }
        }
        Ok(results)
    }

    /// View path of a cached file id, if it is reachable from this view.
    pub async fn get_path(&self, file_id: i64) -> VfsResult<Option<String>> {
        let Some((numeric_id, internal)) = self.registry.cache_db().get_by_id(file_id)? else {
            return Ok(None);
        };
        Ok(self
            .registry
            .mounts_for_storage(numeric_id)
            .iter()
            .find_map(|mount| self.get_relative_path(&mount.logical_path(&internal))))
    }

    /// Bytes available on the storage holding `path`; `None` when unlimited.
    pub async fn free_space(&self, path: &str) -> VfsResult<Option<u64>> {
        let r = self.resolve(path)?;
        Ok(r.storage().statfs().await?.available_bytes)
    }

    pub fn get_mount(&self, path: &str) -> VfsResult<Arc<Mount>> {
        Ok(self.resolve(path)?.mount)
    }

    /// Logical path of the mount holding `path`.
    pub fn get_mount_point(&self, path: &str) -> VfsResult<String> {
        Ok(self.get_mount(path)?.path().to_string())
    }

    /// Mounts strictly below `path`.
    pub fn get_mounts_in(&self, path: &str) -> VfsResult<Vec<Arc<Mount>>> {
        let abs = self.get_absolute_path(path)?;
        Ok(self.registry.find_in(&abs))
    }

    // ------------------------------------------------------------------
    // Content
    // ------------------------------------------------------------------

    /// Whole content of a file; `None` if a hook cancelled the read.
    #[tracing::instrument(skip(self), name = "view.file_get_contents")]
    pub async fn file_get_contents(&self, path: &str) -> VfsResult<Option<Vec<u8>>> {
        let r = self.resolve(path)?;
        let mut guard = self.guard();
        self.lock(&mut guard, &r, LockKind::Shared, MountLock::PointAndRoot)?;

        if !self.pre(&[HookSignal::Read], &r.rel, None) {
            return Ok(None);
        }
        let data = r.storage().read_all(&r.internal).await?;
        self.post(&[HookSignal::Read], &r.rel, None);
        Ok(Some(data))
    }

    /// Replace the content of a file, creating it and missing parents.
    #[tracing::instrument(skip(self, data), name = "view.file_put_contents", fields(len = data.len()))]
    pub async fn file_put_contents(&self, path: &str, data: &[u8]) -> VfsResult<bool> {
        let r = self.resolve(path)?;
        let mut guard = self.guard();
        self.lock(&mut guard, &r, LockKind::Exclusive, MountLock::PointAndRoot)?;

        let signals = write_signals(r.storage().exists(&r.internal).await);
        if !self.pre(&signals, &r.rel, None) || !self.ensure_parents(&r).await? {
            return Ok(false);
        }
        r.storage().write_all(&r.internal, data).await?;
        r.mount.updater().update(&r.internal, None, true).await?;
        self.post(&signals, &r.rel, None);
        Ok(true)
    }

    /// Open a streaming handle; `None` if a hook cancelled it or a parent
    /// could not be created.
    ///
    /// The handle keeps its lock (Exclusive for writes, Shared for reads)
    /// until [`FileHandle::close`].
    #[tracing::instrument(skip(self), name = "view.fopen")]
    pub async fn fopen(&self, path: &str, mode: OpenMode) -> VfsResult<Option<FileHandle>> {
        let r = self.resolve(path)?;
        let mut guard = self.guard();

        if !mode.is_write() {
            self.lock(&mut guard, &r, LockKind::Shared, MountLock::PointAndRoot)?;
            if !self.pre(&[HookSignal::Read], &r.rel, None) {
                return Ok(None);
            }
            let attr = r.storage().stat(&r.internal).await?;
            if attr.is_dir() {
                return Err(VfsError::is_a_directory(r.rel));
            }
            return Ok(Some(FileHandle::new(
                self.clone(),
                r,
                mode,
                0,
                vec![HookSignal::Read],
                guard,
            )));
        }

        self.lock(&mut guard, &r, LockKind::Exclusive, MountLock::PointAndRoot)?;
        let existing = match r.storage().stat(&r.internal).await {
            Ok(attr) if attr.is_dir() => return Err(VfsError::is_a_directory(r.rel)),
            Ok(attr) => Some(attr),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let signals = write_signals(existing.is_some());
        if !self.pre(&signals, &r.rel, None) || !self.ensure_parents(&r).await? {
            return Ok(None);
        }

        let offset = match (&existing, mode) {
            (None, _) => {
                r.storage().create(&r.internal, 0o644).await?;
                0
            }
            (Some(_), OpenMode::Write) => {
                r.storage().truncate(&r.internal, 0).await?;
                0
            }
            (Some(attr), _) => attr.size,
        };
        Ok(Some(FileHandle::new(
            self.clone(),
            r,
            mode,
            offset,
            signals.to_vec(),
            guard,
        )))
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self), name = "view.mkdir")]
    pub async fn mkdir(&self, path: &str) -> VfsResult<bool> {
        let r = self.resolve(path)?;
        if r.is_mount_point() || r.storage().exists(&r.internal).await {
            return Ok(false);
        }
        let mut guard = self.guard();
        self.lock(&mut guard, &r, LockKind::Exclusive, MountLock::PointAndRoot)?;

        let signals = write_signals(false);
        if !self.pre(&signals, &r.rel, None) || !self.ensure_parents(&r).await? {
            return Ok(false);
        }
        r.storage().mkdir(&r.internal, 0o755).await?;
        r.mount.updater().update(&r.internal, None, true).await?;
        self.post(&signals, &r.rel, None);
        Ok(true)
    }

    /// Remove a directory and everything below it.
    ///
    /// On a mount point this detaches the mount instead.
    #[tracing::instrument(skip(self), name = "view.rmdir")]
    pub async fn rmdir(&self, path: &str) -> VfsResult<bool> {
        let r = self.resolve(path)?;
        if r.rel == "/" || (r.internal.is_empty() && r.mount.is_root()) {
            return Ok(false);
        }
        if r.is_mount_point() {
            return self.detach_mount(&r);
        }
        if !r.storage().stat(&r.internal).await?.is_dir() {
            return Err(VfsError::not_a_directory(r.rel));
        }
        self.delete(&r).await
    }

    /// Delete a file (or directory tree).
    ///
    /// The view root and the filesystem root can never be deleted; a mount
    /// point is detached instead.
    #[tracing::instrument(skip(self), name = "view.unlink")]
    pub async fn unlink(&self, path: &str) -> VfsResult<bool> {
        let r = self.resolve(path)?;
        if r.rel == "/" || (r.internal.is_empty() && r.mount.is_root()) {
            return Ok(false);
        }
        if r.is_mount_point() {
            return self.detach_mount(&r);
        }
        self.delete(&r).await
    }

    async fn delete(&self, r: &Resolved) -> VfsResult<bool> {
        let mut guard = self.guard();
        self.lock(&mut guard, r, LockKind::Exclusive, MountLock::PointAndRoot)?;

        if !self.pre(&[HookSignal::Delete], &r.rel, None) {
            return Ok(false);
        }
        if r.storage().stat(&r.internal).await?.is_dir() {
            r.storage().remove_tree(&r.internal).await?;
        } else {
            r.storage().unlink(&r.internal).await?;
        }
        r.mount.updater().remove(&r.internal)?;
        self.post(&[HookSignal::Delete], &r.rel, None);
        Ok(true)
    }

    /// Detach the mount attached at `path`.
    ///
    /// Returns false if `path` is not a mount point, the mount is not
    /// removable, or a hook cancelled.
    #[tracing::instrument(skip(self), name = "view.remove_mount")]
    pub async fn remove_mount(&self, path: &str) -> VfsResult<bool> {
        let r = self.resolve(path)?;
        self.detach_mount(&r)
    }

    fn detach_mount(&self, r: &Resolved) -> VfsResult<bool> {
        if !r.is_mount_point() || !r.mount.is_removable() {
            return Ok(false);
        }
        let mut guard = self.guard();
        self.lock(&mut guard, r, LockKind::Exclusive, MountLock::PointOnly)?;

        if !self.pre(&[HookSignal::Umount], &r.rel, None) {
            return Ok(false);
        }
        self.registry.unmount(r.mount.point());
        self.post(&[HookSignal::Umount], &r.rel, None);
        Ok(true)
    }

    /// Set the mtime of `path` (now if `None`), creating an empty file if missing.
    #[tracing::instrument(skip(self), name = "view.touch")]
    pub async fn touch(&self, path: &str, mtime: Option<SystemTime>) -> VfsResult<bool> {
        let r = self.resolve(path)?;
        let mtime = mtime.unwrap_or_else(SystemTime::now);
        let mut guard = self.guard();
        self.lock(&mut guard, &r, LockKind::Exclusive, MountLock::PointAndRoot)?;

        let exists = r.storage().exists(&r.internal).await;
        let signals: &[HookSignal] = if exists {
            &[HookSignal::Touch]
        } else {
            &[HookSignal::Touch, HookSignal::Create, HookSignal::Write]
        };
        if !self.pre(signals, &r.rel, None) {
            return Ok(false);
        }
        if !exists {
            if !self.ensure_parents(&r).await? {
                return Ok(false);
            }
            r.storage().create(&r.internal, 0o644).await?;
        }
        r.storage()
            .setattr(&r.internal, SetAttr::new().with_mtime(mtime))
            .await?;
        r.mount
            .updater()
            .update(&r.internal, Some(to_unix_secs(mtime)), !exists)
            .await?;
        self.post(signals, &r.rel, None);
        Ok(true)
    }

    #[tracing::instrument(skip(self), name = "view.truncate")]
    pub async fn truncate(&self, path: &str, size: u64) -> VfsResult<bool> {
        let r = self.resolve(path)?;
        let mut guard = self.guard();
        self.lock(&mut guard, &r, LockKind::Exclusive, MountLock::PointAndRoot)?;

        let signals = write_signals(true);
        if !self.pre(&signals, &r.rel, None) {
            return Ok(false);
        }
        r.storage().truncate(&r.internal, size).await?;
        r.mount.updater().update(&r.internal, None, true).await?;
        self.post(&signals, &r.rel, None);
        Ok(true)
    }

    /// Merge `update` into the cached entry of `path`.
    ///
    /// Returns false if the path is not cached.
    #[tracing::instrument(skip(self), name = "view.put_file_info")]
    pub async fn put_file_info(&self, path: &str, update: &CacheUpdate) -> VfsResult<bool> {
        let r = self.resolve(path)?;
        let Some(file_id) = self.cache_entry(&r).await?.and_then(|e| e.file_id) else {
            return Ok(false);
        };
        if update.is_empty() {
            return Ok(true);
        }
        let changes_content = update.size.is_some() || update.mtime.is_some();
        if changes_content && update.etag.is_none() {
            let versioned = update.clone().with_etag(new_etag());
            r.mount.cache().update(file_id, &versioned)?;
        } else {
            r.mount.cache().update(file_id, update)?;
        }
        if changes_content || update.etag.is_some() {
            r.mount
                .updater()
                .propagate_change(&r.internal, update.mtime.unwrap_or_else(now_secs))?;
        }
        Ok(true)
    }

    /// Structural checks that run before any lock is taken.
    fn check_transfer(&self, source: &Resolved, target: &Resolved) -> VfsResult<()> {
        if target.is_mount_point() && target.mount.point() != source.mount.point() {
            return Err(VfsError::forbidden(format!("{} is a mount point", target.rel)));
        }
        if source.is_mount_point() && target.mount.is_shared() {
            return Err(VfsError::forbidden(format!(
                "mount {} cannot be placed inside shared storage {}",
                source.rel,
                target.mount.path()
            )));
        }
        Ok(())
    }

    /// Move `source` to `target`.
    ///
    /// A movable mount point is relocated in the registry. Within one
    /// storage the backend renames and file ids are kept; across storages
    /// the content is transferred and the source deleted.
    #[tracing::instrument(skip(self), name = "view.rename")]
    pub async fn rename(&self, source: &str, target: &str) -> VfsResult<bool> {
        let src = self.resolve(source)?;
        let dst = self.resolve(target)?;
        if src.rel == "/" || dst.rel == "/" || path::is_within(&dst.abs, &src.abs) {
            return Ok(false);
        }
        self.check_transfer(&src, &dst)?;

        let mount_lock = if src.is_mount_point() {
            MountLock::PointOnly
        } else {
            MountLock::PointAndRoot
        };
        let mut source_lock = self.guard();
        self.lock(&mut source_lock, &src, LockKind::Shared, mount_lock)?;
        let mut target_lock = self.guard();
        self.lock(&mut target_lock, &dst, LockKind::Exclusive, mount_lock)?;

        if !src.is_mount_point() && !src.storage().exists(&src.internal).await {
            return Err(VfsError::not_found(src.rel));
        }

        // finishing an upload looks like a write to the target
        let upload = path::is_partial_file(&src.rel) && !path::is_partial_file(&dst.rel);
        let upload_signals = write_signals(dst.storage().exists(&dst.internal).await);
        let proceed = if upload {
            self.pre(&upload_signals, &dst.rel, None)
        } else {
            self.pre(&[HookSignal::Rename], &src.rel, Some(&dst.rel))
        };
        if !proceed {
            return Ok(false);
        }
        source_lock
            .change(LockKind::Exclusive)
            .map_err(|e| relabel(e, &src.rel))?;

        let moved = if src.is_mount_point() {
            self.registry.move_mount(&src.abs, &dst.abs)?
        } else if !self.ensure_parents(&dst).await? {
            false
        } else if src.mount.storage_id() == dst.mount.storage_id() {
            src.storage().rename(&src.internal, &dst.internal).await?;
            dst.mount
                .updater()
                .rename_within(&src.internal, &dst.internal)
                .await?;
            true
        } else {
            transfer::transfer(&src.mount, &src.internal, &dst.mount, &dst.internal, TransferKind::Move)
                .await?
        };

        if moved {
            if upload {
                self.post(&upload_signals, &dst.rel, None);
            } else {
                self.post(&[HookSignal::Rename], &src.rel, Some(&dst.rel));
            }
        }
        Ok(moved)
    }

    /// Copy `source` (file or tree) to `target`.
    #[tracing::instrument(skip(self), name = "view.copy")]
    pub async fn copy(&self, source: &str, target: &str) -> VfsResult<bool> {
        let src = self.resolve(source)?;
        let dst = self.resolve(target)?;
        if dst.rel == "/" || path::is_within(&dst.abs, &src.abs) {
            return Ok(false);
        }
        self.check_transfer(&src, &dst)?;

        let mut source_lock = self.guard();
        self.lock(&mut source_lock, &src, LockKind::Shared, MountLock::PointAndRoot)?;
        let mut target_lock = self.guard();
        self.lock(&mut target_lock, &dst, LockKind::Exclusive, MountLock::PointAndRoot)?;

        if !src.storage().exists(&src.internal).await {
            return Err(VfsError::not_found(src.rel));
        }
        let signals = write_signals(dst.storage().exists(&dst.internal).await);
        if !self.pre(&[HookSignal::Copy], &src.rel, Some(&dst.rel))
            || !self.pre(&signals, &dst.rel, None)
            || !self.ensure_parents(&dst).await?
        {
            return Ok(false);
        }

        let copied = if src.mount.storage_id() == dst.mount.storage_id() {
            src.storage().copy(&src.internal, &dst.internal).await?;
            dst.mount.updater().add_tree(&dst.internal).await?;
            true
        } else {
            transfer::transfer(&src.mount, &src.internal, &dst.mount, &dst.internal, TransferKind::Copy)
                .await?
        };

        if copied {
            self.post(&[HookSignal::Copy], &src.rel, Some(&dst.rel));
            self.post(&signals, &dst.rel, None);
        }
        Ok(copied)
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("root", &self.root)
            .field("limits", &self.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheDb;
    use crate::lock::MemoryLockingProvider;
    use crate::vfs::{MemoryBackend, MountOptions};

    fn view_at(root: &str) -> (View, Arc<MountRegistry>) {
        let registry = Arc::new(MountRegistry::new(Arc::new(CacheDb::in_memory().unwrap())));
        registry
            .mount(Arc::new(MemoryBackend::new()), "/", MountOptions::default())
            .unwrap();
        let view = View::new(
            root,
            registry.clone(),
            Arc::new(MemoryLockingProvider::new()),
            Arc::new(HookBus::new()),
            PathLimits::default(),
        )
        .unwrap();
        (view, registry)
    }

    #[test]
    fn test_path_space() {
        let (view, _) = view_at("/user/files/");
        assert_eq!(view.root(), "/user/files");
        assert_eq!(view.get_absolute_path("a//b/").unwrap(), "/user/files/a/b");
        assert_eq!(view.get_absolute_path("").unwrap(), "/user/files");
        assert_eq!(view.get_relative_path("/user/files/a").as_deref(), Some("/a"));
        assert_eq!(view.get_relative_path("/user/files").as_deref(), Some("/"));
        assert_eq!(view.get_relative_path("/user/filesystem"), None);
        assert_eq!(view.get_relative_path("/other"), None);
        assert!(view.get_absolute_path("../escape").is_err());
    }

    #[test]
    fn test_overlong_paths_rejected() {
        let (view, _) = view_at("/");
        let long = format!("/{}", "a/".repeat(2500));
        assert!(matches!(
            view.get_absolute_path(&long),
            Err(VfsError::InvalidPath(_))
        ));
        let name = "x".repeat(300);
        assert!(matches!(
            view.get_absolute_path(&name),
            Err(VfsError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (view, _) = view_at("/");
        assert!(view.file_put_contents("/a/b/c.txt", b"hello").await.unwrap());
        assert_eq!(view.file_get_contents("/a/b/c.txt").await.unwrap().unwrap(), b"hello");
        assert!(view.is_dir("/a/b").await.unwrap());
        assert!(view.is_file("/a/b/c.txt").await.unwrap());
        assert_eq!(view.filesize("/a").await.unwrap(), 5);

        let info = view.get_file_info("/a", false).await.unwrap().unwrap();
        assert_eq!(info.size(), 5);
        assert!(info.is_dir());
    }

    #[tokio::test]
    async fn test_parent_chain_blocked_by_file() {
        let (view, _) = view_at("/");
        view.file_put_contents("/file", b"x").await.unwrap();
        assert!(!view.file_put_contents("/file/child.txt", b"y").await.unwrap());
        assert!(!view.mkdir("/file/dir").await.unwrap());
        assert!(view.is_file("/file").await.unwrap());
    }

    #[tokio::test]
    async fn test_mime_filter() {
        let (view, _) = view_at("/");
        view.file_put_contents("/a.txt", b"1").await.unwrap();
        view.file_put_contents("/b.png", b"22").await.unwrap();
        view.mkdir("/dir").await.unwrap();

        let names = |infos: Vec<FileInfo>| infos.iter().map(|i| i.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names(view.get_directory_content("/", None).await.unwrap()), ["a.txt", "b.png", "dir"]);
        assert_eq!(names(view.get_directory_content("/", Some("image")).await.unwrap()), ["b.png"]);
        assert_eq!(
            names(view.get_directory_content("/", Some("text/plain")).await.unwrap()),
            ["a.txt"]
        );
        assert!(view.get_directory_content("/", Some("text")).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn test_chrooted_view() {
        let (view, registry) = view_at("/user");
        let global = View::new(
            "/",
            registry,
            Arc::new(MemoryLockingProvider::new()),
            Arc::new(HookBus::new()),
            PathLimits::default(),
        )
        .unwrap();

        view.file_put_contents("/notes.txt", b"abc").await.unwrap();
        assert!(global.file_exists("/user/notes.txt").await.unwrap());
        global.file_put_contents("/outside.txt", b"x").await.unwrap();

        let found: Vec<_> = view
            .search("t")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.path().to_string())
            .collect();
        assert_eq!(found, ["/notes.txt"]);

        let id = view.get_file_info("/notes.txt", false).await.unwrap().unwrap().file_id().unwrap();
        assert_eq!(view.get_path(id).await.unwrap().as_deref(), Some("/notes.txt"));
        assert_eq!(global.get_path(id).await.unwrap().as_deref(), Some("/user/notes.txt"));
    }

    #[tokio::test]
    async fn test_touch_creates_and_sets_mtime() {
        let (view, _) = view_at("/");
        let when = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_500_000_000);
        assert!(view.touch("/new.txt", Some(when)).await.unwrap());
        assert_eq!(view.filemtime("/new.txt").await.unwrap(), when);
        let info = view.get_file_info("/new.txt", false).await.unwrap().unwrap();
        assert_eq!(info.mtime(), 1_500_000_000);
        assert_eq!(info.size(), 0);
    }

    #[tokio::test]
    async fn test_put_file_info_merges() {
        let (view, _) = view_at("/");
        view.file_put_contents("/secret.txt", b"x").await.unwrap();
        assert!(view
            .put_file_info("/secret.txt", &CacheUpdate::new().with_encrypted(true))
            .await
            .unwrap());
        let info = view.get_file_info("/secret.txt", false).await.unwrap().unwrap();
        assert!(info.is_encrypted());
        assert_eq!(info.size(), 1);
        assert!(!view.put_file_info("/missing", &CacheUpdate::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_file_info_size_mints_etag() {
        let (view, _) = view_at("/");
        view.file_put_contents("/d/f.txt", b"abc").await.unwrap();
        let file = view.get_file_info("/d/f.txt", false).await.unwrap().unwrap();
        let dir = view.get_file_info("/d", false).await.unwrap().unwrap();

        assert!(view
            .put_file_info("/d/f.txt", &CacheUpdate::new().with_size(99))
            .await
            .unwrap());
        let resized = view.get_file_info("/d/f.txt", false).await.unwrap().unwrap();
        assert_eq!(resized.size(), 99);
        assert_ne!(resized.etag(), file.etag());
        assert_ne!(
            view.get_file_info("/d", false).await.unwrap().unwrap().etag(),
            dir.etag()
        );

        assert!(view
            .put_file_info("/d/f.txt", &CacheUpdate::new().with_mtime(7).with_etag("pinned"))
            .await
            .unwrap());
        let pinned = view.get_file_info("/d/f.txt", false).await.unwrap().unwrap();
        assert_eq!(pinned.etag(), "pinned");
    }

    #[tokio::test]
    async fn test_truncate_and_rmdir() {
        let (view, _) = view_at("/");
        view.file_put_contents("/d/f.txt", b"0123456789").await.unwrap();
        assert!(view.truncate("/d/f.txt", 4).await.unwrap());
        assert_eq!(view.filesize("/d/f.txt").await.unwrap(), 4);
        assert_eq!(view.get_file_info("/", false).await.unwrap().unwrap().size(), 4);

        assert!(matches!(view.rmdir("/d/f.txt").await, Err(VfsError::NotADirectory(_))));
        assert!(view.rmdir("/d").await.unwrap());
        assert!(!view.file_exists("/d/f.txt").await.unwrap());
        assert_eq!(view.get_file_info("/", false).await.unwrap().unwrap().size(), 0);
    }

    #[tokio::test]
    async fn test_missing_paths() {
        let (view, _) = view_at("/");
        assert!(!view.file_exists("/nope").await.unwrap());
        assert!(view.get_file_info("/nope", true).await.unwrap().is_none());
        assert!(view.get_directory_content("/nope", None).await.unwrap().is_empty());
        assert!(matches!(view.stat("/nope").await, Err(VfsError::NotFound(p)) if p == "/nope"));
        assert!(view.rename("/nope", "/other").await.unwrap_err().is_not_found());
        assert!(view.file_get_contents("/nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rename_within_storage_keeps_file_id() {
        let (view, _) = view_at("/");
        view.file_put_contents("/a.txt", b"abc").await.unwrap();
        let id = view.get_file_info("/a.txt", false).await.unwrap().unwrap().file_id();

        assert!(view.rename("/a.txt", "/sub/b.txt").await.unwrap());
        assert!(!view.file_exists("/a.txt").await.unwrap());
        let moved = view.get_file_info("/sub/b.txt", false).await.unwrap().unwrap();
        assert_eq!(moved.file_id(), id);

        // onto itself or into its own subtree
        assert!(!view.rename("/sub", "/sub").await.unwrap());
        assert!(!view.rename("/sub", "/sub/deeper").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_within_storage() {
        let (view, _) = view_at("/");
        view.file_put_contents("/src/one.txt", b"1").await.unwrap();
        view.file_put_contents("/src/two.txt", b"22").await.unwrap();

        assert!(view.copy("/src", "/dst").await.unwrap());
        assert_eq!(view.file_get_contents("/dst/two.txt").await.unwrap().unwrap(), b"22");
        assert_eq!(view.get_file_info("/dst", false).await.unwrap().unwrap().size(), 3);
        assert_eq!(view.get_file_info("/", false).await.unwrap().unwrap().size(), 6);
        assert!(view.file_exists("/src/one.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_mount_queries() {
        let (view, registry) = view_at("/");
        registry
            .mount(Arc::new(MemoryBackend::new()), "/mnt/data", MountOptions::default())
            .unwrap();

        assert_eq!(view.get_mount_point("/mnt/data/x/y").unwrap(), "/mnt/data");
        assert_eq!(view.get_mount_point("/mnt/other").unwrap(), "/");
        assert!(view.get_mount("/mnt/data").unwrap().storage_id().starts_with("memory::"));

        let below: Vec<_> = view
            .get_mounts_in("/mnt")
            .unwrap()
            .iter()
            .map(|m| m.path().to_string())
            .collect();
        assert_eq!(below, ["/mnt/data"]);
        assert!(view.get_mounts_in("/mnt/data").unwrap().is_empty());

        assert_eq!(view.free_space("/mnt/data/file").await.unwrap(), None);
        assert!(view.is_dir("/mnt").await.unwrap());
    }
}
