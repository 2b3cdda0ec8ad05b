//! Storage over a directory of the host filesystem.

use async_trait::async_trait;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::storage::{CrossStorageTransfer, Storage};
use crate::vfs::types::{DirEntry, FileAttr, FileType, SetAttr, StatFs};

/// Storage rooted at a host directory.
///
/// Internal paths are joined onto `root`; `..` components and symlinks
/// that lead outside it are rejected with [`VfsError::PathEscapesRoot`].
#[derive(Debug, Clone)]
pub struct LocalBackend {
    id: String,
    root: PathBuf,
    read_only: bool,
}

impl From<&std::fs::Metadata> for FileAttr {
    fn from(meta: &std::fs::Metadata) -> Self {
        let dir = meta.is_dir();
        FileAttr {
            size: if dir { 0 } else { meta.len() },
            kind: if dir { FileType::Directory } else { FileType::File },
            perm: meta.permissions().mode(),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }
}

/// Turns `NotFound` into the VFS variant, keeping the storage path.
fn not_found_as_vfs(path: &str) -> impl FnOnce(io::Error) -> VfsError + '_ {
    move |err| match err.kind() {
        io::ErrorKind::NotFound => VfsError::not_found(path),
        _ => VfsError::Io(err),
    }
}

async fn copy_local(from: &Path, to: &Path) -> io::Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        if fs::metadata(&src).await?.is_dir() {
            fs::create_dir(&dst).await?;
            let mut dir = fs::read_dir(&src).await?;
            while let Some(entry) = dir.next_entry().await? {
                pending.push((entry.path(), dst.join(entry.file_name())));
            }
        } else {
            fs::copy(&src, &dst).await?;
        }
    }
    Ok(())
}

impl LocalBackend {
    /// The root is canonicalized once, so `/tmp` and `/private/tmp` agree.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let given: PathBuf = root.into();
        let root = dunce::canonicalize(&given).unwrap_or(given);
        Self {
            id: format!("local::{}", root.display()),
            root,
            read_only: false,
        }
    }

    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::new(root)
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for an internal path.
    ///
    /// The longest existing prefix is canonicalized and must stay under the
    /// root; the missing tail is appended as given.
    fn resolve(&self, path: &str) -> VfsResult<PathBuf> {
        let rel = path.trim_matches('/');
        if rel.is_empty() {
            return Ok(self.root.clone());
        }
        let rel = Path::new(rel);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(VfsError::path_escapes_root(path));
        }

        let full = self.root.join(rel);
        let mut probe = full.as_path();
        let mut missing = Vec::new();
        let canonical = loop {
            match dunce::canonicalize(probe) {
                Ok(base) => break missing.iter().rev().fold(base, |acc, part| acc.join(part)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let (Some(name), Some(parent)) = (probe.file_name(), probe.parent()) else {
                        return Err(VfsError::invalid_path(path));
                    };
                    missing.push(name);
                    probe = parent;
                }
                Err(e) => return Err(e.into()),
            }
        };

        if canonical.starts_with(&self.root) {
            Ok(canonical)
        } else {
            Err(VfsError::path_escapes_root(format!(
                "{path} resolves to {}",
                canonical.display()
            )))
        }
    }

    fn writable(&self) -> VfsResult<()> {
        match self.read_only {
            true => Err(VfsError::ReadOnly),
            false => Ok(()),
        }
    }

    fn existing_writable(&self, path: &str) -> VfsResult<PathBuf> {
        self.writable()?;
        if path.trim_matches('/').is_empty() {
            return Err(VfsError::permission_denied("storage root cannot be removed"));
        }
        self.resolve(path)
    }
}

#[async_trait]
impl Storage for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let meta = fs::metadata(self.resolve(path)?)
            .await
            .map_err(not_found_as_vfs(path))?;
        Ok(FileAttr::from(&meta))
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let mut dir = fs::read_dir(self.resolve(path)?)
            .await
            .map_err(not_found_as_vfs(path))?;
        let mut listing = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let kind = match entry.file_type().await?.is_dir() {
                true => FileType::Directory,
                false => FileType::File,
            };
            listing.push(DirEntry::new(entry.file_name().to_string_lossy(), kind));
        }
        listing.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    async fn read(&self, path: &str, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        let mut file = fs::File::open(self.resolve(path)?)
            .await
            .map_err(not_found_as_vfs(path))?;
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut chunk = Vec::with_capacity(size as usize);
        file.take(u64::from(size)).read_to_end(&mut chunk).await?;
        Ok(chunk)
    }

    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> VfsResult<u32> {
        self.writable()?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(self.resolve(path)?)
            .await
            .map_err(not_found_as_vfs(path))?;
        file.seek(io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len() as u32)
    }

    async fn create(&self, path: &str, mode: u32) -> VfsResult<FileAttr> {
        self.writable()?;
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&target)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => VfsError::already_exists(path),
                _ => VfsError::Io(e),
            })?;
        Ok(FileAttr::from(&file.metadata().await?))
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<FileAttr> {
        self.writable()?;
        let target = self.resolve(path)?;
        if fs::try_exists(&target).await? {
            return Err(VfsError::already_exists(path));
        }
        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(&target)
            .await?;
        Ok(FileAttr::from(&fs::metadata(&target).await?))
    }

    async fn unlink(&self, path: &str) -> VfsResult<()> {
        let target = self.existing_writable(path)?;
        fs::remove_file(target)
            .await
            .map_err(not_found_as_vfs(path))
    }

    async fn rmdir(&self, path: &str) -> VfsResult<()> {
        let target = self.existing_writable(path)?;
        fs::remove_dir(target)
            .await
            .map_err(not_found_as_vfs(path))
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.writable()?;
        let (src, dst) = (self.resolve(from)?, self.resolve(to)?);
        if src == dst {
            return Ok(());
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        // rename(2) only replaces empty directories
        if dst.is_dir() {
            fs::remove_dir_all(&dst).await?;
        }
        fs::rename(&src, &dst)
            .await
            .map_err(not_found_as_vfs(from))
    }

    async fn truncate(&self, path: &str, size: u64) -> VfsResult<()> {
        self.writable()?;
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.resolve(path)?)
            .await
            .map_err(not_found_as_vfs(path))?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn setattr(&self, path: &str, set: SetAttr) -> VfsResult<FileAttr> {
        self.writable()?;
        let target = self.resolve(path)?;
        if let Some(size) = set.size {
            self.truncate(path, size).await?;
        }
        if let Some(perm) = set.perm {
            fs::set_permissions(&target, std::fs::Permissions::from_mode(perm)).await?;
        }
        if let Some(mtime) = set.mtime {
            let file = fs::File::open(&target)
                .await
                .map_err(not_found_as_vfs(path))?
                .into_std()
                .await;
            tokio::task::spawn_blocking(move || file.set_modified(mtime))
                .await
                .map_err(|e| VfsError::other(e.to_string()))??;
        }
        self.stat(path).await
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        #[cfg(unix)]
        {
            let vfs = rustix::fs::statvfs(&self.root).map_err(io::Error::from)?;
            let frag = vfs.f_frsize;
            Ok(StatFs {
                total_bytes: Some(vfs.f_blocks * frag),
                used_bytes: vfs.f_blocks.saturating_sub(vfs.f_bfree) * frag,
                available_bytes: Some(vfs.f_bavail * frag),
            })
        }
        #[cfg(not(unix))]
        {
            Ok(StatFs::default())
        }
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        self.resolve(path).ok()
    }

    fn as_transfer(&self) -> Option<&dyn CrossStorageTransfer> {
        (!self.read_only).then_some(self as &dyn CrossStorageTransfer)
    }
}

#[async_trait]
impl CrossStorageTransfer for LocalBackend {
    /// Any storage that can name a host path for its files.
    fn accepts(&self, source: &dyn Storage) -> bool {
        source.local_path("").is_some()
    }

    async fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> VfsResult<()> {
        let Some(from) = source.local_path(source_path) else {
            return Err(VfsError::other(format!("{} has no host path", source.id())));
        };
        copy_local(&from, &self.resolve(target_path)?)
            .await
            .map_err(not_found_as_vfs(source_path))
    }

    async fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> VfsResult<()> {
        if source.read_only() {
            return Err(VfsError::ReadOnly);
        }
        let Some(from) = source.local_path(source_path) else {
            return Err(VfsError::other(format!("{} has no host path", source.id())));
        };
        let to = self.resolve(target_path)?;
        // cross-device renames fail with EXDEV
        if fs::rename(&from, &to).await.is_ok() {
            return Ok(());
        }
        copy_local(&from, &to)
            .await
            .map_err(not_found_as_vfs(source_path))?;
        source.remove_tree(source_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        (LocalBackend::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn test_write_and_read_ranges() {
        let (disk, _dir) = scratch();
        disk.create("notes.txt", 0o644).await.unwrap();
        disk.write("notes.txt", 0, b"hello world").await.unwrap();

        assert_eq!(disk.read("notes.txt", 0, 100).await.unwrap(), b"hello world");
        assert_eq!(disk.read("notes.txt", 6, 5).await.unwrap(), b"world");
        assert!(matches!(
            disk.create("notes.txt", 0o644).await,
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_create_makes_parents_and_lists_sorted() {
        let (disk, dir) = scratch();
        disk.create("b/inner.txt", 0o644).await.unwrap();
        disk.create("a.txt", 0o644).await.unwrap();
        assert!(dir.path().join("b/inner.txt").is_file());

        let names: Vec<_> = disk
            .readdir("")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["a.txt", "b"]);
        assert!(disk.stat("b").await.unwrap().is_dir());
        assert!(matches!(
            disk.mkdir("b", 0o755).await,
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_read_only_disables_writes_and_transfer() {
        let (mut disk, _dir) = scratch();
        disk.set_read_only(true);

        assert!(matches!(
            disk.create("x.txt", 0o644).await,
            Err(VfsError::ReadOnly)
        ));
        assert!(disk.as_transfer().is_none());
    }

    #[tokio::test]
    async fn test_escape_attempts_rejected() {
        let (disk, dir) = scratch();
        assert!(matches!(
            disk.read("../../../etc/passwd", 0, 100).await,
            Err(VfsError::PathEscapesRoot(_))
        ));

        std::os::unix::fs::symlink("/", dir.path().join("out")).unwrap();
        assert!(matches!(
            disk.stat("out/etc").await,
            Err(VfsError::PathEscapesRoot(_))
        ));
        assert!(matches!(
            disk.create("out/new/deep.txt", 0o644).await,
            Err(VfsError::PathEscapesRoot(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_paths_are_not_found() {
        let (disk, _dir) = scratch();
        assert!(matches!(disk.stat("nope.txt").await, Err(VfsError::NotFound(_))));
        assert!(matches!(disk.unlink("nope.txt").await, Err(VfsError::NotFound(_))));
        assert!(disk.unlink("").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_replaces_directory() {
        let (disk, _dir) = scratch();
        disk.write_all("old.txt", b"content").await.unwrap();
        disk.write_all("dest/stale.txt", b"stale").await.unwrap();

        disk.rename("old.txt", "dest").await.unwrap();
        assert!(!disk.exists("old.txt").await);
        assert_eq!(disk.read_all("dest").await.unwrap(), b"content");
    }

    #[tokio::test]
    async fn test_setattr_size_and_mtime() {
        let (disk, _dir) = scratch();
        disk.write_all("a.txt", b"hello world").await.unwrap();

        let when = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        let attr = disk
            .setattr("a.txt", SetAttr::new().with_size(5).with_mtime(when))
            .await
            .unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(attr.mtime_secs(), 1_000_000);
        assert_eq!(disk.read_all("a.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_transfer_between_local_backends() {
        let (source, _a) = scratch();
        let (target, _b) = scratch();
        source.write_all("tree/sub/leaf.txt", b"leaf").await.unwrap();

        let transfer = target.as_transfer().unwrap();
        assert!(transfer.accepts(&source));

        transfer.copy_from_storage(&source, "tree", "copied").await.unwrap();
        assert_eq!(target.read_all("copied/sub/leaf.txt").await.unwrap(), b"leaf");
        assert!(source.exists("tree/sub/leaf.txt").await);

        transfer.move_from_storage(&source, "tree", "moved").await.unwrap();
        assert_eq!(target.read_all("moved/sub/leaf.txt").await.unwrap(), b"leaf");
        assert!(!source.exists("tree").await);
    }

    #[tokio::test]
    async fn test_memory_source_not_accepted() {
        let (target, _dir) = scratch();
        let memory = crate::vfs::backends::MemoryBackend::new();
        assert!(!target.as_transfer().unwrap().accepts(&memory));
    }

    #[tokio::test]
    async fn test_statfs_reports_bytes() {
        let (disk, _dir) = scratch();
        let stat = disk.statfs().await.unwrap();
        assert!(stat.available_bytes.is_some());
        assert!(stat.total_bytes >= stat.available_bytes);
    }
}
