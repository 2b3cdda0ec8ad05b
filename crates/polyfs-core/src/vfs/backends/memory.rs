//! Storage kept entirely in process memory.
//!
//! Objects live in one ordered map keyed by normalized path, so a node's
//! descendants are a contiguous key range starting at `"{path}/"`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::SystemTime;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::path::internal_parent;
use crate::vfs::storage::Storage;
use crate::vfs::types::{DirEntry, FileAttr, FileType, SetAttr, StatFs};

#[derive(Debug, Clone)]
enum Node {
    File { bytes: Vec<u8>, attr: FileAttr },
    Dir { attr: FileAttr },
}

impl Node {
    fn dir(perm: u32) -> Self {
        Node::Dir {
            attr: FileAttr::directory(perm),
        }
    }

    fn attr(&self) -> &FileAttr {
        match self {
            Node::File { attr, .. } | Node::Dir { attr } => attr,
        }
    }

    fn attr_mut(&mut self) -> &mut FileAttr {
        match self {
            Node::File { attr, .. } | Node::Dir { attr } => attr,
        }
    }

    fn kind(&self) -> FileType {
        self.attr().kind
    }
}

type Tree = BTreeMap<String, Node>;

/// Keys strictly below `key`, in order. The root key is `""`.
fn below<'a>(tree: &'a Tree, key: &str) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
    let prefix = if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    };
    tree.range::<str, _>((Bound::Excluded(key), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(&prefix))
}

fn is_within(candidate: &str, ancestor: &str) -> bool {
    candidate
        .strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Storage backed by a map in memory.
///
/// Nothing is persisted. Parent directories are created on demand by
/// `create` and `mkdir`.
#[derive(Debug)]
pub struct MemoryBackend {
    id: String,
    tree: RwLock<Tree>,
    read_only: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Empty storage with a random `memory::` id.
    pub fn new() -> Self {
        Self::with_id(format!("memory::{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let mut tree = Tree::new();
        tree.insert(String::new(), Node::dir(0o755));
        Self {
            id: id.into(),
            tree: RwLock::new(tree),
            read_only: false,
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    fn key(path: &str) -> String {
        path.split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .collect::<Vec<_>>()
            .join("/")
    }

    fn writable(&self) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::ReadOnly);
        }
        Ok(())
    }

    fn make_parents(tree: &mut Tree, key: &str) -> VfsResult<()> {
        let mut end = 0;
        let parent = internal_parent(key);
        while end < parent.len() {
            end = parent[end..]
                .find('/')
                .map_or(parent.len(), |idx| end + idx);
            let ancestor = &parent[..end];
            match tree.get(ancestor) {
                Some(Node::Dir { .. }) => {}
                Some(Node::File { .. }) => return Err(VfsError::not_a_directory(ancestor)),
                None => {
                    tree.insert(ancestor.to_string(), Node::dir(0o755));
                }
            }
            end += 1;
        }
        Ok(())
    }

    fn bump_parent(tree: &mut Tree, key: &str) {
        if let Some(parent) = tree.get_mut(internal_parent(key)) {
            parent.attr_mut().mtime = SystemTime::now();
        }
    }

    fn file_mut<'a>(tree: &'a mut Tree, key: &str) -> VfsResult<(&'a mut Vec<u8>, &'a mut FileAttr)> {
        match tree.get_mut(key) {
            Some(Node::File { bytes, attr }) => Ok((bytes, attr)),
            Some(Node::Dir { .. }) => Err(VfsError::is_a_directory(key)),
            None => Err(VfsError::not_found(key)),
        }
    }

    fn insert_new(&self, path: &str, node: Node) -> VfsResult<FileAttr> {
        self.writable()?;
        let key = Self::key(path);
        let mut tree = self.tree.write();
        if tree.contains_key(&key) {
            return Err(VfsError::already_exists(key));
        }
        Self::make_parents(&mut tree, &key)?;
        Self::bump_parent(&mut tree, &key);
        let attr = node.attr().clone();
        tree.insert(key, node);
        Ok(attr)
    }

    fn remove_node(&self, path: &str, want: FileType) -> VfsResult<()> {
        self.writable()?;
        let key = Self::key(path);
        if key.is_empty() {
            return Err(VfsError::permission_denied("storage root cannot be removed"));
        }
        let mut tree = self.tree.write();
        let kind = tree
            .get(&key)
            .map(Node::kind)
            .ok_or_else(|| VfsError::not_found(key.clone()))?;
        match (want, kind) {
            (FileType::File, FileType::Directory) => return Err(VfsError::is_a_directory(key)),
            (FileType::Directory, FileType::File) => return Err(VfsError::not_a_directory(key)),
            (FileType::Directory, _) if below(&tree, &key).next().is_some() => {
                return Err(VfsError::directory_not_empty(key));
            }
            _ => {}
        }
        tree.remove(&key);
        Self::bump_parent(&mut tree, &key);
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let key = Self::key(path);
        let tree = self.tree.read();
        match tree.get(&key) {
            Some(node) => Ok(node.attr().clone()),
            None => Err(VfsError::not_found(key)),
        }
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let key = Self::key(path);
        let tree = self.tree.read();
        match tree.get(&key) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => return Err(VfsError::not_a_directory(key)),
            None => return Err(VfsError::not_found(key)),
        }
        let skip = if key.is_empty() { 0 } else { key.len() + 1 };
        Ok(below(&tree, &key)
            .filter_map(|(child, node)| {
                let name = &child[skip..];
                (!name.contains('/')).then(|| DirEntry::new(name, node.kind()))
            })
            .collect())
    }

    async fn read(&self, path: &str, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        let key = Self::key(path);
        let tree = self.tree.read();
        match tree.get(&key) {
            Some(Node::File { bytes, .. }) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
                let end = start.saturating_add(size as usize).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            Some(Node::Dir { .. }) => Err(VfsError::is_a_directory(key)),
            None => Err(VfsError::not_found(key)),
        }
    }

    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> VfsResult<u32> {
        self.writable()?;
        let key = Self::key(path);
        let mut tree = self.tree.write();
        let (bytes, attr) = Self::file_mut(&mut tree, &key)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        attr.size = bytes.len() as u64;
        attr.mtime = SystemTime::now();
        Ok(data.len() as u32)
    }

    async fn create(&self, path: &str, mode: u32) -> VfsResult<FileAttr> {
        self.insert_new(
            path,
            Node::File {
                bytes: Vec::new(),
                attr: FileAttr::file(0, mode),
            },
        )
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<FileAttr> {
        self.insert_new(path, Node::dir(mode))
    }

    async fn unlink(&self, path: &str) -> VfsResult<()> {
        self.remove_node(path, FileType::File)
    }

    async fn rmdir(&self, path: &str) -> VfsResult<()> {
        self.remove_node(path, FileType::Directory)
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.writable()?;
        let (src, dst) = (Self::key(from), Self::key(to));
        if src.is_empty() || dst.is_empty() {
            return Err(VfsError::permission_denied("storage root cannot be renamed"));
        }
        if src == dst {
            return Ok(());
        }
        if is_within(&dst, &src) || is_within(&src, &dst) {
            return Err(VfsError::invalid_path(format!(
                "{src} and {dst} are nested in each other"
            )));
        }

        let mut tree = self.tree.write();
        let Some(root) = tree.remove(&src) else {
            return Err(VfsError::not_found(src));
        };
        if let Err(e) = Self::make_parents(&mut tree, &dst) {
            tree.insert(src, root);
            return Err(e);
        }

        let children: Vec<String> = below(&tree, &src).map(|(k, _)| k.clone()).collect();
        let replaced: Vec<String> = below(&tree, &dst).map(|(k, _)| k.clone()).collect();
        for stale in replaced {
            tree.remove(&stale);
        }
        tree.insert(dst.clone(), root);
        for child in children {
            if let Some(node) = tree.remove(&child) {
                tree.insert(format!("{dst}{}", &child[src.len()..]), node);
            }
        }

        Self::bump_parent(&mut tree, &src);
        Self::bump_parent(&mut tree, &dst);
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> VfsResult<()> {
        self.writable()?;
        let key = Self::key(path);
        let mut tree = self.tree.write();
        let (bytes, attr) = Self::file_mut(&mut tree, &key)?;
        bytes.resize(size as usize, 0);
        attr.size = size;
        attr.mtime = SystemTime::now();
        Ok(())
    }

    async fn setattr(&self, path: &str, set: SetAttr) -> VfsResult<FileAttr> {
        self.writable()?;
        let key = Self::key(path);
        let mut tree = self.tree.write();
        let Some(node) = tree.get_mut(&key) else {
            return Err(VfsError::not_found(key));
        };
        if let (Some(size), Node::File { bytes, attr }) = (set.size, &mut *node) {
            bytes.resize(size as usize, 0);
            attr.size = size;
        }
        let attr = node.attr_mut();
        if let Some(mtime) = set.mtime {
            attr.mtime = mtime;
        }
        if let Some(perm) = set.perm {
            attr.perm = perm;
        }
        Ok(attr.clone())
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        let used = self
            .tree
            .read()
            .values()
            .map(|node| match node {
                Node::File { bytes, .. } => bytes.len() as u64,
                Node::Dir { .. } => 0,
            })
            .sum();
        Ok(StatFs::unlimited(used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_ranges() {
        let mem = MemoryBackend::new();
        mem.create("notes.txt", 0o644).await.unwrap();
        mem.write("notes.txt", 0, b"hello world").await.unwrap();

        assert_eq!(mem.read("notes.txt", 0, 100).await.unwrap(), b"hello world");
        assert_eq!(mem.read("notes.txt", 6, 5).await.unwrap(), b"world");
        assert!(mem.read("notes.txt", 50, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_past_end_zero_fills() {
        let mem = MemoryBackend::new();
        mem.create("gap.bin", 0o644).await.unwrap();
        mem.write("gap.bin", 3, b"x").await.unwrap();
        assert_eq!(mem.read_all("gap.bin").await.unwrap(), [0, 0, 0, b'x']);
        assert_eq!(mem.stat("gap.bin").await.unwrap().size, 4);
    }

    #[tokio::test]
    async fn test_readdir_lists_direct_children_sorted() {
        let mem = MemoryBackend::new();
        mem.mkdir("b", 0o755).await.unwrap();
        mem.create("b/inner.txt", 0o644).await.unwrap();
        mem.create("b.txt", 0o644).await.unwrap();
        mem.create("a.txt", 0o644).await.unwrap();

        let names: Vec<_> = mem
            .readdir("")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["a.txt", "b", "b.txt"]);

        let inner = mem.readdir("b").await.unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].name, "inner.txt");
        assert!(inner[0].kind.is_file());
    }

    #[tokio::test]
    async fn test_unlink_and_rmdir_kinds() {
        let mem = MemoryBackend::new();
        mem.write_all("dir/file.txt", b"x").await.unwrap();

        assert!(matches!(mem.unlink("dir").await, Err(VfsError::IsADirectory(_))));
        assert!(matches!(
            mem.rmdir("dir").await,
            Err(VfsError::DirectoryNotEmpty(_))
        ));
        assert!(matches!(
            mem.rmdir("dir/file.txt").await,
            Err(VfsError::NotADirectory(_))
        ));

        mem.unlink("dir/file.txt").await.unwrap();
        mem.rmdir("dir").await.unwrap();
        assert!(!mem.exists("dir").await);
        assert!(mem.unlink("").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_carries_subtree() {
        let mem = MemoryBackend::new();
        mem.write_all("old/a.txt", b"content").await.unwrap();
        mem.write_all("old/deep/b.txt", b"b").await.unwrap();
        mem.write_all("old.txt", b"sibling").await.unwrap();

        mem.rename("old", "new").await.unwrap();

        assert!(!mem.exists("old").await);
        assert!(!mem.exists("old/a.txt").await);
        assert_eq!(mem.read_all("new/a.txt").await.unwrap(), b"content");
        assert_eq!(mem.read_all("new/deep/b.txt").await.unwrap(), b"b");
        assert_eq!(mem.read_all("old.txt").await.unwrap(), b"sibling");
    }

    #[tokio::test]
    async fn test_rename_replaces_destination() {
        let mem = MemoryBackend::new();
        mem.write_all("a.txt", b"new").await.unwrap();
        mem.write_all("b/stale.txt", b"stale").await.unwrap();

        mem.rename("a.txt", "b").await.unwrap();
        assert!(mem.stat("b").await.unwrap().is_file());
        assert!(!mem.exists("b/stale.txt").await);
    }

    #[tokio::test]
    async fn test_rename_nested_is_invalid() {
        let mem = MemoryBackend::new();
        mem.mkdir("dir", 0o755).await.unwrap();
        assert!(matches!(
            mem.rename("dir", "dir/sub").await,
            Err(VfsError::InvalidPath(_))
        ));
        assert!(mem.exists("dir").await);
    }

    #[tokio::test]
    async fn test_parent_file_blocks_create() {
        let mem = MemoryBackend::new();
        mem.write_all("file", b"x").await.unwrap();
        assert!(matches!(
            mem.create("file/child.txt", 0o644).await,
            Err(VfsError::NotADirectory(_))
        ));
        mem.rename("file", "file2/nested").await.unwrap();
        assert!(matches!(
            mem.mkdir("file2/nested/x", 0o755).await,
            Err(VfsError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let mut mem = MemoryBackend::new();
        mem.set_read_only(true);
        assert!(matches!(mem.create("x.txt", 0o644).await, Err(VfsError::ReadOnly)));
        assert!(matches!(mem.mkdir("d", 0o755).await, Err(VfsError::ReadOnly)));
        assert!(mem.read_only());
    }

    #[tokio::test]
    async fn test_setattr_resizes_and_touches() {
        let mem = MemoryBackend::new();
        mem.write_all("a.txt", b"abcdef").await.unwrap();
        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1000);

        let attr = mem
            .setattr("a.txt", SetAttr::new().with_mtime(when).with_size(2))
            .await
            .unwrap();
        assert_eq!(attr.size, 2);
        assert_eq!(attr.mtime_secs(), 1000);
        assert_eq!(mem.read_all("a.txt").await.unwrap(), b"ab");
    }

    #[tokio::test]
    async fn test_paths_are_normalized() {
        let mem = MemoryBackend::new();
        mem.create("/a/b/c.txt", 0o644).await.unwrap();

        assert!(mem.stat("a/b/c.txt").await.is_ok());
        assert!(mem.stat("a/./b//c.txt").await.is_ok());
        assert!(mem.stat("a/b/").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_statfs_counts_file_bytes() {
        let mem = MemoryBackend::new();
        mem.write_all("one", b"12345").await.unwrap();
        mem.write_all("dir/two", b"678").await.unwrap();

        let stat = mem.statfs().await.unwrap();
        assert_eq!(stat.used_bytes, 8);
        assert_eq!(stat.available_bytes, None);
    }
}
