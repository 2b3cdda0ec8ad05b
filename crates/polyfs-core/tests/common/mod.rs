//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use polyfs_core::{
    DirEntry, FileAttr, Filesystem, HookControl, HookEvent, MemoryBackend, MountOptions, SetAttr,
    StatFs, Storage, VfsError, VfsResult, View,
};

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n-not-really-an-image-";

/// Populate a storage with `foo.txt`, `foo.png` and `folder/bar.txt`.
pub async fn fill_sample(storage: &dyn Storage) {
    storage.write_all("foo.txt", b"0123456789abcdef").await.unwrap();
    storage.write_all("foo.png", PNG_BYTES).await.unwrap();
    storage.mkdir("folder", 0o755).await.unwrap();
    storage
        .write_all("folder/bar.txt", b"fedcba9876543210")
        .await
        .unwrap();
}

/// Route `tracing` output to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Filesystem with an empty memory storage at `/`.
pub fn memory_fs() -> (Filesystem, Arc<MemoryBackend>) {
    init_tracing();
    let fs = Filesystem::in_memory().unwrap();
    let root = Arc::new(MemoryBackend::new());
    fs.mount(root.clone(), "/", MountOptions::default()).unwrap();
    (fs, root)
}

/// Sample content at `/` and again at `/substorage`, fully scanned.
pub async fn sample_fs() -> (Filesystem, Arc<MemoryBackend>, Arc<MemoryBackend>) {
    init_tracing();
    let fs = Filesystem::in_memory().unwrap();
    let root = Arc::new(MemoryBackend::new());
    let sub = Arc::new(MemoryBackend::new());
    fill_sample(root.as_ref()).await;
    fill_sample(sub.as_ref()).await;
    fs.mount(root.clone(), "/", MountOptions::default()).unwrap();
    fs.mount(sub.clone(), "/substorage", MountOptions::default())
        .unwrap();
    fs.scan("/").await.unwrap();
    (fs, root, sub)
}

/// Records every hook event it sees.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<HookEvent>>>,
}

impl Recorder {
    pub fn attach(fs: &Filesystem, pattern: &str) -> Self {
        let recorder = Self::default();
        let events = recorder.events.clone();
        fs.hooks().connect(pattern, move |event| {
            events.lock().push(event.clone());
            HookControl::Continue
        });
        recorder
    }

    /// `phase.signal path` for each event, in order.
    pub fn subjects(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| format!("{} {}", e.subject(), e.path))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Run `probe` against the view from inside every hook matching `pattern`.
pub fn probe_hook<T, F>(fs: &Filesystem, view: &View, pattern: &str, probe: F) -> Arc<Mutex<Vec<T>>>
where
    T: Send + 'static,
    F: Fn(&View, &HookEvent) -> T + Send + Sync + 'static,
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let view = view.clone();
    fs.hooks().connect(pattern, move |event| {
        sink.lock().push(probe(&view, event));
        HookControl::Continue
    });
    seen
}

/// Memory storage whose writes fail for files with a given name.
pub struct FailingStorage {
    inner: MemoryBackend,
    fail_name: String,
}

impl FailingStorage {
    pub fn new(fail_name: &str) -> Self {
        Self {
            inner: MemoryBackend::new(),
            fail_name: fail_name.to_string(),
        }
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }
}

#[async_trait]
impl Storage for FailingStorage {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        self.inner.stat(path).await
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        self.inner.readdir(path).await
    }

    async fn read(&self, path: &str, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        self.inner.read(path, offset, size).await
    }

    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> VfsResult<u32> {
        if path.rsplit('/').next() == Some(self.fail_name.as_str()) {
            return Err(VfsError::Io(std::io::Error::other("disk full")));
        }
        self.inner.write(path, offset, data).await
    }

    async fn create(&self, path: &str, mode: u32) -> VfsResult<FileAttr> {
        self.inner.create(path, mode).await
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<FileAttr> {
        self.inner.mkdir(path, mode).await
    }

    async fn unlink(&self, path: &str) -> VfsResult<()> {
        self.inner.unlink(path).await
    }

    async fn rmdir(&self, path: &str) -> VfsResult<()> {
        self.inner.rmdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.inner.rename(from, to).await
    }

    async fn truncate(&self, path: &str, size: u64) -> VfsResult<()> {
        self.inner.truncate(path, size).await
    }

    async fn setattr(&self, path: &str, attr: SetAttr) -> VfsResult<FileAttr> {
        self.inner.setattr(path, attr).await
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        self.inner.statfs().await
    }
}
