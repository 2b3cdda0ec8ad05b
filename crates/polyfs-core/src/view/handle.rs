//! Streaming file handles.

use super::{Resolved, View};
use crate::hooks::HookSignal;
use crate::lock::LockGuard;
use crate::vfs::storage::COPY_CHUNK_SIZE;
use crate::vfs::{OpenMode, VfsError, VfsResult};

/// An open file obtained from [`View::fopen`].
///
/// Holds its lock until [`close`](Self::close). Closing a write handle
/// updates the cache and fires the post hooks; dropping it without closing
/// only releases the lock.
pub struct FileHandle {
    view: View,
    target: Resolved,
    mode: OpenMode,
    offset: u64,
    signals: Vec<HookSignal>,
    _lock: LockGuard,
}

impl FileHandle {
    pub(super) fn new(
        view: View,
        target: Resolved,
        mode: OpenMode,
        offset: u64,
        signals: Vec<HookSignal>,
        lock: LockGuard,
    ) -> Self {
        Self {
            view,
            target,
            mode,
            offset,
            signals,
            _lock: lock,
        }
    }

    /// View path of the open file.
    pub fn path(&self) -> &str {
        &self.target.rel
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Current offset.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Read up to `size` bytes from the current offset. Empty at end of file.
    pub async fn read(&mut self, size: u32) -> VfsResult<Vec<u8>> {
        if self.mode.is_write() {
            return Err(VfsError::permission_denied(self.target.rel.clone()));
        }
        let data = self
            .target
            .storage()
            .read(&self.target.internal, self.offset, size)
            .await?;
        self.offset += data.len() as u64;
        Ok(data)
    }

    /// Read everything from the current offset on.
    pub async fn read_to_end(&mut self) -> VfsResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(COPY_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Write `data` at the current offset.
    pub async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        if !self.mode.is_write() {
            return Err(VfsError::permission_denied(self.target.rel.clone()));
        }
        let mut written = 0usize;
        while written < data.len() {
            let n = self
                .target
                .storage()
                .write(&self.target.internal, self.offset, &data[written..])
                .await?;
            if n == 0 {
                return Err(VfsError::generic_file(format!(
                    "short write to {}",
                    self.target.rel
                )));
            }
            written += n as usize;
            self.offset += n as u64;
        }
        Ok(written)
    }

    /// Finish the stream and release the lock.
    pub async fn close(self) -> VfsResult<()> {
        if self.mode.is_write() {
            self.target
                .mount
                .updater()
                .update(&self.target.internal, None, true)
                .await?;
        }
        self.view.post(&self.signals, &self.target.rel, None);
        Ok(())
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.target.rel)
            .field("mode", &self.mode)
            .field("offset", &self.offset)
            .finish()
    }
}
