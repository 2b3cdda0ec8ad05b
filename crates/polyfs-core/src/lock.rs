//! Advisory shared/exclusive locks.
//!
//! Locks are fail-fast: a conflicting request returns
//! [`VfsError::Locked`] immediately instead of waiting. Keys are built by
//! [`Storage::acquire_lock`](crate::vfs::Storage::acquire_lock) as
//! `"<storage id>::<internal path>"`, so the same object reached through
//! two mounts of one storage shares a lock.
//!
//! # Compatibility
//!
//! | held \ requested | Shared | Exclusive |
//! |------------------|--------|-----------|
//! | none             | ok     | ok        |
//! | Shared(n)        | ok     | conflict  |
//! | Exclusive        | conflict | conflict |

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::vfs::{Storage, VfsError, VfsResult};

/// Lock kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// Readers. Reference counted.
    Shared,
    /// A single writer.
    Exclusive,
}

/// Which locks a view takes when the path is a mount attachment point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountLock {
    /// The point in the parent storage and the mounted storage root.
    #[default]
    PointAndRoot,
    /// Only the point in the parent storage.
    PointOnly,
}

/// Lock table shared by every view of a filesystem.
pub trait LockingProvider: Send + Sync {
    /// Take a lock, failing immediately on conflict.
    fn acquire(&self, key: &str, kind: LockKind) -> VfsResult<()>;

    /// Drop a lock previously granted. Releasing an unheld lock is a no-op.
    fn release(&self, key: &str, kind: LockKind);

    /// Convert a held lock to `kind` without an unlocked window.
    fn change_lock(&self, key: &str, kind: LockKind) -> VfsResult<()>;

    /// Whether `key` is currently held with `kind`.
    fn is_locked(&self, key: &str, kind: LockKind) -> bool;

    /// Drop every lock this provider granted.
    fn release_all(&self);

    /// Current lock on `key`, if any.
    fn state(&self, key: &str) -> Option<LockKind> {
        if self.is_locked(key, LockKind::Exclusive) {
            Some(LockKind::Exclusive)
        } else if self.is_locked(key, LockKind::Shared) {
            Some(LockKind::Shared)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Shared(usize),
    Exclusive,
}

impl LockState {
    fn kind(self) -> LockKind {
        match self {
            LockState::Shared(_) => LockKind::Shared,
            LockState::Exclusive => LockKind::Exclusive,
        }
    }
}

/// In-process lock table.
#[derive(Debug, Default)]
pub struct MemoryLockingProvider {
    locks: DashMap<String, LockState>,
}

impl MemoryLockingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently locked.
    pub fn held(&self) -> usize {
        self.locks.len()
    }
}

impl LockingProvider for MemoryLockingProvider {
    fn acquire(&self, key: &str, kind: LockKind) -> VfsResult<()> {
        match self.locks.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(match kind {
                    LockKind::Shared => LockState::Shared(1),
                    LockKind::Exclusive => LockState::Exclusive,
                });
                Ok(())
            }
            Entry::Occupied(mut slot) => match (slot.get_mut(), kind) {
                (LockState::Shared(count), LockKind::Shared) => {
                    *count += 1;
                    Ok(())
                }
                (held, _) => Err(VfsError::locked(key, held.kind())),
            },
        }
    }

    fn release(&self, key: &str, kind: LockKind) {
        if let Entry::Occupied(mut slot) = self.locks.entry(key.to_string()) {
            let remove = match (slot.get_mut(), kind) {
                (LockState::Shared(count), LockKind::Shared) if *count > 1 => {
                    *count -= 1;
                    false
                }
                (LockState::Shared(_), LockKind::Shared) => true,
                (LockState::Exclusive, LockKind::Exclusive) => true,
                _ => false,
            };
            if remove {
                slot.remove();
            }
        }
    }

    fn change_lock(&self, key: &str, kind: LockKind) -> VfsResult<()> {
        let Some(mut state) = self.locks.get_mut(key) else {
            return Err(VfsError::locked(key, kind));
        };
        match (*state, kind) {
            (LockState::Shared(1), LockKind::Exclusive) => {
                *state = LockState::Exclusive;
                Ok(())
            }
            (LockState::Exclusive, LockKind::Shared) => {
                *state = LockState::Shared(1);
                Ok(())
            }
            (LockState::Exclusive, LockKind::Exclusive) => Ok(()),
            (held, _) => Err(VfsError::locked(key, held.kind())),
        }
    }

    fn is_locked(&self, key: &str, kind: LockKind) -> bool {
        match self.locks.get(key).map(|s| *s) {
            Some(LockState::Shared(_)) => kind == LockKind::Shared,
            Some(LockState::Exclusive) => kind == LockKind::Exclusive,
            None => false,
        }
    }

    fn release_all(&self) {
        self.locks.clear();
    }
}

/// Provider used when locking is disabled: grants everything, holds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockingProvider;

impl LockingProvider for NoopLockingProvider {
    fn acquire(&self, _key: &str, _kind: LockKind) -> VfsResult<()> {
        Ok(())
    }

    fn release(&self, _key: &str, _kind: LockKind) {}

    fn change_lock(&self, _key: &str, _kind: LockKind) -> VfsResult<()> {
        Ok(())
    }

    fn is_locked(&self, _key: &str, _kind: LockKind) -> bool {
        false
    }

    fn release_all(&self) {}
}

struct Held {
    storage: Arc<dyn Storage>,
    path: String,
    kind: LockKind,
}

/// Locks held for the duration of one operation.
///
/// Locks are taken in call order and released in reverse order when the
/// guard drops, on every exit path.
pub struct LockGuard {
    provider: Arc<dyn LockingProvider>,
    held: Vec<Held>,
}

impl LockGuard {
    pub fn new(provider: Arc<dyn LockingProvider>) -> Self {
        Self {
            provider,
            held: Vec::new(),
        }
    }

    /// Lock `path` inside `storage`.
    pub fn acquire(&mut self, storage: &Arc<dyn Storage>, path: &str, kind: LockKind) -> VfsResult<()> {
        storage.acquire_lock(path, kind, self.provider.as_ref())?;
        self.held.push(Held {
            storage: Arc::clone(storage),
            path: path.to_string(),
            kind,
        });
        Ok(())
    }

    /// Convert every held lock to `kind`.
    ///
    /// If one conversion fails the ones already converted are reverted, so
    /// the guard still holds what it held before the call.
    pub fn change(&mut self, kind: LockKind) -> VfsResult<()> {
        for idx in 0..self.held.len() {
            let held = &self.held[idx];
            if held.kind == kind {
                continue;
            }
            if let Err(e) = held
                .storage
                .change_lock(&held.path, kind, self.provider.as_ref())
            {
                for done in self.held[..idx].iter().rev() {
                    if done.kind == kind {
                        continue;
                    }
                    let _ = done
                        .storage
                        .change_lock(&done.path, kind_other(kind), self.provider.as_ref());
                }
                return Err(e);
            }
        }
        for held in &mut self.held {
            held.kind = kind;
        }
        Ok(())
    }

    /// Give up ownership of the held locks without releasing them.
    ///
    /// The caller becomes responsible for releasing them through the
    /// provider.
    pub fn detach(mut self) {
        self.held.clear();
    }

    /// Number of locks held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

fn kind_other(kind: LockKind) -> LockKind {
    match kind {
        LockKind::Shared => LockKind::Exclusive,
        LockKind::Exclusive => LockKind::Shared,
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        while let Some(held) = self.held.pop() {
            held.storage
                .release_lock(&held.path, held.kind, self.provider.as_ref());
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field(
                "held",
                &self
                    .held
                    .iter()
                    .map(|h| (h.storage.id(), h.path.as_str(), h.kind))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
