//! Moving and copying between two storages.
//!
//! The target storage's [`CrossStorageTransfer`] fast path is used when it
//! accepts the source; otherwise content is streamed chunk by chunk, one
//! child at a time for directories. A failed transfer deletes what it
//! created on the target and reports `Ok(false)`; the source is not touched.
//! Objects that were already on the target stay, although a file the stream
//! had started to overwrite keeps the partial content.

use std::future::Future;
use std::pin::Pin;

use crate::vfs::path::{internal_parent, join_internal};
use crate::vfs::storage::COPY_CHUNK_SIZE;
use crate::vfs::{CrossStorageTransfer, Mount, Storage, VfsError, VfsResult};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TransferKind {
    Copy,
    Move,
}

/// Transfer `source_path` on `source` to `target_path` on `target` and
/// update both caches.
pub(super) async fn transfer(
    source: &Mount,
    source_path: &str,
    target: &Mount,
    target_path: &str,
    kind: TransferKind,
) -> VfsResult<bool> {
    let source_storage = source.storage().as_ref();
    let target_storage = target.storage().as_ref();
    let fast = target_storage
        .as_transfer()
        .filter(|t| t.accepts(source_storage));
    let target_existed = target_storage.exists(target_path).await;
    let mut created = Vec::new();

    let sent = match (fast, kind) {
        (Some(fast), TransferKind::Copy) => {
            fast.copy_from_storage(source_storage, source_path, target_path)
                .await
        }
        (Some(fast), TransferKind::Move) => {
            fast.move_from_storage(source_storage, source_path, target_path)
                .await
        }
        (None, _) => {
            stream_copy(
                source_storage,
                source_path,
                target_storage,
                target_path,
                &mut created,
            )
            .await
        }
    };

    if let Err(e) = sent {
        tracing::warn!(
            source = %source_storage.id(),
            target = %target_storage.id(),
            path = target_path,
            error = %e,
            "transfer failed, rolling back"
        );
        let undo = match (fast, target_existed) {
            (None, _) => Undo::Created(&created),
            (Some(_), false) => Undo::Whole,
            (Some(_), true) => Undo::Nothing,
        };
        rollback(target, target_path, undo, target_existed).await?;
        return Ok(false);
    }

    if fast.is_none() && kind == TransferKind::Move {
        if let Err(e) = source_storage.remove_tree(source_path).await {
            // the copy is complete; keep it and resync what is left of the source
            tracing::warn!(storage = %source_storage.id(), path = source_path, error = %e, "failed to remove moved source");
            target.updater().add_tree(target_path).await?;
            source.updater().add_tree(source_path).await?;
            return Err(e);
        }
    }

    match kind {
        TransferKind::Copy => target.updater().add_tree(target_path).await?,
        TransferKind::Move => {
            target
                .updater()
                .rename_across(&source.updater(), source_path, target_path)
                .await?
        }
    }
    Ok(true)
}

/// What a failed transfer left behind on the target.
enum Undo<'a> {
    /// Paths the stream created, parents first.
    Created(&'a [String]),
    /// The fast path gives no record; the target did not exist before.
    Whole,
    Nothing,
}

/// Remove what the failed transfer added, then bring the cache in line.
async fn rollback(target: &Mount, path: &str, undo: Undo<'_>, existed: bool) -> VfsResult<()> {
    let storage = target.storage();
    let doomed: Vec<&str> = match undo {
        Undo::Created(paths) => paths.iter().rev().map(String::as_str).collect(),
        Undo::Whole => vec![path],
        Undo::Nothing => Vec::new(),
    };
    for victim in doomed {
        if !storage.exists(victim).await {
            continue;
        }
        if let Err(e) = storage.remove_tree(victim).await {
            tracing::warn!(storage = %storage.id(), path = victim, error = %e, "rollback failed");
            return Err(VfsError::generic_file(format!(
                "could not remove partial transfer target {}: {}",
                victim, e
            )));
        }
    }

    if existed {
        target.updater().add_tree(path).await
    } else {
        target.cache().remove(path)?;
        target.cache().correct_folder_size(internal_parent(path))
    }
}

/// Copy through the generic read/write interface, recording in `created`
/// every target path that did not exist before.
fn stream_copy<'a>(
    source: &'a dyn Storage,
    source_path: &'a str,
    target: &'a dyn Storage,
    target_path: &'a str,
    created: &'a mut Vec<String>,
) -> BoxFuture<'a, VfsResult<()>> {
    Box::pin(async move {
        let attr = source.stat(source_path).await?;
        if attr.is_dir() {
            if !target.is_dir(target_path).await {
                target.mkdir(target_path, attr.perm).await?;
                created.push(target_path.to_string());
            }
            for child in source.readdir(source_path).await? {
                let from = join_internal(source_path, &child.name);
                let to = join_internal(target_path, &child.name);
                stream_copy(source, &from, target, &to, &mut *created).await?;
            }
            return Ok(());
        }

        if target.exists(target_path).await {
            target.truncate(target_path, 0).await?;
        } else {
            target.create(target_path, attr.perm).await?;
            created.push(target_path.to_string());
        }
        let mut offset = 0u64;
        loop {
            let chunk = source.read(source_path, offset, COPY_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            let mut written = 0usize;
            while written < chunk.len() {
                let n = target
                    .write(target_path, offset + written as u64, &chunk[written..])
                    .await?;
                if n == 0 {
                    return Err(VfsError::generic_file(format!("short write to {}", target_path)));
                }
                written += n as usize;
            }
            offset += chunk.len() as u64;
        }
        Ok(())
    })
}
