//! Logical path handling.
//!
//! Logical paths are absolute (`/a/b`), internal paths are relative to a
//! storage root (`a/b`, `""` for the root).

use serde::{Deserialize, Serialize};

use super::error::{VfsError, VfsResult};

/// Longest path the cache path column stores.
pub const MAX_PATH_LENGTH: usize = 4000;

/// Longest single path component.
pub const MAX_NAME_LENGTH: usize = 255;

/// Extension of in-flight upload files that are never admitted to the cache.
pub const PARTIAL_FILE_EXTENSION: &str = "part";

/// Limits enforced on every path entering a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathLimits {
    pub max_path_length: usize,
    pub max_name_length: usize,
}

impl Default for PathLimits {
    fn default() -> Self {
        Self {
            max_path_length: MAX_PATH_LENGTH,
            max_name_length: MAX_NAME_LENGTH,
        }
    }
}

/// Normalize a logical path.
///
/// Ensures a leading `/`, collapses repeated separators, drops `.`
/// components and strips the trailing separator (except for the root).
/// A `..` component is rejected instead of resolved.
pub fn normalize_path(path: &str) -> VfsResult<String> {
    let mut out = String::with_capacity(path.len() + 1);
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => return Err(VfsError::invalid_path(path)),
            name => {
                out.push('/');
                out.push_str(name);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Reject paths that cannot be stored: control characters, oversized
/// components or an oversized whole.
pub fn verify_path(path: &str, limits: &PathLimits) -> VfsResult<()> {
    if path.len() > limits.max_path_length {
        return Err(VfsError::invalid_path(format!(
            "path exceeds {} characters",
            limits.max_path_length
        )));
    }
    if path.chars().any(|c| c == '\0' || c.is_control()) {
        return Err(VfsError::invalid_path(path));
    }
    if let Some(long) = path.split('/').find(|c| c.len() > limits.max_name_length) {
        return Err(VfsError::invalid_path(format!(
            "file name too long: {}...",
            &long[..long.char_indices().nth(32).map(|(i, _)| i).unwrap_or(long.len())]
        )));
    }
    Ok(())
}

/// Parent of a logical path (`/a/b` → `/a`, `/a` → `/`).
pub fn dirname(path: &str) -> String {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Last component of a path, empty for the root.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Join a logical directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" || dir.is_empty() {
        format!("/{}", name.trim_start_matches('/'))
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
    }
}

/// Join an internal directory and a child name (`""` + `a` → `a`).
pub fn join_internal(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Parent of an internal path (`a/b` → `a`, `a` → `""`).
pub fn internal_parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Upload in progress: `foo.txt.part` or anything inside a `*.part` folder.
pub fn is_partial_file(path: &str) -> bool {
    let suffix = format!(".{}", PARTIAL_FILE_EXTENSION);
    path.ends_with(&suffix) || path.contains(&format!("{}/", suffix))
}

/// Whether `path` equals `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" || ancestor.is_empty() {
        return true;
    }
    let ancestor = ancestor.trim_end_matches('/');
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}
