//! Errors raised by storages, the cache and the view.
//!
//! Business refusals (a cancelled hook, deleting a root) are not errors;
//! view operations report those as `Ok(false)` or `Ok(None)`.

use std::io;
use thiserror::Error;

use crate::lock::LockKind;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("storage is read-only")]
    ReadOnly,

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// `..` or a symlink leading out of a local root.
    #[error("path escapes storage root: {0}")]
    PathEscapesRoot(String),

    /// Over-length, traversing or otherwise malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("nothing is mounted at {0}")]
    NoMountPoint(String),

    #[error("{path} is locked ({kind})")]
    Locked { path: String, kind: LockKind },

    /// Structural change refused by mount policy.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A multi-step transfer broke and could not be rolled back.
    #[error("file operation failed: {0}")]
    GenericFile(String),

    #[error("metadata cache: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

macro_rules! message_ctors {
    ($($name:ident => $variant:ident),* $(,)?) => {
        $(
            pub fn $name(msg: impl Into<String>) -> Self {
                Self::$variant(msg.into())
            }
        )*
    };
}

impl VfsError {
    message_ctors! {
        not_found => NotFound,
        already_exists => AlreadyExists,
        permission_denied => PermissionDenied,
        not_a_directory => NotADirectory,
        is_a_directory => IsADirectory,
        directory_not_empty => DirectoryNotEmpty,
        path_escapes_root => PathEscapesRoot,
        invalid_path => InvalidPath,
        no_mount_point => NoMountPoint,
        forbidden => Forbidden,
        generic_file => GenericFile,
        config => Config,
        other => Other,
    }

    pub fn locked(path: impl Into<String>, kind: LockKind) -> Self {
        Self::Locked {
            path: path.into(),
            kind,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    /// Missing object, missing mount, or an I/O `NotFound` from a backend.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::NoMountPoint(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Nearest `io::ErrorKind`, for callers that report through `std::io`.
    pub fn io_kind(&self) -> io::ErrorKind {
        use io::ErrorKind as K;
        match self {
            Self::NotFound(_) | Self::NoMountPoint(_) => K::NotFound,
            Self::AlreadyExists(_) => K::AlreadyExists,
            Self::PermissionDenied(_)
            | Self::ReadOnly
            | Self::PathEscapesRoot(_)
            | Self::Forbidden(_) => K::PermissionDenied,
            Self::NotADirectory(_) => K::NotADirectory,
            Self::IsADirectory(_) => K::IsADirectory,
            Self::DirectoryNotEmpty(_) => K::DirectoryNotEmpty,
            Self::InvalidPath(_) => K::InvalidInput,
            Self::Config(_) => K::InvalidData,
            Self::Locked { .. } => K::ResourceBusy,
            Self::Io(e) => e.kind(),
            Self::GenericFile(_) | Self::Cache(_) | Self::Other(_) => K::Other,
        }
    }
}

impl From<VfsError> for io::Error {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_message() {
        let err = VfsError::locked("/foo.txt", LockKind::Exclusive);
        assert!(err.is_locked());
        assert_eq!(err.to_string(), "/foo.txt is locked (exclusive)");
        assert_eq!(err.io_kind(), io::ErrorKind::ResourceBusy);
    }

    #[test]
    fn test_not_found_detection() {
        assert!(VfsError::not_found("x").is_not_found());
        assert!(VfsError::no_mount_point("/x").is_not_found());
        assert!(VfsError::Io(io::Error::from(io::ErrorKind::NotFound)).is_not_found());
        assert!(!VfsError::forbidden("x").is_not_found());
    }

    #[test]
    fn test_io_kind_mapping() {
        assert_eq!(
            VfsError::invalid_path("a/../b").io_kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(VfsError::ReadOnly.io_kind(), io::ErrorKind::PermissionDenied);

        let io_err: io::Error = VfsError::not_a_directory("a/b").into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotADirectory);
        assert_eq!(io_err.to_string(), "not a directory: a/b");
        assert_eq!(
            VfsError::Io(io::Error::other("disk full")).to_string(),
            "disk full"
        );
    }
}
