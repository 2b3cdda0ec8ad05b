//! Filesystem configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! [cache]
//! path = "/var/lib/polyfs/cache.db"   # in-memory when absent
//!
//! [locking]
//! enabled = true
//!
//! [limits]
//! max_path_length = 4000
//! max_name_length = 255
//!
//! [[mounts]]
//! point = "/"
//! backend = { type = "local", root = "/srv/files" }
//!
//! [[mounts]]
//! point = "/scratch"
//! backend = { type = "memory" }
//! movable = true
//! options = { filesystem_check_changes = "always" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::vfs::path::{PathLimits, normalize_path};
use crate::vfs::{LocalBackend, MemoryBackend, MountOptions, Storage, VfsError, VfsResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite database file. The cache lives in memory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    pub enabled: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Storage behind a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory,
    Local {
        root: PathBuf,
        #[serde(default)]
        read_only: bool,
    },
}

impl BackendConfig {
    /// Instantiate the storage.
    pub fn build(&self) -> VfsResult<Arc<dyn Storage>> {
        match self {
            BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
            BackendConfig::Local { root, read_only } => {
                if !root.is_dir() {
                    return Err(VfsError::config(format!(
                        "local backend root {} is not a directory",
                        root.display()
                    )));
                }
                let backend = if *read_only {
                    LocalBackend::read_only(root)
                } else {
                    LocalBackend::new(root)
                };
                Ok(Arc::new(backend))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub point: String,
    pub backend: BackendConfig,
    #[serde(default)]
    pub movable: bool,
    #[serde(default)]
    pub options: MountOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    pub cache: CacheConfig,
    pub locking: LockingConfig,
    pub limits: PathLimits,
    pub mounts: Vec<MountConfig>,
}

impl FilesystemConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> VfsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            VfsError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), mounts = config.mounts.len(), "loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> VfsResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| VfsError::config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Mount points must be absolute and unique.
    pub fn validate(&self) -> VfsResult<()> {
        let mut seen = HashSet::new();
        for mount in &self.mounts {
            if !mount.point.starts_with('/') {
                return Err(VfsError::config(format!(
                    "mount point {:?} must be absolute",
                    mount.point
                )));
            }
            let point = normalize_path(&mount.point)
                .map_err(|_| VfsError::config(format!("invalid mount point {:?}", mount.point)))?;
            if !seen.insert(point.clone()) {
                return Err(VfsError::config(format!("duplicate mount point {}", point)));
            }
            if let BackendConfig::Local { root, .. } = &mount.backend {
                if root.is_relative() {
                    return Err(VfsError::config(format!(
                        "local backend root {} for {} must be absolute",
                        root.display(),
                        point
                    )));
                }
            }
        }
        if self.limits.max_name_length == 0 || self.limits.max_path_length == 0 {
            return Err(VfsError::config("path limits must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WatchPolicy;

    #[test]
    fn test_parse_full_config() {
        let config = FilesystemConfig::from_toml_str(
            r#"
            [cache]
            path = "/tmp/polyfs-cache.db"

            [locking]
            enabled = false

            [limits]
            max_name_length = 128

            [[mounts]]
            point = "/"
            backend = { type = "local", root = "/srv/files", read_only = true }

            [[mounts]]
            point = "/scratch"
            backend = { type = "memory" }
            movable = true
            options = { filesystem_check_changes = "always", shared = true }
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.path.as_deref(), Some(Path::new("/tmp/polyfs-cache.db")));
        assert!(!config.locking.enabled);
        assert_eq!(config.limits.max_name_length, 128);
        assert_eq!(config.limits.max_path_length, 4000);
        assert_eq!(config.mounts.len(), 2);
        assert_eq!(
            config.mounts[0].backend,
            BackendConfig::Local {
                root: PathBuf::from("/srv/files"),
                read_only: true
            }
        );
        assert!(config.mounts[1].movable);
        assert_eq!(config.mounts[1].options.watch_policy, WatchPolicy::Always);
        assert!(config.mounts[1].options.shared);
    }

    #[test]
    fn test_defaults() {
        let config = FilesystemConfig::from_toml_str("").unwrap();
        assert!(config.cache.path.is_none());
        assert!(config.locking.enabled);
        assert!(config.mounts.is_empty());
    }

    #[test]
    fn test_rejects_duplicate_points() {
        let err = FilesystemConfig::from_toml_str(
            r#"
            [[mounts]]
            point = "/data"
            backend = { type = "memory" }

            [[mounts]]
            point = "/data/"
            backend = { type = "memory" }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, VfsError::Config(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_rejects_relative_paths() {
        let relative_point = FilesystemConfig::from_toml_str(
            r#"
            [[mounts]]
            point = "data"
            backend = { type = "memory" }
            "#,
        );
        assert!(matches!(relative_point, Err(VfsError::Config(_))));

        let relative_root = FilesystemConfig::from_toml_str(
            r#"
            [[mounts]]
            point = "/data"
            backend = { type = "local", root = "relative/dir" }
            "#,
        );
        assert!(matches!(relative_root, Err(VfsError::Config(_))));
    }

    #[test]
    fn test_unknown_backend() {
        let err = FilesystemConfig::from_toml_str(
            r#"
            [[mounts]]
            point = "/x"
            backend = { type = "ftp" }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, VfsError::Config(_)));
    }

    #[test]
    fn test_local_backend_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ok = BackendConfig::Local {
            root: dir.path().to_path_buf(),
            read_only: true,
        };
        assert!(ok.build().unwrap().read_only());

        let missing = BackendConfig::Local {
            root: dir.path().join("missing"),
            read_only: false,
        };
        assert!(missing.build().is_err());
    }
}
