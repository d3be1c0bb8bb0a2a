use std::path::{Component, Path, PathBuf};

/// An error acquiring the storage that holds the checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Nothing is mounted at the configured location.
    #[error("Storage is not mounted at {0}")]
    NotMounted(PathBuf),
    /// Something other than a directory is at the mount point.
    #[error("Storage mount point {0} is not a directory")]
    NotADirectory(PathBuf),
    /// The mount point exists but cannot be read.
    #[error("Storage at {0} is unavailable: {1}")]
    Unavailable(PathBuf, #[source] std::io::Error),
    /// A path was requested outside of the mounted storage.
    #[error("{path} is outside of the storage mounted at {root}")]
    OutsideMount {
        /// The mount point
        root: PathBuf,
        /// The requested path
        path: PathBuf,
    },
}

/// Read access to an externally mounted storage location (a network drive, a
/// cloud bucket fuse mount, or a plain directory).
#[derive(Debug, Clone)]
pub struct StorageMount {
    root: PathBuf,
}

impl StorageMount {
    /// Check that the storage at `root` is mounted and readable.
    pub fn acquire(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let metadata = match std::fs::metadata(&root) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotMounted(root))
            }
            Err(err) => return Err(StorageError::Unavailable(root, err)),
        };
        if !metadata.is_dir() {
            return Err(StorageError::NotADirectory(root));
        }
        // Stale network mounts report metadata but fail to list.
        if let Err(err) = std::fs::read_dir(&root) {
            return Err(StorageError::Unavailable(root, err));
        }
        tracing::info!("Storage mounted at {}", root.display());
        Ok(Self { root })
    }

    /// The mount point.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path on the storage. Relative paths are joined to the mount point.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, StorageError> {
        let path = path.as_ref();
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let escapes = resolved
            .components()
            .any(|component| component == Component::ParentDir);
        if escapes || !resolved.starts_with(&self.root) {
            return Err(StorageError::OutsideMount {
                root: self.root.clone(),
                path: resolved,
            });
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_existing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mount = StorageMount::acquire(dir.path()).unwrap();
        assert_eq!(mount.root(), dir.path());
        assert_eq!(
            mount.resolve("MyDrive/model").unwrap(),
            dir.path().join("MyDrive/model")
        );
        assert_eq!(
            mount.resolve(dir.path().join("model")).unwrap(),
            dir.path().join("model")
        );
    }

    #[test]
    fn missing_mounts_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("drive");
        assert!(matches!(
            StorageMount::acquire(&missing),
            Err(StorageError::NotMounted(path)) if path == missing
        ));
    }

    #[test]
    fn files_are_not_mounts() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            StorageMount::acquire(file.path()),
            Err(StorageError::NotADirectory(_))
        ));
    }

    #[test]
    fn paths_outside_the_mount_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mount = StorageMount::acquire(dir.path()).unwrap();
        assert!(matches!(
            mount.resolve("/somewhere/else"),
            Err(StorageError::OutsideMount { .. })
        ));
        assert!(matches!(
            mount.resolve("../elsewhere"),
            Err(StorageError::OutsideMount { .. })
        ));
        assert!(matches!(
            mount.resolve(dir.path().join("MyDrive/../../elsewhere")),
            Err(StorageError::OutsideMount { .. })
        ));
    }
}
