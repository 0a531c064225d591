//! Object-store access for one-block and merged-block archives.

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Flat namespace of opaque byte objects, listed in ascending name order.
///
/// One-block filenames embed a zero-padded block number, so lexicographic
/// order is block order.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Object names strictly greater than `start_after`, ascending, up to
    /// `limit` entries.
    async fn list_from(&self, start_after: Option<&str>, limit: usize) -> Result<Vec<String>>;

    /// `Ok(None)` when the object does not exist.
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Atomic write: on failure no object is visible under `name`.
    async fn write(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Idempotent: deleting an absent object succeeds.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Filesystem-backed store rooted at a single directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .wrap_err_with(|| format!("failed to create store directory {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn list_from(&self, start_after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .wrap_err("failed to list store directory")?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(".tmp") {
                continue;
            }
            if let Some(after) = start_after {
                if name.as_str() <= after {
                    continue;
                }
            }
            names.push(name);
        }
        names.sort();
        names.truncate(limit);
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.object_path(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).wrap_err_with(|| format!("failed to read object {name}")),
        }
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let target = self.object_path(name);
        let temp = self.object_path(&format!("{name}.tmp"));
        if let Err(err) = fs::write(&temp, data).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err).wrap_err_with(|| format!("failed to stage object {name}"));
        }
        if let Err(err) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err).wrap_err_with(|| format!("failed to publish object {name}"));
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.object_path(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).wrap_err_with(|| format!("failed to delete object {name}")),
        }
    }
}
