//! Local filesystem snapshot provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::provider::{Metadata, SnapshotProvider};
use bastion_common::{Error, Result};

/// Local filesystem snapshot provider.
///
/// Relative snapshot paths resolve against an optional root directory.
/// Writes go to a temporary sibling file which is synced and then renamed
/// over the target.
#[derive(Debug, Clone, Default)]
pub struct LocalProvider {
    root: Option<PathBuf>,
}

impl LocalProvider {
    /// Create a provider that uses paths as given.
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Create a provider resolving relative paths against `root`.
    ///
    /// # Errors
    /// - Root cannot be created
    pub fn with_root(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root: Some(root) })
    }

    fn to_fs_path(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn create_metadata(path: &Path, fs_meta: std::fs::Metadata) -> Metadata {
        let modified: DateTime<Utc> = fs_meta
            .modified()
            .map(|t| t.into())
            .unwrap_or_else(|_| Utc::now());

        Metadata {
            path: path.to_path_buf(),
            size: fs_meta.len(),
            modified,
        }
    }

    fn temp_path_for(target: &Path) -> Result<PathBuf> {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidParameter(format!("Invalid snapshot path: {}", target.display()))
            })?;
        Ok(target.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4())))
    }

    async fn remove_temp(temp: &Path) {
        if let Err(e) = fs::remove_file(temp).await {
            warn!(temp = %temp.display(), error = %e, "Failed to remove temporary snapshot");
        }
    }

    async fn write_and_sync(temp: &Path, data: &[u8]) -> Result<()> {
        let mut file = fs::File::create(temp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!(
                "Snapshot not found: {}",
                path.display()
            )));
        }

        if fs_path.is_dir() {
            return Err(Error::InvalidParameter(format!(
                "Snapshot path is a directory: {}",
                path.display()
            )));
        }

        Ok(fs::read(&fs_path).await?)
    }

    async fn write_atomic(&self, path: &Path, data: Vec<u8>) -> Result<Metadata> {
        let fs_path = self.to_fs_path(path);

        if let Some(parent) = fs_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp = Self::temp_path_for(&fs_path)?;
        if let Err(e) = Self::write_and_sync(&temp, &data).await {
            Self::remove_temp(&temp).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp, &fs_path).await {
            Self::remove_temp(&temp).await;
            return Err(e.into());
        }

        #[cfg(unix)]
        if let Some(parent) = fs_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::File::open(parent).await?.sync_all().await?;
        }

        debug!(path = %fs_path.display(), size = data.len(), "Snapshot file replaced");

        let fs_meta = fs::metadata(&fs_path).await?;
        Ok(Self::create_metadata(path, fs_meta))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.to_fs_path(path).is_file())
    }

    async fn metadata(&self, path: &Path) -> Result<Metadata> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!(
                "Snapshot not found: {}",
                path.display()
            )));
        }

        let fs_meta = fs::metadata(&fs_path).await?;
        Ok(Self::create_metadata(path, fs_meta))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!(
                "Snapshot not found: {}",
                path.display()
            )));
        }

        fs::remove_file(&fs_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_write_read() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new();
        let path = temp.path().join("test.snapshot");

        provider
            .write_atomic(&path, b"Hello, Local!".to_vec())
            .await
            .unwrap();
        let read = provider.read(&path).await.unwrap();

        assert_eq!(read, b"Hello, Local!");
    }

    #[tokio::test]
    async fn test_local_replace_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new();
        let path = temp.path().join("a.snapshot");

        provider.write_atomic(&path, vec![1; 16]).await.unwrap();
        provider.write_atomic(&path, vec![2; 8]).await.unwrap();

        assert_eq!(provider.read(&path).await.unwrap(), vec![2; 8]);
        let entries: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_local_failed_rename_removes_temp_file() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new();
        let path = temp.path().join("taken.snapshot");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("inner"), b"x").unwrap();

        assert!(provider.write_atomic(&path, vec![1; 4]).await.is_err());

        let names: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("taken.snapshot")]);
    }

    #[tokio::test]
    async fn test_local_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new();
        let path = temp.path().join("nested/dir/x.snapshot");

        let meta = provider.write_atomic(&path, vec![9; 4]).await.unwrap();
        assert_eq!(meta.size, 4);
        assert!(provider.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_relative_paths_use_root() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::with_root(temp.path()).unwrap();

        provider
            .write_atomic(Path::new("rel.snapshot"), vec![3])
            .await
            .unwrap();
        assert!(temp.path().join("rel.snapshot").exists());
    }

    #[tokio::test]
    async fn test_local_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new();

        let result = provider.read(&temp.path().join("missing")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(!provider.exists(&temp.path().join("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_delete() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new();
        let path = temp.path().join("d.snapshot");

        provider.write_atomic(&path, vec![1]).await.unwrap();
        provider.delete(&path).await.unwrap();
        assert!(!provider.exists(&path).await.unwrap());
    }
}
