//! In-memory snapshot provider for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::provider::{Metadata, SnapshotProvider};
use bastion_common::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

/// In-memory snapshot provider.
///
/// Useful for testing. Clones share the same storage. Writes can be made
/// to fail on demand to exercise error paths.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    storage: Arc<RwLock<HashMap<PathBuf, Entry>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn metadata_of(path: &Path, entry: &Entry) -> Metadata {
        Metadata {
            path: path.to_path_buf(),
            size: entry.data.len() as u64,
            modified: entry.modified,
        }
    }

    fn poisoned() -> Error {
        Error::Io(std::io::Error::other("memory provider lock poisoned"))
    }
}

#[async_trait]
impl SnapshotProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let storage = self.storage.read().map_err(|_| Self::poisoned())?;
        storage
            .get(path)
            .map(|e| e.data.clone())
            .ok_or_else(|| Error::NotFound(format!("Snapshot not found: {}", path.display())))
    }

    async fn write_atomic(&self, path: &Path, data: Vec<u8>) -> Result<Metadata> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("simulated write failure")));
        }

        let entry = Entry {
            data,
            modified: Utc::now(),
        };
        let metadata = Self::metadata_of(path, &entry);
        self.storage
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(path.to_path_buf(), entry);

        Ok(metadata)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self
            .storage
            .read()
            .map_err(|_| Self::poisoned())?
            .contains_key(path))
    }

    async fn metadata(&self, path: &Path) -> Result<Metadata> {
        let storage = self.storage.read().map_err(|_| Self::poisoned())?;
        storage
            .get(path)
            .map(|e| Self::metadata_of(path, e))
            .ok_or_else(|| Error::NotFound(format!("Snapshot not found: {}", path.display())))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        self.storage
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Snapshot not found: {}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_write_read() {
        let provider = MemoryProvider::new();
        let path = Path::new("/test.snapshot");

        provider.write_atomic(path, b"Hello".to_vec()).await.unwrap();
        assert_eq!(provider.read(path).await.unwrap(), b"Hello");
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let provider = MemoryProvider::new();
        let other = provider.clone();
        let path = Path::new("/shared");

        provider.write_atomic(path, vec![1, 2]).await.unwrap();
        assert!(other.exists(path).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_content() {
        let provider = MemoryProvider::new();
        let path = Path::new("/keep");

        provider.write_atomic(path, vec![1]).await.unwrap();
        provider.set_fail_writes(true);
        assert!(provider.write_atomic(path, vec![2]).await.is_err());
        assert_eq!(provider.read(path).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let provider = MemoryProvider::new();
        let result = provider.delete(Path::new("/nope")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
