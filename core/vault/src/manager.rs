//! Snapshot manager: loads, caches and unloads snapshots by path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::client::Client;
use crate::config::EngineConfig;
use crate::session::{ListenerToken, Status, StatusEvent};
use crate::snapshot::Snapshot;
use bastion_common::{ClientId, Error, Result};
use bastion_storage::{LocalProvider, Metadata, SnapshotProvider};

/// Registry of loaded snapshots.
///
/// Every snapshot is loaded at most once; loading the same path again
/// returns the cached handle after checking the password.
pub struct VaultManager {
    provider: Arc<dyn SnapshotProvider>,
    config: EngineConfig,
    snapshots: RwLock<HashMap<PathBuf, Snapshot>>,
}

impl VaultManager {
    pub fn new(provider: Arc<dyn SnapshotProvider>, config: EngineConfig) -> Self {
        Self {
            provider,
            config,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Manager backed by the local filesystem.
    pub fn local(config: EngineConfig) -> Self {
        Self::new(Arc::new(LocalProvider::new()), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load the snapshot at `path`, creating an empty one if the file does
    /// not exist yet. Nothing is written until [`save`](Self::save).
    ///
    /// # Errors
    /// - `Authentication` if the password is wrong or the file was altered
    /// - `InvalidParameter` for an incompatible snapshot version
    pub async fn load(&self, path: impl AsRef<Path>, password: &[u8]) -> Result<Snapshot> {
        let path = path.as_ref();
        let mut snapshots = self.snapshots.write().await;

        if let Some(snapshot) = snapshots.get(path) {
            debug!(path = %path.display(), "Snapshot already loaded");
            snapshot.reload(password).await?;
            return Ok(snapshot.clone());
        }

        let snapshot = Snapshot::load(self.provider.clone(), path, password, &self.config).await?;
        snapshots.insert(path.to_path_buf(), snapshot.clone());
        Ok(snapshot)
    }

    /// Handle to an already loaded snapshot.
    ///
    /// # Errors
    /// - `NotFound` if the snapshot is not loaded
    pub async fn snapshot(&self, path: impl AsRef<Path>) -> Result<Snapshot> {
        let path = path.as_ref();
        self.snapshots
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("Snapshot not loaded: {}", path.display()))
            })
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.snapshot(path).await?.save().await
    }

    pub async fn save_with_password(&self, path: impl AsRef<Path>, new_password: &[u8]) -> Result<()> {
        self.snapshot(path).await?.save_with_password(new_password).await
    }

    pub async fn reload(&self, path: impl AsRef<Path>, password: &[u8]) -> Result<()> {
        self.snapshot(path).await?.reload(password).await
    }

    /// Drop the snapshot from memory without saving. Outstanding handles
    /// fail with `NotFound` afterwards.
    pub async fn unload(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot = self
            .snapshots
            .write()
            .await
            .remove(path)
            .ok_or_else(|| Error::NotFound(format!("Snapshot not loaded: {}", path.display())))?;
        snapshot.unload().await
    }

    /// Size and modification time of the stored snapshot file.
    ///
    /// # Errors
    /// - `NotFound` if nothing was saved at `path` yet
    pub async fn metadata(&self, path: impl AsRef<Path>) -> Result<Metadata> {
        self.provider.metadata(path.as_ref()).await
    }

    /// Unload the snapshot if loaded and delete its file.
    ///
    /// # Errors
    /// - `NotFound` if nothing was saved at `path`
    pub async fn delete(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let loaded = self.snapshots.write().await.remove(path);
        if let Some(snapshot) = loaded {
            snapshot.unload().await?;
        }
        self.provider.delete(path).await?;
        info!(path = %path.display(), provider = self.provider.name(), "Snapshot deleted");
        Ok(())
    }

    /// Unload every snapshot.
    pub async fn unload_all(&self) -> Result<()> {
        let snapshots: Vec<Snapshot> = self.snapshots.write().await.drain().map(|(_, s)| s).collect();
        for snapshot in snapshots {
            snapshot.unload().await?;
        }
        info!("All snapshots unloaded");
        Ok(())
    }

    pub async fn status(&self, path: impl AsRef<Path>) -> Result<Status> {
        self.snapshot(path).await?.status().await
    }

    pub async fn lock(&self, path: impl AsRef<Path>) -> Result<()> {
        self.snapshot(path).await?.lock().await
    }

    pub async fn set_password_clear_interval(
        &self,
        path: impl AsRef<Path>,
        interval: Duration,
    ) -> Result<()> {
        self.snapshot(path)
            .await?
            .set_password_clear_interval(interval)
            .await
    }

    pub async fn create_client(
        &self,
        path: impl AsRef<Path>,
        client: impl Into<ClientId>,
    ) -> Result<Client> {
        self.snapshot(path).await?.create_client(client).await
    }

    pub async fn load_client(
        &self,
        path: impl AsRef<Path>,
        client: impl Into<ClientId>,
    ) -> Result<Client> {
        self.snapshot(path).await?.load_client(client).await
    }

    pub async fn remove_client(
        &self,
        path: impl AsRef<Path>,
        client: impl Into<ClientId>,
    ) -> Result<()> {
        self.snapshot(path).await?.remove_client(client).await
    }

    /// Register a status listener on a loaded snapshot.
    pub async fn subscribe(
        &self,
        path: impl AsRef<Path>,
        listener: impl Fn(&StatusEvent) + Send + Sync + 'static,
    ) -> Result<ListenerToken> {
        Ok(self.snapshot(path).await?.subscribe(listener))
    }

    /// Paths of all loaded snapshots.
    pub async fn loaded_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.snapshots.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_common::{Location, RecordHint};
    use bastion_crypto::KdfParams;
    use bastion_storage::MemoryProvider;

    fn manager() -> VaultManager {
        VaultManager::new(
            Arc::new(MemoryProvider::new()),
            EngineConfig::default().with_kdf_params(KdfParams::minimal()),
        )
    }

    #[tokio::test]
    async fn test_load_is_cached() {
        let manager = manager();
        let first = manager.load("a.snapshot", b"pw").await.unwrap();
        first.create_client("c").await.unwrap();

        let second = manager.load("a.snapshot", b"pw").await.unwrap();
        assert!(second.load_client("c").await.is_ok());
        assert_eq!(manager.loaded_paths().await, vec![PathBuf::from("a.snapshot")]);
    }

    #[tokio::test]
    async fn test_load_cached_checks_password() {
        let manager = manager();
        manager.load("a.snapshot", b"pw").await.unwrap();

        assert!(matches!(
            manager.load("a.snapshot", b"wrong").await,
            Err(Error::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_not_loaded() {
        let manager = manager();
        assert!(matches!(
            manager.snapshot("missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            manager.status("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_unload_load() {
        let manager = manager();
        manager.load("a.snapshot", b"pw").await.unwrap();
        let client = manager.create_client("a.snapshot", "c").await.unwrap();
        client
            .write_secret(&Location::generic("v", "r"), b"secret", RecordHint::default())
            .await
            .unwrap();
        manager.save("a.snapshot").await.unwrap();

        manager.unload("a.snapshot").await.unwrap();
        assert!(matches!(
            client.record_exists(&Location::generic("v", "r")).await,
            Err(Error::NotFound(_))
        ));
        assert!(manager.loaded_paths().await.is_empty());

        manager.load("a.snapshot", b"pw").await.unwrap();
        let client = manager.load_client("a.snapshot", "c").await.unwrap();
        assert!(client
            .record_exists(&Location::generic("v", "r"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unload_all() {
        let manager = manager();
        manager.load("a", b"pw").await.unwrap();
        manager.load("b", b"pw").await.unwrap();

        manager.unload_all().await.unwrap();
        assert!(manager.loaded_paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_and_delete() {
        let manager = manager();
        manager.load("a", b"pw").await.unwrap();
        assert!(matches!(manager.metadata("a").await, Err(Error::NotFound(_))));

        manager.save("a").await.unwrap();
        let metadata = manager.metadata("a").await.unwrap();
        assert_eq!(metadata.path, PathBuf::from("a"));
        assert!(metadata.size > 0);

        manager.delete("a").await.unwrap();
        assert!(manager.loaded_paths().await.is_empty());
        assert!(matches!(manager.metadata("a").await, Err(Error::NotFound(_))));
        assert!(matches!(manager.delete("a").await, Err(Error::NotFound(_))));

        // A fresh load starts over with any password.
        manager.load("a", b"other").await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_and_reload() {
        let manager = manager();
        manager.load("a", b"pw").await.unwrap();
        manager.lock("a").await.unwrap();
        assert_eq!(manager.status("a").await.unwrap(), Status::Locked);

        manager.reload("a", b"pw").await.unwrap();
        assert!(!manager.status("a").await.unwrap().is_locked());
    }
}
