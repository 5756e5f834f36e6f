//! Loaded snapshots: persistence, locking and client management.
//!
//! A [`Snapshot`] is a cheap handle to state shared by every client, vault
//! and store handle obtained from it. All access goes through one
//! per-snapshot `RwLock`; mutations take the write lock.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::access::NetworkConfig;
use crate::client::Client;
use crate::config::{EngineConfig, KeyParams, SnapshotFile};
use crate::record::SnapshotState;
use crate::session::{ListenerToken, Listeners, PasswordSession, Status, StatusEvent};
use bastion_common::{ClientId, Error, Result};
use bastion_storage::SnapshotProvider;

/// Read access to a loaded, unlocked snapshot.
pub(crate) struct View<'a> {
    pub state: &'a SnapshotState,
    pub network: &'a NetworkConfig,
}

/// Write access to a loaded, unlocked snapshot.
pub(crate) struct ViewMut<'a> {
    pub state: &'a mut SnapshotState,
    pub network: &'a NetworkConfig,
}

struct SnapshotInner {
    /// `None` once unloaded.
    state: Option<SnapshotState>,
    session: PasswordSession,
    keys: KeyParams,
    created_at: DateTime<Utc>,
    network: NetworkConfig,
}

impl SnapshotInner {
    fn ensure_loaded(&self, path: &Path) -> Result<()> {
        if self.state.is_none() {
            return Err(not_loaded(path));
        }
        Ok(())
    }
}

struct Shared {
    path: PathBuf,
    provider: Arc<dyn SnapshotProvider>,
    inner: RwLock<SnapshotInner>,
    listeners: Listeners,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }
}

/// Handle to a loaded snapshot.
#[derive(Clone)]
pub struct Snapshot {
    shared: Arc<Shared>,
}

impl Snapshot {
    /// Load the snapshot at `path`, or start an empty one if no file exists.
    ///
    /// # Errors
    /// - `Authentication` for a wrong password or a tampered file
    /// - I/O or format errors from the provider
    pub(crate) async fn load(
        provider: Arc<dyn SnapshotProvider>,
        path: &Path,
        password: &[u8],
        config: &EngineConfig,
    ) -> Result<Self> {
        let (state, key, keys, created_at) = if provider.exists(path).await? {
            let bytes = provider.read(path).await?;
            let file = SnapshotFile::from_bytes(&bytes)?;
            let (state, key, keys) = file.open(password)?;
            info!(
                path = %path.display(),
                provider = provider.name(),
                clients = state.clients.len(),
                "Snapshot loaded"
            );
            (state, key, keys, file.created_at)
        } else {
            let (key, keys) = KeyParams::generate(password, config.kdf_params.clone())?;
            info!(
                path = %path.display(),
                provider = provider.name(),
                "Initialized empty snapshot"
            );
            (SnapshotState::default(), key, keys, Utc::now())
        };

        let session = PasswordSession::new(key, config.password_clear_interval);
        let deadline = session.deadline();
        let snapshot = Self {
            shared: Arc::new(Shared {
                path: path.to_path_buf(),
                provider,
                inner: RwLock::new(SnapshotInner {
                    state: Some(state),
                    session,
                    keys,
                    created_at,
                    network: NetworkConfig::default(),
                }),
                listeners: Listeners::default(),
                timer: Mutex::new(None),
            }),
        };
        snapshot.schedule_clear(deadline);

        Ok(snapshot)
    }

    /// Path the snapshot was loaded from.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Check whether the snapshot is still loaded.
    pub async fn is_loaded(&self) -> bool {
        self.shared.inner.read().await.state.is_some()
    }

    /// Run `f` with read access.
    ///
    /// # Errors
    /// - `NotFound` after unload
    /// - `Locked` once the key is cleared
    pub(crate) async fn read<T>(&self, f: impl FnOnce(View<'_>) -> Result<T>) -> Result<T> {
        let inner = self.shared.inner.read().await;
        let state = inner.state.as_ref().ok_or_else(|| not_loaded(self.path()))?;
        inner.session.ensure_unlocked()?;
        f(View {
            state,
            network: &inner.network,
        })
    }

    /// Run `f` with write access.
    pub(crate) async fn write<T>(&self, f: impl FnOnce(ViewMut<'_>) -> Result<T>) -> Result<T> {
        let mut inner = self.write_unlocked().await?;
        let SnapshotInner { state, network, .. } = &mut *inner;
        let state = state.as_mut().ok_or_else(|| not_loaded(&self.shared.path))?;
        f(ViewMut { state, network })
    }

    /// Take the write lock, failing if unloaded or locked. Clears an expired
    /// key on the way.
    async fn write_unlocked(&self) -> Result<RwLockWriteGuard<'_, SnapshotInner>> {
        let mut inner = self.shared.inner.write().await;
        inner.ensure_loaded(self.path())?;
        if inner.session.expire_if_due() {
            drop(inner);
            info!(path = %self.path().display(), "Snapshot locked after password clear interval");
            self.notify(Status::Locked);
            return Err(Error::Locked);
        }
        inner.session.ensure_unlocked()?;
        Ok(inner)
    }

    /// Current lock status.
    ///
    /// # Errors
    /// - `NotFound` after unload
    pub async fn status(&self) -> Result<Status> {
        {
            let inner = self.shared.inner.read().await;
            inner.ensure_loaded(self.path())?;
            if !inner.session.is_expired() {
                return Ok(inner.session.status());
            }
        }
        self.expire().await;
        Ok(Status::Locked)
    }

    /// Clear the cached key now.
    pub async fn lock(&self) -> Result<()> {
        let mut inner = self.shared.inner.write().await;
        inner.ensure_loaded(self.path())?;
        let locked = inner.session.lock();
        drop(inner);

        self.schedule_clear(None);
        if locked {
            info!(path = %self.path().display(), "Snapshot locked");
            self.notify(Status::Locked);
        }
        Ok(())
    }

    /// Clear the cached key `interval` from now. A zero interval locks at
    /// once.
    pub async fn set_password_clear_interval(&self, interval: Duration) -> Result<()> {
        let mut inner = self.shared.inner.write().await;
        inner.ensure_loaded(self.path())?;
        let locked = inner.session.set_interval(interval);
        let deadline = inner.session.deadline();
        drop(inner);

        debug!(path = %self.path().display(), ?interval, "Password clear interval set");
        self.schedule_clear(deadline);
        if locked {
            info!(path = %self.path().display(), "Snapshot locked");
            self.notify(Status::Locked);
        }
        Ok(())
    }

    /// Keep the key cached until unload or an explicit lock.
    pub async fn disable_password_clear(&self) -> Result<()> {
        let mut inner = self.shared.inner.write().await;
        inner.ensure_loaded(self.path())?;
        inner.session.disable_clear();
        drop(inner);

        self.schedule_clear(None);
        Ok(())
    }

    /// Re-derive the key from `password` and cache it again.
    ///
    /// # Errors
    /// - `Authentication` if the password is wrong; nothing changes
    pub async fn reload(&self, password: &[u8]) -> Result<()> {
        let mut inner = self.shared.inner.write().await;
        inner.ensure_loaded(self.path())?;
        let key = inner.keys.verify(password)?;
        let unlocked = inner.session.unlock(key);
        let status = inner.session.status();
        let deadline = inner.session.deadline();
        drop(inner);

        self.schedule_clear(deadline);
        if unlocked {
            info!(path = %self.path().display(), "Snapshot unlocked");
            self.notify(status);
        }
        Ok(())
    }

    /// Persist the snapshot under its current password.
    ///
    /// Expired store entries are dropped first. The file is replaced
    /// atomically.
    pub async fn save(&self) -> Result<()> {
        let mut inner = self.write_unlocked().await?;
        let purged = inner
            .state
            .as_mut()
            .map(|s| s.purge_expired(Utc::now()))
            .unwrap_or(0);
        if purged > 0 {
            debug!(purged, "Evicted expired store entries");
        }

        let inner = inner.downgrade();
        let state = inner.state.as_ref().ok_or_else(|| not_loaded(self.path()))?;
        let key = inner.session.key()?;
        let file = SnapshotFile::seal(state, key, &inner.keys, inner.created_at)?;
        let metadata = self
            .shared
            .provider
            .write_atomic(self.path(), file.to_bytes()?)
            .await?;

        info!(path = %self.path().display(), size = metadata.size, "Snapshot saved");
        Ok(())
    }

    /// Persist the snapshot under a new password and switch to it.
    ///
    /// The running session keeps its deadline.
    pub async fn save_with_password(&self, new_password: &[u8]) -> Result<()> {
        let mut inner = self.write_unlocked().await?;
        let (key, keys) = KeyParams::generate(new_password, inner.keys.kdf_params.clone())?;

        let created_at = inner.created_at;
        let state = inner.state.as_mut().ok_or_else(|| not_loaded(&self.shared.path))?;
        state.purge_expired(Utc::now());
        let file = SnapshotFile::seal(state, &key, &keys, created_at)?;
        self.shared
            .provider
            .write_atomic(self.path(), file.to_bytes()?)
            .await?;

        inner.keys = keys;
        inner.session.rekey(key);
        info!(path = %self.path().display(), "Snapshot password changed");
        Ok(())
    }

    /// Drop all in-memory state. Handles fail with `NotFound` afterwards.
    pub async fn unload(&self) -> Result<()> {
        let mut inner = self.shared.inner.write().await;
        let state = inner.state.take().ok_or_else(|| not_loaded(self.path()))?;
        let was_unlocked = inner.session.lock();
        // vault keys and store values zeroize on drop
        drop(state);
        drop(inner);

        self.schedule_clear(None);
        info!(path = %self.path().display(), "Snapshot unloaded");
        if was_unlocked {
            self.notify(Status::Locked);
        }
        Ok(())
    }

    /// Register a listener for lock status changes.
    pub fn subscribe(
        &self,
        listener: impl Fn(&StatusEvent) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.shared.listeners.subscribe(Arc::new(listener))
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, token: ListenerToken) -> bool {
        self.shared.listeners.unsubscribe(token)
    }

    /// Create an empty client.
    ///
    /// # Errors
    /// - `InvalidParameter` if the client already exists
    pub async fn create_client(&self, id: impl Into<ClientId>) -> Result<Client> {
        let id = id.into();
        self.write(|view| {
            if view.state.clients.contains_key(&id) {
                return Err(Error::InvalidParameter(format!(
                    "Client already exists: {}",
                    id
                )));
            }
            view.state.clients.insert(id.clone(), Default::default());
            Ok(())
        })
        .await?;

        info!(path = %self.path().display(), client = %id, "Client created");
        Ok(Client::new(self.clone(), id))
    }

    /// Get a handle to an existing client.
    ///
    /// # Errors
    /// - `NotFound` if the client does not exist
    pub async fn load_client(&self, id: impl Into<ClientId>) -> Result<Client> {
        let id = id.into();
        self.read(|view| view.state.client(&id).map(|_| ())).await?;
        Ok(Client::new(self.clone(), id))
    }

    /// Delete a client with all its vaults and store entries.
    pub async fn remove_client(&self, id: impl Into<ClientId>) -> Result<()> {
        let id = id.into();
        self.write(|view| {
            view.state
                .clients
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("Client not found: {}", id)))
        })
        .await?;

        info!(path = %self.path().display(), client = %id, "Client removed");
        Ok(())
    }

    /// Ids of all clients.
    pub async fn client_ids(&self) -> Result<Vec<ClientId>> {
        self.read(|view| Ok(view.state.clients.keys().cloned().collect()))
            .await
    }

    /// Current network settings and peer rules.
    pub async fn network_config(&self) -> NetworkConfig {
        self.shared.inner.read().await.network.clone()
    }

    /// Update network settings and peer rules.
    pub async fn configure_network(&self, f: impl FnOnce(&mut NetworkConfig)) {
        f(&mut self.shared.inner.write().await.network);
    }

    /// Clear an expired key, if it is still cached.
    async fn expire(&self) {
        let mut inner = self.shared.inner.write().await;
        let locked = inner.session.expire_if_due();
        drop(inner);

        if locked {
            info!(path = %self.path().display(), "Snapshot locked after password clear interval");
            self.notify(Status::Locked);
        }
    }

    /// Replace the pending clear task.
    fn schedule_clear(&self, deadline: Option<Instant>) {
        let mut timer = match self.shared.timer.lock() {
            Ok(timer) => timer,
            Err(poisoned) => {
                warn!("Password clear timer lock poisoned");
                poisoned.into_inner()
            }
        };
        if let Some(handle) = timer.take() {
            handle.abort();
        }

        if let Some(deadline) = deadline {
            let shared: Weak<Shared> = Arc::downgrade(&self.shared);
            *timer = Some(tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(shared) = shared.upgrade() {
                    Snapshot { shared }.expire().await;
                }
            }));
        }
    }

    fn notify(&self, status: Status) {
        self.shared.listeners.notify(&StatusEvent {
            snapshot_path: self.shared.path.clone(),
            status,
        });
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("path", &self.shared.path)
            .finish_non_exhaustive()
    }
}

fn not_loaded(path: &Path) -> Error {
    Error::NotFound(format!("Snapshot not loaded: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_crypto::KdfParams;
    use bastion_storage::MemoryProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> EngineConfig {
        EngineConfig::default().with_kdf_params(KdfParams::minimal())
    }

    async fn load(provider: &MemoryProvider, password: &[u8]) -> Result<Snapshot> {
        Snapshot::load(
            Arc::new(provider.clone()),
            Path::new("/test.snapshot"),
            password,
            &config(),
        )
        .await
    }

    #[tokio::test]
    async fn test_new_snapshot_is_unlocked_and_empty() {
        let provider = MemoryProvider::new();
        let snapshot = load(&provider, b"pw").await.unwrap();

        assert_eq!(
            snapshot.status().await.unwrap(),
            Status::Unlocked { remaining: None }
        );
        assert!(snapshot.client_ids().await.unwrap().is_empty());
        assert!(!provider.exists(Path::new("/test.snapshot")).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_and_reload_from_provider() {
        let provider = MemoryProvider::new();
        let snapshot = load(&provider, b"pw").await.unwrap();
        snapshot.create_client("alice").await.unwrap();
        snapshot.save().await.unwrap();

        let reopened = load(&provider, b"pw").await.unwrap();
        assert_eq!(
            reopened.client_ids().await.unwrap(),
            vec![ClientId::from("alice")]
        );
        assert!(matches!(
            load(&provider, b"nope").await,
            Err(Error::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_interval_locks_and_reload_unlocks() {
        let provider = MemoryProvider::new();
        let snapshot = load(&provider, b"pw").await.unwrap();
        snapshot.create_client("c").await.unwrap();

        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        snapshot.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        snapshot
            .set_password_clear_interval(Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(snapshot.status().await.unwrap(), Status::Locked);
        assert!(matches!(snapshot.save().await, Err(Error::Locked)));
        assert!(matches!(
            snapshot.load_client("c").await,
            Err(Error::Locked)
        ));

        assert!(matches!(
            snapshot.reload(b"bad").await,
            Err(Error::Authentication(_))
        ));
        assert_eq!(snapshot.status().await.unwrap(), Status::Locked);

        snapshot.reload(b"pw").await.unwrap();
        assert!(snapshot.load_client("c").await.is_ok());
        assert_eq!(events.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_locks_after_interval() {
        let provider = MemoryProvider::new();
        let snapshot = load(&provider, b"pw").await.unwrap();
        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        snapshot.subscribe(move |event| {
            if event.status.is_locked() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        snapshot
            .set_password_clear_interval(Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot.status().await.unwrap(), Status::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_password_clear_keeps_key() {
        let provider = MemoryProvider::new();
        let snapshot = load(&provider, b"pw").await.unwrap();
        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        snapshot.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        snapshot
            .set_password_clear_interval(Duration::from_secs(10))
            .await
            .unwrap();
        snapshot.disable_password_clear().await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(
            snapshot.status().await.unwrap(),
            Status::Unlocked { remaining: None }
        );
        assert_eq!(events.load(Ordering::SeqCst), 0);
        snapshot.create_client("c").await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_with_empty_password_fails_authentication() {
        let provider = MemoryProvider::new();
        let snapshot = load(&provider, b"pw").await.unwrap();
        snapshot.save().await.unwrap();

        assert!(matches!(
            snapshot.reload(b"").await,
            Err(Error::Authentication(_))
        ));
        assert!(matches!(
            load(&provider, b"").await,
            Err(Error::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_unload_invalidates_handles() {
        let provider = MemoryProvider::new();
        let snapshot = load(&provider, b"pw").await.unwrap();
        let client = snapshot.create_client("c").await.unwrap();

        snapshot.unload().await.unwrap();
        assert!(!snapshot.is_loaded().await);
        assert!(matches!(
            client.store().get("k").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(snapshot.status().await, Err(Error::NotFound(_))));
        assert!(matches!(snapshot.unload().await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_save_with_password_rotates() {
        let provider = MemoryProvider::new();
        let snapshot = load(&provider, b"old").await.unwrap();
        snapshot.create_client("c").await.unwrap();
        snapshot.save_with_password(b"new").await.unwrap();

        assert!(matches!(
            snapshot.reload(b"old").await,
            Err(Error::Authentication(_))
        ));
        snapshot.reload(b"new").await.unwrap();
        assert!(load(&provider, b"new").await.is_ok());
        assert!(matches!(
            load(&provider, b"old").await,
            Err(Error::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_file_and_password() {
        let provider = MemoryProvider::new();
        let snapshot = load(&provider, b"old").await.unwrap();
        snapshot.save().await.unwrap();

        provider.set_fail_writes(true);
        assert!(snapshot.save_with_password(b"new").await.is_err());
        provider.set_fail_writes(false);

        snapshot.reload(b"old").await.unwrap();
        assert!(load(&provider, b"old").await.is_ok());
    }

    #[tokio::test]
    async fn test_create_client_twice_fails() {
        let provider = MemoryProvider::new();
        let snapshot = load(&provider, b"pw").await.unwrap();
        snapshot.create_client("c").await.unwrap();

        assert!(matches!(
            snapshot.create_client("c").await,
            Err(Error::InvalidParameter(_))
        ));
        snapshot.remove_client("c").await.unwrap();
        assert!(matches!(
            snapshot.load_client("c").await,
            Err(Error::NotFound(_))
        ));
    }
}
