//! Client, vault and store handles.
//!
//! Handles hold a snapshot reference plus identifiers. Every call re-checks
//! that the snapshot is loaded and unlocked and that the client still
//! exists.

use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

use crate::procedures::{self, Procedure, ProcedureOutput};
use crate::record::{ClientState, RecordId, RecordKind};
use crate::snapshot::Snapshot;
use bastion_common::{
    ClientFlags, ClientId, Location, RecordHint, RecordPath, Result, StoreKey, VaultPath,
};

/// Handle to one client inside a snapshot.
#[derive(Debug, Clone)]
pub struct Client {
    snapshot: Snapshot,
    id: ClientId,
}

impl Client {
    pub(crate) fn new(snapshot: Snapshot, id: ClientId) -> Self {
        Self { snapshot, id }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Handle to the vault at `vault_path`. The vault need not exist yet.
    pub fn vault(&self, vault_path: impl Into<VaultPath>) -> Vault {
        Vault {
            client: self.clone(),
            path: vault_path.into(),
        }
    }

    /// Handle to the client's store.
    pub fn store(&self) -> Store {
        Store {
            client: self.clone(),
        }
    }

    async fn read<T>(&self, f: impl FnOnce(&ClientState) -> Result<T>) -> Result<T> {
        self.snapshot
            .read(|view| f(view.state.client(&self.id)?))
            .await
    }

    async fn write<T>(&self, f: impl FnOnce(&mut ClientState) -> Result<T>) -> Result<T> {
        self.snapshot
            .write(|view| f(view.state.client_mut(&self.id)?))
            .await
    }

    pub async fn flags(&self) -> Result<ClientFlags> {
        self.read(|client| Ok(client.flags())).await
    }

    pub async fn set_flags(&self, flags: ClientFlags) -> Result<()> {
        self.write(|client| {
            client.set_flags(flags);
            Ok(())
        })
        .await
    }

    /// Write `secret` at `location`, replacing a live record there.
    ///
    /// Returns the counter assigned for counter locations.
    pub async fn write_secret(
        &self,
        location: &Location,
        secret: impl AsRef<[u8]>,
        hint: RecordHint,
    ) -> Result<Option<u64>> {
        let counter = self
            .write(|client| client.write(location, secret.as_ref(), hint, RecordKind::Opaque))
            .await?;
        debug!(client = %self.id, %location, ?counter, "Secret written");
        Ok(counter)
    }

    /// Revoke the record at `location`. With `gc` the vault's tombstones
    /// are purged as well.
    ///
    /// # Errors
    /// - `NotFound` if no live record is there
    pub async fn remove_secret(&self, location: &Location, gc: bool) -> Result<()> {
        self.write(|client| client.remove(location, gc)).await?;
        debug!(client = %self.id, %location, gc, "Secret removed");
        Ok(())
    }

    pub async fn record_exists(&self, location: &Location) -> Result<bool> {
        self.read(|client| Ok(client.contains_record(location)))
            .await
    }

    pub async fn vault_exists(&self, vault_path: &VaultPath) -> Result<bool> {
        self.read(|client| Ok(client.has_vault(vault_path))).await
    }

    /// Run one procedure.
    pub async fn execute_procedure(&self, procedure: Procedure) -> Result<ProcedureOutput> {
        let mut outputs = self.execute_procedures(vec![procedure]).await?;
        Ok(outputs.pop().unwrap_or(ProcedureOutput::None))
    }

    /// Run procedures in order under one lock. Either all of them take
    /// effect or none does.
    pub async fn execute_procedures(
        &self,
        procedures: Vec<Procedure>,
    ) -> Result<Vec<ProcedureOutput>> {
        let outputs = self
            .write(|client| procedures::execute_all(client, &procedures))
            .await?;
        info!(client = %self.id, count = procedures.len(), "Procedures executed");
        Ok(outputs)
    }
}

/// Handle to one vault of a client.
#[derive(Debug, Clone)]
pub struct Vault {
    client: Client,
    path: VaultPath,
}

impl Vault {
    pub fn path(&self) -> &VaultPath {
        &self.path
    }

    /// Location of `record_path` in this vault.
    pub fn location(&self, record_path: impl Into<RecordPath>) -> Location {
        Location::Generic {
            vault_path: self.path.clone(),
            record_path: record_path.into(),
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        self.client.vault_exists(&self.path).await
    }

    /// Write a secret at `record_path`, creating the vault if needed.
    pub async fn insert(
        &self,
        record_path: impl Into<RecordPath>,
        secret: impl AsRef<[u8]>,
        hint: RecordHint,
    ) -> Result<()> {
        self.client
            .write_secret(&self.location(record_path), secret, hint)
            .await
            .map(|_| ())
    }

    /// Write a secret in a counter slot. `None` takes the next unused
    /// counter. Returns the counter used.
    pub async fn insert_counter(
        &self,
        counter: Option<u64>,
        secret: impl AsRef<[u8]>,
        hint: RecordHint,
    ) -> Result<u64> {
        let location = Location::Counter {
            vault_path: self.path.clone(),
            counter,
        };
        let assigned = self.client.write_secret(&location, secret, hint).await?;
        Ok(assigned.unwrap_or_default())
    }

    pub async fn remove(&self, record_path: impl Into<RecordPath>, gc: bool) -> Result<()> {
        self.client
            .remove_secret(&self.location(record_path), gc)
            .await
    }

    pub async fn remove_counter(&self, counter: u64, gc: bool) -> Result<()> {
        self.client
            .remove_secret(&Location::counter(self.path.clone(), counter), gc)
            .await
    }

    pub async fn check_record(&self, record_path: impl Into<RecordPath>) -> Result<bool> {
        self.client
            .record_exists(&self.location(record_path))
            .await
    }

    /// Ids and hints of all live records.
    pub async fn list_hints(&self) -> Result<Vec<(RecordId, RecordHint)>> {
        self.client
            .read(|client| client.list_hints(&self.path))
            .await
    }

    /// Purge revoked records. Returns how many were removed.
    pub async fn garbage_collect(&self) -> Result<usize> {
        let removed = self
            .client
            .write(|client| client.garbage_collect(&self.path))
            .await?;
        debug!(vault = %self.path, removed, "Vault garbage collected");
        Ok(removed)
    }
}

/// Handle to a client's plaintext key-value store.
#[derive(Debug, Clone)]
pub struct Store {
    client: Client,
}

impl Store {
    /// Value at `key`, or `None` if missing or expired.
    pub async fn get(&self, key: impl Into<StoreKey>) -> Result<Option<Vec<u8>>> {
        let key = key.into();
        self.client
            .read(|client| Ok(client.store_get(&key, Utc::now())))
            .await
    }

    /// Store `value` at `key`. With a `lifetime` the entry disappears once
    /// it elapses.
    pub async fn insert(
        &self,
        key: impl Into<StoreKey>,
        value: Vec<u8>,
        lifetime: Option<Duration>,
    ) -> Result<()> {
        let key = key.into();
        self.client
            .write(|client| client.store_insert(key, value, lifetime, Utc::now()))
            .await
    }

    /// Remove `key`, returning its value if it was present and unexpired.
    pub async fn remove(&self, key: impl Into<StoreKey>) -> Result<Option<Vec<u8>>> {
        let key = key.into();
        self.client
            .write(|client| Ok(client.store_remove(&key, Utc::now())))
            .await
    }
}
