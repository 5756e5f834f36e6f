//! Record store: clients, vaults, encrypted records and the plaintext store.
//!
//! Records are kept encrypted in memory under a random per-vault key and are
//! only decrypted inside the crate, into zeroizing buffers, when a procedure
//! needs them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use bastion_common::{
    ClientFlags, ClientId, Error, Location, RecordHint, RecordPath, Result, StoreKey, VaultPath,
};
use bastion_crypto::{decrypt_with_aad, digest_id, encrypt_with_aad, VaultKey};

const GENERIC_DOMAIN: &[u8] = b"bastion.record.generic";
const COUNTER_DOMAIN: &[u8] = b"bastion.record.counter";

/// Content-addressed record identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId([u8; 32]);

impl RecordId {
    /// Id of a record addressed by path.
    pub fn generic(vault_path: &VaultPath, record_path: &RecordPath) -> Self {
        Self(digest_id(
            GENERIC_DOMAIN,
            &[vault_path.as_bytes(), record_path.as_bytes()],
        ))
    }

    /// Id of a record addressed by counter.
    pub fn counter(vault_path: &VaultPath, counter: u64) -> Self {
        Self(digest_id(
            COUNTER_DOMAIN,
            &[vault_path.as_bytes(), &counter.to_be_bytes()],
        ))
    }

    /// Id of an existing record.
    ///
    /// # Errors
    /// - `InvalidParameter` for a counter location without a counter
    pub fn for_location(location: &Location) -> Result<Self> {
        match location {
            Location::Generic {
                vault_path,
                record_path,
            } => Ok(Self::generic(vault_path, record_path)),
            Location::Counter {
                vault_path,
                counter: Some(counter),
            } => Ok(Self::counter(vault_path, *counter)),
            Location::Counter { counter: None, .. } => Err(Error::InvalidParameter(
                "Counter location needs an explicit counter here".to_string(),
            )),
        }
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let mut id = [0u8; 32];
        hex::decode_to_slice(&encoded, &mut id).map_err(serde::de::Error::custom)?;
        Ok(Self(id))
    }
}

/// What kind of secret a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// Caller-supplied bytes.
    Opaque,
    /// Seed from SLIP-0010 generation or BIP-0039.
    Seed,
    /// SLIP-0010 extended key: private key followed by chain code.
    ExtendedKey,
    /// Raw 32-byte ed25519 private key.
    Ed25519Key,
}

/// Decrypted record content. Zeroized on drop.
pub(crate) struct Secret {
    pub kind: RecordKind,
    pub bytes: Zeroizing<Vec<u8>>,
}

#[derive(Clone, Serialize, Deserialize)]
struct Record {
    hint: RecordHint,
    kind: RecordKind,
    #[serde(with = "b64")]
    ciphertext: Vec<u8>,
    revoked: bool,
}

/// One vault: a key plus its records.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct VaultState {
    key: VaultKey,
    records: BTreeMap<RecordId, Record>,
    /// High-water mark for counter locations; never decreases.
    next_counter: u64,
}

impl VaultState {
    fn new() -> Self {
        Self {
            key: VaultKey::generate(),
            records: BTreeMap::new(),
            next_counter: 0,
        }
    }

    /// Resolve a write target without committing a counter.
    ///
    /// A counter is only handed out if it leaves a successor for the
    /// high-water mark, so `u64::MAX` is never written.
    fn target(
        &self,
        vault_path: &VaultPath,
        location: &Location,
    ) -> Result<(RecordId, Option<u64>)> {
        match location {
            Location::Generic { record_path, .. } => {
                Ok((RecordId::generic(vault_path, record_path), None))
            }
            Location::Counter { counter, .. } => {
                let counter = counter.unwrap_or(self.next_counter);
                if counter.checked_add(1).is_none() {
                    return Err(Error::InvalidParameter(
                        "Vault counters exhausted".to_string(),
                    ));
                }
                Ok((RecordId::counter(vault_path, counter), Some(counter)))
            }
        }
    }

    fn is_live(&self, id: &RecordId) -> bool {
        self.records.get(id).is_some_and(|r| !r.revoked)
    }

    fn write(
        &mut self,
        vault_path: &VaultPath,
        location: &Location,
        secret: &[u8],
        hint: RecordHint,
        kind: RecordKind,
    ) -> Result<(RecordId, Option<u64>)> {
        let (id, counter) = self.target(vault_path, location)?;
        let ciphertext = encrypt_with_aad(self.key.as_bytes(), secret, id.as_bytes())?;

        self.records.insert(
            id,
            Record {
                hint,
                kind,
                ciphertext,
                revoked: false,
            },
        );
        if let Some(counter) = counter {
            self.next_counter = self.next_counter.max(counter + 1);
        }

        Ok((id, counter))
    }

    fn read(&self, id: &RecordId) -> Option<Result<Secret>> {
        let record = self.records.get(id).filter(|r| !r.revoked)?;
        Some(
            decrypt_with_aad(self.key.as_bytes(), &record.ciphertext, id.as_bytes()).map(
                |plaintext| Secret {
                    kind: record.kind,
                    bytes: Zeroizing::new(plaintext),
                },
            ),
        )
    }

    fn garbage_collect(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.revoked);
        before - self.records.len()
    }

    fn hints(&self) -> Vec<(RecordId, RecordHint)> {
        self.records
            .iter()
            .filter(|(_, r)| !r.revoked)
            .map(|(id, r)| (*id, r.hint))
            .collect()
    }
}

/// A plaintext store entry.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoreEntry {
    #[serde(with = "b64")]
    value: Vec<u8>,
    #[zeroize(skip)]
    expires_at: Option<DateTime<Utc>>,
}

impl StoreEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Everything a single client owns.
#[derive(Clone, Default, Serialize, Deserialize)]
pub(crate) struct ClientState {
    #[serde(default)]
    flags: ClientFlags,
    vaults: BTreeMap<VaultPath, VaultState>,
    store: BTreeMap<StoreKey, StoreEntry>,
}

impl ClientState {
    pub fn flags(&self) -> ClientFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: ClientFlags) {
        self.flags = flags;
    }

    pub fn has_vault(&self, vault_path: &VaultPath) -> bool {
        self.vaults.contains_key(vault_path)
    }

    pub fn vault_paths(&self) -> impl Iterator<Item = &VaultPath> {
        self.vaults.keys()
    }

    fn vault(&self, vault_path: &VaultPath) -> Result<&VaultState> {
        self.vaults
            .get(vault_path)
            .ok_or_else(|| Error::NotFound(format!("Vault not found: {}", vault_path)))
    }

    fn vault_mut(&mut self, vault_path: &VaultPath) -> Result<&mut VaultState> {
        self.vaults
            .get_mut(vault_path)
            .ok_or_else(|| Error::NotFound(format!("Vault not found: {}", vault_path)))
    }

    /// Write a secret, creating the vault if needed.
    ///
    /// Returns the counter used for counter locations.
    pub fn write(
        &mut self,
        location: &Location,
        secret: &[u8],
        hint: RecordHint,
        kind: RecordKind,
    ) -> Result<Option<u64>> {
        let vault_path = location.vault_path();
        let created = !self.vaults.contains_key(vault_path);
        let vault = self
            .vaults
            .entry(vault_path.clone())
            .or_insert_with(VaultState::new);
        match vault.write(vault_path, location, secret, hint, kind) {
            Ok((_, counter)) => Ok(counter),
            Err(e) => {
                if created {
                    self.vaults.remove(vault_path);
                }
                Err(e)
            }
        }
    }

    /// Check whether `location` holds a live record.
    ///
    /// A counter location without a counter never does.
    pub fn contains_record(&self, location: &Location) -> bool {
        let Ok(id) = RecordId::for_location(location) else {
            return false;
        };
        self.vaults
            .get(location.vault_path())
            .is_some_and(|v| v.is_live(&id))
    }

    /// Decrypt the record at `location`.
    ///
    /// # Errors
    /// - `NotFound` if the vault or a live record is missing
    pub fn read_secret(&self, location: &Location) -> Result<Secret> {
        let id = RecordId::for_location(location)?;
        self.vault(location.vault_path())?
            .read(&id)
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}", location)))?
    }

    /// Revoke the record at `location`; with `gc` also purge the vault's
    /// tombstones.
    pub fn remove(&mut self, location: &Location, gc: bool) -> Result<()> {
        let id = RecordId::for_location(location)?;
        let vault = self.vault_mut(location.vault_path())?;

        let record = vault
            .records
            .get_mut(&id)
            .filter(|r| !r.revoked)
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}", location)))?;
        record.revoked = true;
        record.ciphertext.zeroize();
        record.ciphertext.clear();

        if gc {
            vault.garbage_collect();
        }
        Ok(())
    }

    pub fn garbage_collect(&mut self, vault_path: &VaultPath) -> Result<usize> {
        Ok(self.vault_mut(vault_path)?.garbage_collect())
    }

    pub fn list_hints(&self, vault_path: &VaultPath) -> Result<Vec<(RecordId, RecordHint)>> {
        Ok(self.vault(vault_path)?.hints())
    }

    /// Next counter a `None` counter location would be assigned.
    pub fn next_counter(&self, vault_path: &VaultPath) -> u64 {
        self.vaults
            .get(vault_path)
            .map(|v| v.next_counter)
            .unwrap_or(0)
    }

    pub fn store_get(&self, key: &StoreKey, now: DateTime<Utc>) -> Option<Vec<u8>> {
        self.store
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone())
    }

    pub fn store_insert(
        &mut self,
        key: StoreKey,
        value: Vec<u8>,
        lifetime: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let expires_at = lifetime
            .map(|l| {
                chrono::Duration::from_std(l)
                    .ok()
                    .and_then(|l| now.checked_add_signed(l))
                    .ok_or_else(|| {
                        Error::InvalidParameter("Store lifetime out of range".to_string())
                    })
            })
            .transpose()?;

        self.purge_expired(now);
        self.store.insert(key, StoreEntry { value, expires_at });
        Ok(())
    }

    pub fn store_remove(&mut self, key: &StoreKey, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let entry = self.store.remove(key)?;
        (!entry.is_expired(now)).then(|| entry.value.clone())
    }

    /// Drop expired store entries. Returns how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.store.len();
        self.store.retain(|_, e| !e.is_expired(now));
        before - self.store.len()
    }
}

/// Complete decrypted content of a snapshot.
#[derive(Clone, Default, Serialize, Deserialize)]
pub(crate) struct SnapshotState {
    pub clients: BTreeMap<ClientId, ClientState>,
}

impl SnapshotState {
    pub fn client(&self, id: &ClientId) -> Result<&ClientState> {
        self.clients
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Client not found: {}", id)))
    }

    pub fn client_mut(&mut self, id: &ClientId) -> Result<&mut ClientState> {
        self.clients
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Client not found: {}", id)))
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        self.clients
            .values_mut()
            .map(|c| c.purge_expired(now))
            .sum()
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(STANDARD.encode(bytes));
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
