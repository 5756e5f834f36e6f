//! Snapshot file format and engine configuration.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use zeroize::Zeroizing;

use crate::record::SnapshotState;
use bastion_common::{Error, Result};
use bastion_crypto::{
    decrypt, decrypt_with_aad, derive_key, encrypt, encrypt_with_aad, KdfParams, Salt,
    SnapshotKey,
};

const KEY_VERIFICATION_PLAINTEXT: &[u8] = b"BASTION_SNAPSHOT_KEY_V1";

/// Snapshot format version for migration support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotVersion {
    pub major: u32,
    pub minor: u32,
}

impl SnapshotVersion {
    /// Current snapshot format version.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Check if this version is compatible with the current version.
    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major
    }

    /// Associated data binding the payload to its format version.
    fn aad(&self) -> Vec<u8> {
        format!("bastion-snapshot-{}.{}", self.major, self.minor).into_bytes()
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// On-disk snapshot envelope.
///
/// Everything except `payload` is public metadata needed to re-derive the
/// key. The payload is the encrypted JSON state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotFile {
    pub version: SnapshotVersion,
    pub salt: Salt,
    pub kdf_params: KdfParams,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Known constant encrypted under the snapshot key.
    key_verification: String,
    payload: String,
}

/// Public parameters needed to re-derive and check a snapshot key.
#[derive(Debug, Clone)]
pub(crate) struct KeyParams {
    pub salt: Salt,
    pub kdf_params: KdfParams,
    /// Known constant encrypted under the key.
    pub verification: Vec<u8>,
}

impl KeyParams {
    /// Derive a key for `password` under a fresh salt.
    pub fn generate(password: &[u8], kdf_params: KdfParams) -> Result<(SnapshotKey, Self)> {
        let salt = Salt::generate();
        let key = derive_key(password, &salt, &kdf_params)?;
        let verification = encrypt(key.as_bytes(), KEY_VERIFICATION_PLAINTEXT)?;
        Ok((
            key,
            Self {
                salt,
                kdf_params,
                verification,
            },
        ))
    }

    /// Derive the key for `password` and check it against the
    /// verification blob.
    ///
    /// # Errors
    /// - `Authentication` if the password is wrong
    pub fn verify(&self, password: &[u8]) -> Result<SnapshotKey> {
        // no snapshot is ever keyed by an empty password
        if password.is_empty() {
            return Err(invalid_password());
        }
        let key = derive_key(password, &self.salt, &self.kdf_params)?;
        match decrypt(key.as_bytes(), &self.verification) {
            Ok(plaintext) if plaintext == KEY_VERIFICATION_PLAINTEXT => Ok(key),
            _ => Err(invalid_password()),
        }
    }
}

fn invalid_password() -> Error {
    Error::Authentication("Invalid password".to_string())
}

impl SnapshotFile {
    /// Encrypt `state` into a new envelope.
    pub fn seal(
        state: &SnapshotState,
        key: &SnapshotKey,
        params: &KeyParams,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let version = SnapshotVersion::CURRENT;
        let plaintext = Zeroizing::new(
            serde_json::to_vec(state).map_err(|e| Error::Serialization(e.to_string()))?,
        );
        let payload = encrypt_with_aad(key.as_bytes(), &plaintext, &version.aad())?;

        Ok(Self {
            version,
            salt: params.salt.clone(),
            kdf_params: params.kdf_params.clone(),
            created_at,
            modified_at: Utc::now(),
            key_verification: STANDARD.encode(&params.verification),
            payload: STANDARD.encode(payload),
        })
    }

    /// Check the password and decrypt the state.
    ///
    /// # Errors
    /// - `InvalidParameter` for an incompatible version
    /// - `Authentication` for a wrong password or a tampered payload
    pub fn open(&self, password: &[u8]) -> Result<(SnapshotState, SnapshotKey, KeyParams)> {
        if !self.version.is_compatible() {
            return Err(Error::InvalidParameter(format!(
                "Incompatible snapshot version: {}.{}",
                self.version.major, self.version.minor
            )));
        }

        let params = KeyParams {
            salt: self.salt.clone(),
            kdf_params: self.kdf_params.clone(),
            verification: self.decode(&self.key_verification)?,
        };
        let key = params.verify(password)?;

        let payload = self.decode(&self.payload)?;
        let plaintext = Zeroizing::new(
            decrypt_with_aad(key.as_bytes(), &payload, &self.version.aad()).map_err(|_| {
                Error::Authentication("Snapshot integrity check failed".to_string())
            })?,
        );
        let state: SnapshotState =
            serde_json::from_slice(&plaintext).map_err(|e| Error::Serialization(e.to_string()))?;

        Ok((state, key, params))
    }

    fn decode(&self, field: &str) -> Result<Vec<u8>> {
        STANDARD
            .decode(field)
            .map_err(|e| Error::Serialization(format!("Invalid snapshot encoding: {}", e)))
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Settings applied to every snapshot a manager loads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Argon2id parameters for newly created snapshots and password
    /// changes. Existing snapshots keep the parameters they were written
    /// with.
    pub kdf_params: KdfParams,
    /// Clear the cached key this long after load. `None` keeps it until
    /// unload.
    pub password_clear_interval: Option<Duration>,
}

impl EngineConfig {
    pub fn with_kdf_params(mut self, kdf_params: KdfParams) -> Self {
        self.kdf_params = kdf_params;
        self
    }

    pub fn with_password_clear_interval(mut self, interval: Duration) -> Self {
        self.password_clear_interval = Some(interval);
        self
    }
}
