//! SLIP-0010 hierarchical key derivation over ed25519.
//!
//! Only hardened derivation exists for ed25519; every index in a [`Chain`]
//! is hardened before use.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use bastion_common::{Error, Result};

type HmacSha512 = Hmac<Sha512>;

/// Bit marking a hardened child index.
pub const HARDENED: u32 = 0x8000_0000;

/// HMAC key for the ed25519 master node.
const ED25519_SEED_KEY: &[u8] = b"ed25519 seed";

/// Serialized extended key: secret key followed by chain code.
pub const EXTENDED_KEY_LENGTH: usize = 64;

/// Minimum seed length accepted for master key generation.
pub const MIN_SEED_LENGTH: usize = 16;

/// Derivation path as a list of child indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Chain(Vec<u32>);

impl Chain {
    /// Empty chain, selecting the master node.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build a chain from indices. Each one is hardened when used.
    pub fn from_u32_hardened(indices: impl IntoIterator<Item = u32>) -> Self {
        Self(indices.into_iter().collect())
    }

    /// Raw indices as supplied.
    pub fn indices(&self) -> &[u32] {
        &self.0
    }

    /// Number of derivation steps.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for index in &self.0 {
            write!(f, "/{}'", index & !HARDENED)?;
        }
        Ok(())
    }
}

/// Extended ed25519 private key: secret scalar seed plus chain code.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExtendedKey {
    secret_key: [u8; 32],
    chain_code: [u8; 32],
}

impl ExtendedKey {
    /// Derive the master node from a seed.
    ///
    /// # Errors
    /// - Returns error if the seed is shorter than 16 bytes
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        if seed.len() < MIN_SEED_LENGTH {
            return Err(Error::InvalidParameter(format!(
                "Seed must be at least {} bytes",
                MIN_SEED_LENGTH
            )));
        }
        let digest = hmac_sha512(ED25519_SEED_KEY, &[seed])?;
        Ok(Self::split(&digest[..]))
    }

    /// Restore from the 64-byte serialized form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != EXTENDED_KEY_LENGTH {
            return Err(Error::WrongKeyType(format!(
                "Extended key must be {} bytes, got {}",
                EXTENDED_KEY_LENGTH,
                bytes.len()
            )));
        }
        Ok(Self::split(bytes))
    }

    /// Serialize as secret key followed by chain code.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(EXTENDED_KEY_LENGTH));
        bytes.extend_from_slice(&self.secret_key);
        bytes.extend_from_slice(&self.chain_code);
        bytes
    }

    /// The 32-byte ed25519 secret key.
    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret_key
    }

    /// The chain code.
    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    /// Derive a hardened child.
    pub fn derive_child(&self, index: u32) -> Result<Self> {
        let hardened = (index | HARDENED).to_be_bytes();
        let digest = hmac_sha512(&self.chain_code, &[&[0u8][..], &self.secret_key[..], &hardened[..]])?;
        Ok(Self::split(&digest[..]))
    }

    /// Follow every index of `chain` from this node.
    pub fn derive(&self, chain: &Chain) -> Result<Self> {
        let mut current = self.clone();
        for index in chain.indices() {
            current = current.derive_child(*index)?;
        }
        Ok(current)
    }

    fn split(bytes: &[u8]) -> Self {
        let mut secret_key = [0u8; 32];
        let mut chain_code = [0u8; 32];
        secret_key.copy_from_slice(&bytes[..32]);
        chain_code.copy_from_slice(&bytes[32..64]);
        Self {
            secret_key,
            chain_code,
        }
    }
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtendedKey([REDACTED])")
    }
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> Result<Zeroizing<[u8; 64]>> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("HMAC key rejected: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}
