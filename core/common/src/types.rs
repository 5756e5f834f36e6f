//! Common types used throughout Bastion.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Length of a record hint in bytes.
pub const RECORD_HINT_LENGTH: usize = 24;

/// A raw byte identifier.
///
/// Client ids, vault paths, record paths and store keys all live in the
/// same key space: a UTF-8 string and its encoded bytes are the same key.
/// Serialized as base64 text so it can be used as a JSON map key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BytePath(Vec<u8>);

/// Name of a client inside a snapshot.
pub type ClientId = BytePath;

/// Name of a vault inside a client.
pub type VaultPath = BytePath;

/// Name of a record inside a vault.
pub type RecordPath = BytePath;

/// Key of a store entry.
pub type StoreKey = BytePath;

impl BytePath {
    /// Create a path from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Check if the path is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&str> for BytePath {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for BytePath {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&[u8]> for BytePath {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for BytePath {
    fn from(b: &[u8; N]) -> Self {
        Self(b.to_vec())
    }
}

impl From<Vec<u8>> for BytePath {
    fn from(b: Vec<u8>) -> Self {
        Self(b)
    }
}

impl From<&BytePath> for BytePath {
    fn from(p: &BytePath) -> Self {
        p.clone()
    }
}

impl AsRef<[u8]> for BytePath {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for BytePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "b64:{}", STANDARD.encode(&self.0)),
        }
    }
}

impl fmt::Debug for BytePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BytePath({})", self)
    }
}

impl Serialize for BytePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for BytePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct BytePathVisitor;

        impl<'de> Visitor<'de> for BytePathVisitor {
            type Value = BytePath;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base64 string or a byte sequence")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<BytePath, E> {
                STANDARD.decode(v).map(BytePath).map_err(E::custom)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<BytePath, E> {
                Ok(BytePath(v.to_vec()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<BytePath, A::Error> {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(BytePath(bytes))
            }
        }

        deserializer.deserialize_any(BytePathVisitor)
    }
}

/// Reference to a record inside a vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Location {
    /// Arbitrary record path inside a vault.
    Generic {
        #[serde(rename = "vaultPath")]
        vault_path: VaultPath,
        #[serde(rename = "recordPath")]
        record_path: RecordPath,
    },
    /// Counter slot inside a vault. `None` selects the next unused counter
    /// when writing.
    Counter {
        #[serde(rename = "vaultPath")]
        vault_path: VaultPath,
        counter: Option<u64>,
    },
}

impl Location {
    /// Create a generic location.
    pub fn generic(vault_path: impl Into<VaultPath>, record_path: impl Into<RecordPath>) -> Self {
        Self::Generic {
            vault_path: vault_path.into(),
            record_path: record_path.into(),
        }
    }

    /// Create a location addressing an explicit counter.
    pub fn counter(vault_path: impl Into<VaultPath>, counter: u64) -> Self {
        Self::Counter {
            vault_path: vault_path.into(),
            counter: Some(counter),
        }
    }

    /// Create a location that resolves to the vault's next counter on write.
    pub fn next_counter(vault_path: impl Into<VaultPath>) -> Self {
        Self::Counter {
            vault_path: vault_path.into(),
            counter: None,
        }
    }

    /// Get the vault part of the location.
    pub fn vault_path(&self) -> &VaultPath {
        match self {
            Self::Generic { vault_path, .. } | Self::Counter { vault_path, .. } => vault_path,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic {
                vault_path,
                record_path,
            } => write!(f, "{}/{}", vault_path, record_path),
            Self::Counter {
                vault_path,
                counter: Some(counter),
            } => write!(f, "{}#{}", vault_path, counter),
            Self::Counter {
                vault_path,
                counter: None,
            } => write!(f, "{}#next", vault_path),
        }
    }
}

/// Opaque fixed-size tag attached to a record for enumeration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RecordHint([u8; RECORD_HINT_LENGTH]);

impl RecordHint {
    /// Create a hint from up to 24 bytes, zero padded.
    ///
    /// # Errors
    /// - Returns error if `bytes` is longer than 24 bytes
    pub fn new(bytes: impl AsRef<[u8]>) -> crate::Result<Self> {
        let bytes = bytes.as_ref();
        if bytes.len() > RECORD_HINT_LENGTH {
            return Err(crate::Error::InvalidParameter(format!(
                "Record hint exceeds {} bytes",
                RECORD_HINT_LENGTH
            )));
        }
        let mut hint = [0u8; RECORD_HINT_LENGTH];
        hint[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(hint))
    }

    /// Get the hint bytes.
    pub fn as_bytes(&self) -> &[u8; RECORD_HINT_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for RecordHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self
            .0
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        write!(f, "RecordHint({})", String::from_utf8_lossy(&self.0[..end]))
    }
}

/// Identity of a remote peer, as authenticated by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id.
    ///
    /// # Errors
    /// - Returns error if `id` is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidParameter(
                "PeerId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-client flag set.
///
/// No flags are assigned yet. Unknown bits are kept as-is so snapshots
/// written by newer versions load without losing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientFlags(u32);

impl ClientFlags {
    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from raw bits, keeping unknown ones.
    pub const fn from_bits_retain(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Check whether all bits of `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}
