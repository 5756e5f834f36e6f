//! Cryptographic primitives for Bastion.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Secure key management with automatic zeroization
//! - SLIP-0010 hierarchical derivation over ed25519
//! - BIP-0039 mnemonic handling
//! - Ed25519 signing
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod ed25519;
pub mod kdf;
pub mod keys;
pub mod mnemonic;
pub mod slip10;

pub use aead::{decrypt, decrypt_with_aad, encrypt, encrypt_with_aad};
pub use kdf::{derive_key, KdfParams};
pub use keys::{digest_id, random_bytes, Salt, SnapshotKey, VaultKey, KEY_LENGTH};
pub use slip10::{Chain, ExtendedKey};
