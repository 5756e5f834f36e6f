//! BIP-0039 mnemonic generation and seed recovery.
//!
//! Seeds are PBKDF2-HMAC-SHA512 over the mnemonic with `"mnemonic" ||
//! passphrase` as salt and 2048 rounds. Passphrases are used as given;
//! callers wanting NFKD normalization of non-ASCII input apply it first.

use bip39::{Language, Mnemonic};
use zeroize::Zeroizing;

use crate::keys::random_bytes;
use bastion_common::{Error, Result};

/// Length of a BIP-0039 seed.
pub const SEED_LENGTH: usize = 64;

/// Entropy for a 24-word mnemonic.
const ENTROPY_LENGTH: usize = 32;

/// Generate a fresh 24-word English mnemonic.
pub fn generate_mnemonic() -> Result<Zeroizing<String>> {
    let entropy = random_bytes(ENTROPY_LENGTH);
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
        .map_err(|e| Error::Crypto(format!("Mnemonic generation failed: {}", e)))?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Validate `phrase` and derive its seed.
///
/// # Errors
/// - `InvalidMnemonic` on unknown words, bad word count or checksum failure
pub fn mnemonic_to_seed(phrase: &str, passphrase: Option<&str>) -> Result<Zeroizing<[u8; SEED_LENGTH]>> {
    let normalized = Zeroizing::new(
        phrase
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" "),
    );
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, &normalized)
        .map_err(|e| Error::InvalidMnemonic(e.to_string()))?;

    Ok(Zeroizing::new(
        mnemonic.to_seed_normalized(passphrase.unwrap_or("")),
    ))
}
