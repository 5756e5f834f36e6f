//! Ed25519 signing over raw 32-byte secret keys.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroizing;

use crate::keys::random_bytes;
use bastion_common::{Error, Result};

/// Secret key length.
pub const SECRET_KEY_LENGTH: usize = 32;

/// Public key length.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Signature length.
pub const SIGNATURE_LENGTH: usize = 64;

fn signing_key(secret: &[u8]) -> Result<SigningKey> {
    let bytes: &[u8; SECRET_KEY_LENGTH] = secret.try_into().map_err(|_| {
        Error::WrongKeyType(format!(
            "Ed25519 secret key must be {} bytes, got {}",
            SECRET_KEY_LENGTH,
            secret.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(bytes))
}

/// Generate a random secret key.
pub fn generate_secret_key() -> Zeroizing<Vec<u8>> {
    random_bytes(SECRET_KEY_LENGTH)
}

/// Compute the public key for a secret key.
pub fn public_key(secret: &[u8]) -> Result<[u8; PUBLIC_KEY_LENGTH]> {
    Ok(signing_key(secret)?.verifying_key().to_bytes())
}

/// Sign `message` deterministically.
pub fn sign(secret: &[u8], message: &[u8]) -> Result<[u8; SIGNATURE_LENGTH]> {
    Ok(signing_key(secret)?.sign(message).to_bytes())
}

/// Verify a signature against a public key.
///
/// Returns `Ok(false)` for a well-formed but invalid signature.
pub fn verify(public: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let public: &[u8; PUBLIC_KEY_LENGTH] = public
        .try_into()
        .map_err(|_| Error::InvalidParameter("Public key must be 32 bytes".to_string()))?;
    let signature: &[u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| Error::InvalidParameter("Signature must be 64 bytes".to_string()))?;

    let key = VerifyingKey::from_bytes(public)
        .map_err(|e| Error::InvalidParameter(format!("Invalid public key: {}", e)))?;
    Ok(key
        .verify(message, &Signature::from_bytes(signature))
        .is_ok())
}
