//! Common error types for Bastion.

use thiserror::Error;

/// Top-level error type for Bastion operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong password on load or reload, or a tampered snapshot.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Location, client, vault or snapshot is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Access control rejected the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Out-of-range or malformed argument.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Mnemonic failed wordlist or checksum validation.
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// Procedure input holds an incompatible kind of key.
    #[error("Wrong key type: {0}")]
    WrongKeyType(String),

    /// The snapshot key has been cleared.
    #[error("Snapshot is locked")]
    Locked,

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cryptographic primitive failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
