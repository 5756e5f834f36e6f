//! Common utilities and types shared across Bastion modules.
//!
//! This module provides the identifier and location types used by every
//! layer of the engine, together with the shared error type.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    BytePath, ClientFlags, ClientId, Location, PeerId, RecordHint, RecordPath, StoreKey,
    VaultPath, RECORD_HINT_LENGTH,
};
