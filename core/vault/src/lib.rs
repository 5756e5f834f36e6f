//! Vault engine for Bastion.
//!
//! This module provides:
//! - Encrypted snapshots holding clients, vaults and records
//! - Cryptographic procedures over records (SLIP-10, BIP-39, Ed25519)
//! - A per-client plaintext store with optional entry lifetimes
//! - Password sessions that clear the key after an interval
//! - Permission-checked requests from remote peers
//!
//! # Architecture
//! [`VaultManager`] loads snapshots through a storage provider. A
//! [`Snapshot`] hands out [`Client`] handles; clients expose [`Vault`] and
//! [`Store`] handles. Secrets never leave the engine except through the
//! outputs of a [`Procedure`].

pub mod access;
pub mod client;
pub mod config;
pub mod manager;
pub mod procedures;
mod record;
pub mod remote;
pub mod session;
pub mod snapshot;

pub use access::{ClientAccess, ConnectionLimits, NetworkConfig, Permissions, VaultAccess};
pub use client::{Client, Store, Vault};
pub use config::{EngineConfig, SnapshotVersion};
pub use manager::VaultManager;
pub use procedures::{
    KeyType, OutputLocation, Procedure, ProcedureOutput, Slip10DeriveInput, DEFAULT_SEED_SIZE,
    MAX_SEED_SIZE,
};
pub use record::{RecordId, RecordKind};
pub use remote::{
    ClientRequest, RecordEntry, RemoteHierarchy, RemoteRequest, RemoteResponse, SnapshotRequest,
};
pub use session::{ListenerToken, Status, StatusEvent};
pub use snapshot::Snapshot;

pub use bastion_crypto::{Chain, KdfParams};
