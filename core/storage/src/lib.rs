//! Snapshot persistence providers for Bastion.
//!
//! The vault engine serializes and encrypts snapshots itself; providers
//! only move opaque bytes to and from a backing store.
//!
//! # Design Principles
//! - Atomic replace: a write either lands completely or not at all
//! - Async operations: all I/O goes through tokio
//! - Unified error semantics across providers

pub mod local;
pub mod memory;
pub mod provider;

pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use provider::{Metadata, SnapshotProvider};
