//! Snapshot provider trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use bastion_common::Result;

/// Metadata for a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Snapshot path as given to the provider.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// Backing store for encrypted snapshot files.
///
/// Snapshots are addressed by path. Implementations must make
/// [`SnapshotProvider::write_atomic`] all-or-nothing: a reader sees either
/// the previous content or the new content, never a mix.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Get the provider name (e.g., "local", "memory").
    fn name(&self) -> &str;

    /// Read the complete snapshot at `path`.
    ///
    /// # Errors
    /// - `NotFound` if nothing is stored at `path`
    /// - I/O errors
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace the snapshot at `path` with `data`.
    ///
    /// # Postconditions
    /// - On success the new content is durable
    /// - On failure the previous content is untouched
    async fn write_atomic(&self, path: &Path, data: Vec<u8>) -> Result<Metadata>;

    /// Check if a snapshot exists at `path`.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get metadata for the snapshot at `path`.
    async fn metadata(&self, path: &Path) -> Result<Metadata>;

    /// Delete the snapshot at `path`.
    async fn delete(&self, path: &Path) -> Result<()>;
}
