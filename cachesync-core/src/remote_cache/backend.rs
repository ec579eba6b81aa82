//! Backend trait for remote cache storage.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

use super::artifact::Artifact;
use super::key::RemoteKey;

/// Trait for remote cache backends.
///
/// A backend stores at most one artifact per remote key. It holds only its
/// store coordinates and is shared freely across mounts.
#[async_trait]
pub trait RemoteCacheBackend: Send + Sync {
    /// Checks if an artifact exists in the store.
    ///
    /// Never fails: a malformed address, an unreachable store, a missing
    /// object and cancellation all yield `false`.
    async fn exists(&self, key: &RemoteKey, cancel: &CancellationToken) -> bool;

    /// Imports the artifact stored under `key`.
    ///
    /// # Returns
    ///
    /// Returns an empty artifact when the object does not exist. A miss and
    /// an empty artifact are the same signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the object exists but cannot be transferred or
    /// decoded.
    async fn import(&self, key: &RemoteKey, cancel: &CancellationToken) -> Result<Artifact>;

    /// Exports an artifact under `key`, replacing whatever is stored there.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn export(
        &self,
        key: &RemoteKey,
        artifact: &Artifact,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Returns `false` for backends that never talk to a store.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Returns the store coordinate of `key`, for logs and diagnostics.
    fn describe(&self, key: &RemoteKey) -> String {
        key.to_string()
    }
}

/// Backend used when remote caching is disabled.
///
/// Imports are always empty and exports succeed without doing anything, so
/// mounts fall back to local cache volumes only.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBackend;

#[async_trait]
impl RemoteCacheBackend for DisabledBackend {
    async fn exists(&self, _key: &RemoteKey, _cancel: &CancellationToken) -> bool {
        false
    }

    async fn import(&self, _key: &RemoteKey, _cancel: &CancellationToken) -> Result<Artifact> {
        Ok(Artifact::empty())
    }

    async fn export(
        &self,
        _key: &RemoteKey,
        _artifact: &Artifact,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
