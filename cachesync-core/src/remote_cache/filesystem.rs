//! Filesystem backend for remote cache.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::error::{Error, Result};

use super::artifact::Artifact;
use super::backend::RemoteCacheBackend;
use super::integrity::ArtifactVerifier;
use super::key::RemoteKey;

/// Sidecar written next to every stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// SHA-256 hash of the compressed artifact.
    pub hash: String,
    /// Size of the compressed artifact in bytes.
    pub size: u64,
    /// Timestamp when the artifact was stored (Unix epoch seconds).
    pub created_at: u64,
}

/// Filesystem backend for remote cache.
///
/// Stores artifacts as `<root>/<repo>/<remote key>.tar.zst` with a JSON
/// sidecar. Writes go through a temp file and an atomic rename, so the last
/// writer wins and readers never see a half-written object.
pub struct FilesystemBackend {
    root: PathBuf,
    store_dir: PathBuf,
}

impl FilesystemBackend {
    /// Creates a new filesystem backend.
    ///
    /// # Arguments
    ///
    /// * `root` - Base directory for cache storage
    /// * `repo` - Repository path inside the store
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created or accessed.
    pub fn new(root: impl AsRef<Path>, repo: &str) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let store_dir = root.join(repo.trim_matches('/'));

        std::fs::create_dir_all(&store_dir)?;
        std::fs::create_dir_all(root.join("tmp"))?;

        Ok(Self { root, store_dir })
    }

    /// Gets the artifact path for a remote key.
    fn artifact_path(&self, key: &RemoteKey) -> PathBuf {
        self.store_dir.join(format!("{}.tar.zst", key))
    }

    /// Gets the sidecar path for a remote key.
    fn metadata_path(&self, key: &RemoteKey) -> PathBuf {
        self.store_dir.join(format!("{}.json", key))
    }

    /// Gets a fresh temporary path for an upload.
    fn temp_path(&self) -> PathBuf {
        let uuid = uuid::Uuid::new_v4();
        self.root.join("tmp").join(format!("{}.tmp", uuid))
    }

    /// Writes `data` to `dest` through a temp file and a rename.
    async fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<()> {
        let temp_path = self.temp_path();
        fs::write(&temp_path, data).await?;

        if let Err(e) = fs::rename(&temp_path, dest).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    async fn read_metadata(&self, key: &RemoteKey) -> Result<StorageMetadata> {
        let content = fs::read_to_string(self.metadata_path(key)).await?;
        serde_json::from_str(&content).map_err(|e| Error::Storage {
            key: key.to_string(),
            message: format!("Failed to parse metadata: {}", e),
        })
    }
}

#[async_trait]
impl RemoteCacheBackend for FilesystemBackend {
    async fn exists(&self, key: &RemoteKey, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let artifact = fs::try_exists(self.artifact_path(key)).await.unwrap_or(false);
        let metadata = fs::try_exists(self.metadata_path(key)).await.unwrap_or(false);
        artifact && metadata
    }

    async fn import(&self, key: &RemoteKey, cancel: &CancellationToken) -> Result<Artifact> {
        let span = info_span!("filesystem.import", cache.key = %key);
        async {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !self.exists(key, cancel).await {
                debug!("cache miss");
                return Ok(Artifact::empty());
            }

            let metadata = self.read_metadata(key).await?;
            let data = fs::read(self.artifact_path(key)).await?;
            if data.len() as u64 != metadata.size {
                return Err(Error::Storage {
                    key: key.to_string(),
                    message: format!(
                        "Partial object: expected {} bytes, found {}",
                        metadata.size,
                        data.len()
                    ),
                });
            }

            let artifact = Artifact::from_compressed(data)?;
            ArtifactVerifier::verify(&artifact, &metadata.hash)?;
            debug!(entries = artifact.len(), "imported artifact");
            Ok(artifact)
        }
        .instrument(span)
        .await
    }

    async fn export(
        &self,
        key: &RemoteKey,
        artifact: &Artifact,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let span = info_span!("filesystem.export", cache.key = %key);
        async {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let created_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let metadata = StorageMetadata {
                hash: artifact.hash(),
                size: artifact.compressed_data().len() as u64,
                created_at,
            };
            let metadata_json = serde_json::to_vec(&metadata).map_err(|e| Error::Storage {
                key: key.to_string(),
                message: format!("Failed to serialize metadata: {}", e),
            })?;

            self.write_atomic(&self.artifact_path(key), artifact.compressed_data())
                .await?;
            self.write_atomic(&self.metadata_path(key), &metadata_json)
                .await?;

            debug!(size = metadata.size, "exported artifact");
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn describe(&self, key: &RemoteKey) -> String {
        self.artifact_path(key).display().to_string()
    }
}
