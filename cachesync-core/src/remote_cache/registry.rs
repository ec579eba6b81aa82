//! OCI registry backend for remote cache.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use oci_client::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{Error, Result};
use crate::platform::Platform;

use super::artifact::Artifact;
use super::backend::RemoteCacheBackend;
use super::config::RemoteCacheConfig;
use super::key::{cache_key_addr, RemoteKey};

/// Media type of the single layer holding an artifact.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

/// Media type of the image config blob.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI registry backend for remote cache.
///
/// Every remote key is an image tag holding exactly one zstd-compressed tar
/// layer. Pulls and pushes retry with exponential backoff; existence probes
/// are answered from a single manifest lookup.
pub struct RegistryBackend {
    client: Client,
    registry: String,
    repo: String,
    auth: RegistryAuth,
    max_retries: u32,
    retry_delay: Duration,
}

impl RegistryBackend {
    /// Creates a new registry backend.
    ///
    /// # Arguments
    ///
    /// * `config` - Remote cache configuration
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are configured but cannot be resolved.
    pub fn new(config: &RemoteCacheConfig) -> Result<Self> {
        let auth = match (&config.username, config.resolve_password()?) {
            (Some(username), Some(secret)) => RegistryAuth::Basic(username.clone(), secret),
            _ => RegistryAuth::Anonymous,
        };

        let protocol = if config.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });

        Ok(Self {
            client,
            registry: config.registry.trim().to_string(),
            repo: config.repo.trim_matches('/').to_string(),
            auth,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(100),
        })
    }

    /// Gets the image address for a remote key.
    pub fn address(&self, key: &RemoteKey) -> String {
        cache_key_addr(&self.registry, &self.repo, key)
    }

    fn reference(&self, key: &RemoteKey) -> Result<Reference> {
        let address = self.address(key);
        address.parse::<Reference>().map_err(|e| Error::Registry {
            address: address.clone(),
            message: format!("Invalid image reference: {}", e),
        })
    }

    /// Retries an operation with exponential backoff until it succeeds, the
    /// attempts run out or the token is cancelled.
    async fn retry<F, Fut, T>(&self, cancel: &CancellationToken, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut delay = self.retry_delay;
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = f() => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < self.max_retries {
                        debug!(attempt, error = %e, "registry operation failed, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                            _ = sleep(delay) => {}
                        }
                        delay *= 2;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Step("All retry attempts failed".to_string())))
    }

    fn image_config(artifact: &Artifact) -> Result<Vec<u8>> {
        let host = Platform::host();
        serde_json::to_vec(&serde_json::json!({
            "architecture": host.architecture(),
            "os": host.os(),
            "rootfs": {
                "type": "layers",
                "diff_ids": [artifact.diff_id()],
            },
            "config": {},
        }))
        .map_err(|e| Error::Artifact(format!("Failed to serialize image config: {}", e)))
    }
}

#[async_trait]
impl RemoteCacheBackend for RegistryBackend {
    async fn exists(&self, key: &RemoteKey, cancel: &CancellationToken) -> bool {
        let Ok(reference) = self.reference(key) else {
            return false;
        };

        let span = info_span!("registry.exists", cache.key = %key, cache.address = %reference);
        async {
            tokio::select! {
                _ = cancel.cancelled() => false,
                result = self.client.fetch_manifest_digest(&reference, &self.auth) => {
                    match result {
                        Ok(digest) => {
                            debug!(%digest, "remote cache found");
                            true
                        }
                        Err(e) => {
                            debug!(error = %e, "remote cache not found");
                            false
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn import(&self, key: &RemoteKey, cancel: &CancellationToken) -> Result<Artifact> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.exists(key, cancel).await {
            return Ok(Artifact::empty());
        }

        let reference = self.reference(key)?;
        let address = reference.to_string();
        let span = info_span!("registry.import", cache.key = %key, cache.address = %address);

        async {
            let image = self
                .retry(cancel, || async {
                    self.client
                        .pull(&reference, &self.auth, vec![LAYER_MEDIA_TYPE])
                        .await
                        .map_err(|e| Error::Registry {
                            address: address.clone(),
                            message: format!("Pull failed: {}", e),
                        })
                })
                .await?;

            let mut layers = image.layers.into_iter();
            let (Some(layer), None) = (layers.next(), layers.next()) else {
                return Err(Error::Registry {
                    address: address.clone(),
                    message: "Expected exactly one cache layer".to_string(),
                });
            };

            let artifact = Artifact::from_compressed(layer.data.to_vec())?;
            debug!(entries = artifact.len(), "imported remote cache");
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
        let reference = self.reference(key)?;
        let address = reference.to_string();
        if artifact.diff_id().is_empty() {
            return Err(Error::Registry {
                address,
                message: "Cannot push an artifact without content".to_string(),
            });
        }

        let config_data = Self::image_config(artifact)?;
        let span = info_span!("registry.export", cache.key = %key, cache.address = %address);

        async {
            self.retry(cancel, || async {
                let layer = ImageLayer {
                    data: artifact.compressed_data().to_vec().into(),
                    media_type: LAYER_MEDIA_TYPE.to_string(),
                    annotations: None,
                };
                let config = Config {
                    data: config_data.clone().into(),
                    media_type: CONFIG_MEDIA_TYPE.to_string(),
                    annotations: None,
                };

                self.client
                    .push(&reference, &[layer], config, &self.auth, None)
                    .await
                    .map(|_| ())
                    .map_err(|e| Error::Registry {
                        address: address.clone(),
                        message: format!("Push failed: {}", e),
                    })
            })
            .await
            .inspect_err(|e| warn!(error = %e, "failed to export remote cache"))?;

            debug!(size = artifact.compressed_data().len(), "exported remote cache");
            Ok::<_, Error>(())
        }
        .instrument(span)
        .await
    }

    fn describe(&self, key: &RemoteKey) -> String {
        self.address(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address() {
        let config = RemoteCacheConfig::new("ghcr.io", "/acme/cache/");
        let backend = RegistryBackend::new(&config).unwrap();

        let address = backend.address(&RemoteKey::new("ci-apt-cache-linux-amd64"));
        assert_eq!(address, "ghcr.io/acme/cache:ci-apt-cache-linux-amd64");
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let config = RemoteCacheConfig::new("ghcr.io", "cache")
            .with_credentials("bot", "CACHESYNC_TEST_SECRET_THAT_IS_NOT_SET");
        assert!(RegistryBackend::new(&config).is_err());
    }

    #[test]
    fn test_image_config_lists_layer() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"a").unwrap();
        let artifact = Artifact::from_dir(dir.path()).unwrap();

        let config: serde_json::Value =
            serde_json::from_slice(&RegistryBackend::image_config(&artifact).unwrap()).unwrap();
        assert_eq!(config["rootfs"]["diff_ids"][0], artifact.diff_id());
    }
}
