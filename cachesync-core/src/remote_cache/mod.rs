//! Remote cache synchronization for build cache volumes.
//!
//! [`RemoteCache`] mounts cache volumes onto build steps, restoring their
//! content from a remote store, and later exports the ones that need to be
//! written back. The state linking the two calls travels with the step as
//! labels, so mount and export may run in different invocations.
//! [`TrackedCache`] is the alternative that keeps that state in the
//! orchestrator instead.

mod artifact;
mod backend;
mod config;
mod filesystem;
mod integrity;
mod key;
mod metadata;
mod mount;
mod registry;
mod report;
mod tracked;

pub use artifact::{Artifact, ArtifactManifest, EntryKind, ManifestEntry};
pub use backend::{DisabledBackend, RemoteCacheBackend};
pub use config::{RemoteCacheConfig, FILESYSTEM_SCHEME};
pub use filesystem::{FilesystemBackend, StorageMetadata};
pub use integrity::ArtifactVerifier;
pub use key::{
    cache_key_addr, default_remote_key, format_address, FormatFn, KeyFormatter, KeyParts,
    RemoteKey,
};
pub use metadata::{label_name, label_remote_key, MountMetadata, MOUNT_LABEL_PREFIX};
pub use mount::VolumeMount;
pub use registry::{RegistryBackend, CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE};
pub use report::{ExportOutcome, ExportReport, SkipReason};
pub use tracked::TrackedCache;

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::step::{expand_path, BuildStep};

/// Remote cache orchestrator.
///
/// Cheap to clone; clones share the backend. Configuration changes go
/// through the `with_*` methods, which return modified copies.
#[derive(Clone)]
pub struct RemoteCache {
    backend: Arc<dyn RemoteCacheBackend>,
    formatter: KeyFormatter,
    pipeline: String,
    max_artifact_size: Option<u64>,
}

impl RemoteCache {
    /// Creates a remote cache over `backend` for the named pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline name is empty.
    pub fn new(backend: Arc<dyn RemoteCacheBackend>, pipeline: impl Into<String>) -> Result<Self> {
        let pipeline = pipeline.into();
        if pipeline.trim().is_empty() {
            return Err(Error::Config(
                "Pipeline name is required for remote cache keys".to_string(),
            ));
        }

        Ok(Self {
            backend,
            formatter: KeyFormatter::default(),
            pipeline,
            max_artifact_size: None,
        })
    }

    /// Creates a remote cache from configuration.
    ///
    /// Selects the backend from the registry root: empty or invalid roots
    /// disable remote caching, `file://` roots use a directory store and
    /// anything else is an OCI registry.
    ///
    /// # Errors
    ///
    /// Returns an error if backend creation fails or the pipeline is empty.
    pub fn from_config(config: &RemoteCacheConfig) -> Result<Self> {
        let backend: Arc<dyn RemoteCacheBackend> = if !config.is_enabled() {
            debug!("no registry configured, remote cache disabled");
            Arc::new(DisabledBackend)
        } else if !config.is_valid_registry() {
            warn!(registry = %config.registry, "invalid registry root, remote cache disabled");
            Arc::new(DisabledBackend)
        } else if let Some(root) = config.filesystem_root() {
            Arc::new(FilesystemBackend::new(root, &config.repo)?)
        } else {
            Arc::new(RegistryBackend::new(config)?)
        };

        Ok(Self::new(backend, config.pipeline.clone())?
            .with_max_artifact_size(config.max_artifact_size))
    }

    /// Creates a remote cache that only uses local volumes.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline name is empty.
    pub fn disabled(pipeline: impl Into<String>) -> Result<Self> {
        Self::new(Arc::new(DisabledBackend), pipeline)
    }

    /// Returns a copy using `formatter` to derive remote keys.
    pub fn with_key_formatter(&self, formatter: KeyFormatter) -> Self {
        Self {
            formatter,
            ..self.clone()
        }
    }

    /// Returns a copy enforcing a maximum uncompressed artifact size on export.
    pub fn with_max_artifact_size(&self, max_artifact_size: Option<u64>) -> Self {
        Self {
            max_artifact_size,
            ..self.clone()
        }
    }

    /// Checks if a remote store is configured.
    pub fn is_enabled(&self) -> bool {
        self.backend.is_enabled()
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn backend(&self) -> &Arc<dyn RemoteCacheBackend> {
        &self.backend
    }

    /// Derives the remote key of a logical cache key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is empty.
    pub fn remote_key(&self, key: &str, platform: Option<&Platform>) -> Result<RemoteKey> {
        self.formatter.remote_key(&self.pipeline, key, platform)
    }

    /// Prepares a cache volume mount of `key` at `path`.
    pub fn cache_volume(&self, path: &str, key: &str) -> VolumeMount {
        VolumeMount::volume(self.clone(), path, key)
    }

    /// Prepares a mount that restores `key` into the step's own filesystem at
    /// `path` instead of attaching a cache volume.
    pub fn mounted_directory(&self, path: &str, key: &str) -> VolumeMount {
        VolumeMount::directory(self.clone(), path, key)
    }

    pub(crate) async fn mount_remote_key<S: BuildStep>(
        &self,
        step: &S,
        metadata: &MountMetadata,
    ) -> Result<RemoteKey> {
        let platform = if metadata.platform_aware {
            Some(step.platform().await?)
        } else {
            None
        };
        self.remote_key(&metadata.key, platform.as_ref())
    }

    pub(crate) fn mount_path<S: BuildStep>(&self, step: &S, metadata: &MountMetadata) -> Result<String> {
        if metadata.expand {
            expand_path(&metadata.path, |name| step.env_variable(name))
        } else {
            Ok(metadata.path.clone())
        }
    }

    /// Exports every cache mounted on `step` that needs writing back.
    ///
    /// The step is resolved first. Each mount label is then processed on its
    /// own: a failure is recorded in the report and does not stop the others.
    /// Labels of exported and skipped mounts are removed from the returned
    /// step, so exporting it again writes nothing.
    ///
    /// # Arguments
    ///
    /// * `step` - The build step carrying mount labels
    /// * `cancel` - Cancellation signal for store and resolution calls
    ///
    /// # Returns
    ///
    /// Returns the resolved step without the processed labels, and the
    /// per-key report.
    ///
    /// # Errors
    ///
    /// Returns an error only if the step cannot be resolved or its labels
    /// cannot be read.
    pub async fn export<S: BuildStep>(
        &self,
        step: &S,
        cancel: &CancellationToken,
    ) -> Result<(S, ExportReport)> {
        let span = info_span!("remote_cache.export", pipeline = %self.pipeline);
        async {
            let mut step = step.sync(cancel).await?;
            let labels = step.labels().await?;
            let mut report = ExportReport::default();

            for (name, value) in &labels {
                let Some(label_key) = label_remote_key(name) else {
                    continue;
                };

                let metadata = match MountMetadata::from_label(name, value) {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!(label = %name, error = %e, "skipping corrupt mount metadata");
                        report.push(label_key, ExportOutcome::Failed(e.to_string()));
                        continue;
                    }
                };

                match self.export_mount(&step, label_key, &metadata, cancel).await {
                    Ok((key, outcome)) => {
                        step = step.without_label(name);
                        report.push(key.as_str(), outcome);
                    }
                    Err(e) => {
                        warn!(label = %name, error = %e, "failed to export cache");
                        report.push(label_key, ExportOutcome::Failed(e.to_string()));
                    }
                }
            }

            info!(
                exported = report.exported(),
                skipped = report.skipped(),
                failed = report.failed(),
                "export finished"
            );
            Ok::<_, Error>((step, report))
        }
        .instrument(span)
        .await
    }

    async fn export_mount<S: BuildStep>(
        &self,
        step: &S,
        label_key: &str,
        metadata: &MountMetadata,
        cancel: &CancellationToken,
    ) -> Result<(RemoteKey, ExportOutcome)> {
        let key = self.mount_remote_key(step, metadata).await?;
        if key.as_str() != label_key {
            warn!(
                label = label_key,
                derived = %key,
                "mount label does not match derived key, using derived key"
            );
        }

        if !self.backend.is_enabled() {
            return Ok((key, ExportOutcome::Skipped(SkipReason::RemoteDisabled)));
        }
        if metadata.should_skip_export() {
            debug!(cache.key = %key, "remote cache already exists, skipping export");
            return Ok((key, ExportOutcome::Skipped(SkipReason::AlreadyCached)));
        }

        let path = self.mount_path(step, metadata)?;
        let artifact = step.directory(&path, cancel).await?;
        if let Some(max_size) = self.max_artifact_size {
            ArtifactVerifier::verify_size(&artifact, max_size)?;
        }

        self.backend.export(&key, &artifact, cancel).await?;
        info!(
            cache.key = %key,
            cache.address = %self.backend.describe(&key),
            entries = artifact.len(),
            "exported cache"
        );
        Ok((key, ExportOutcome::Exported))
    }
}

impl fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCache")
            .field("pipeline", &self.pipeline)
            .field("enabled", &self.backend.is_enabled())
            .field("max_artifact_size", &self.max_artifact_size)
            .finish_non_exhaustive()
    }
}
