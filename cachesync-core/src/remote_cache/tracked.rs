//! Orchestrator-owned mount tracking.
//!
//! Unlike [`RemoteCache::export`], which rediscovers mounts from step labels,
//! a [`TrackedCache`] keeps the mounts it created in a key-sorted list. The
//! same instance must therefore be used for mounting and for syncing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::step::{BuildStep, CacheVolume, MountOptions};

use super::backend::RemoteCacheBackend;
use super::config::RemoteCacheConfig;
use super::key::{KeyFormatter, RemoteKey};
use super::mount::replace_contents;
use super::report::{ExportOutcome, ExportReport, SkipReason};
use super::RemoteCache;

#[derive(Debug, Clone)]
struct TrackedMount<S> {
    key: String,
    path: String,
    platform_aware: bool,
    /// Step the volume was attached to; reads and writes of the volume go
    /// through it.
    step: S,
}

/// Remote cache that tracks its mounts explicitly.
#[derive(Debug, Clone)]
pub struct TrackedCache<S> {
    cache: RemoteCache,
    skip_if_exists: bool,
    mounts: Vec<TrackedMount<S>>,
}

impl<S: BuildStep> TrackedCache<S> {
    pub fn new(cache: RemoteCache) -> Self {
        Self {
            cache,
            skip_if_exists: false,
            mounts: Vec::new(),
        }
    }

    /// Creates a tracked cache from configuration, honoring `skip_if_exists`.
    ///
    /// # Errors
    ///
    /// Returns an error if backend creation fails or the pipeline is empty.
    pub fn from_config(config: &RemoteCacheConfig) -> Result<Self> {
        let cache = RemoteCache::from_config(config)?;
        Ok(Self::new(cache).with_skip_if_exists(config.skip_if_exists))
    }

    /// Returns a copy that talks to `backend`.
    pub fn with_remote(&self, backend: Arc<dyn RemoteCacheBackend>) -> Self {
        let mut next = self.clone();
        next.cache.backend = backend;
        next
    }

    /// Returns a copy that skips uploads of keys already present remotely.
    pub fn with_skip_if_exists(&self, skip_if_exists: bool) -> Self {
        Self {
            skip_if_exists,
            ..self.clone()
        }
    }

    /// Returns a copy deriving remote keys with `formatter`.
    pub fn with_key_formatter(&self, formatter: KeyFormatter) -> Self {
        Self {
            cache: self.cache.with_key_formatter(formatter),
            ..self.clone()
        }
    }

    /// Returns a copy namespaced under another pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline name is empty.
    pub fn with_pipeline(&self, pipeline: impl Into<String>) -> Result<Self> {
        let cache = RemoteCache::new(Arc::clone(&self.cache.backend), pipeline)?
            .with_key_formatter(self.cache.formatter)
            .with_max_artifact_size(self.cache.max_artifact_size);
        Ok(Self {
            cache,
            ..self.clone()
        })
    }

    pub fn skip_if_exists(&self) -> bool {
        self.skip_if_exists
    }

    /// Tracked logical keys, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().map(|m| m.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Attaches the cache volume `key` at `path` and starts tracking it.
    ///
    /// The volume is named by the derived remote key. A key that is already
    /// tracked keeps its first registration; the volume is still attached to
    /// `step`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is empty or the step platform is unknown.
    pub async fn mounted_volume(
        &mut self,
        step: &S,
        path: &str,
        key: &str,
        options: &MountOptions,
        platform_aware: bool,
    ) -> Result<S> {
        let platform = if platform_aware {
            Some(step.platform().await?)
        } else {
            None
        };
        let remote_key = self.cache.remote_key(key, platform.as_ref())?;
        let volume = CacheVolume::new(remote_key.as_str());
        let mounted = step.with_mounted_cache(path, &volume, options);

        match self.mounts.binary_search_by(|m| m.key.as_str().cmp(key)) {
            Ok(_) => debug!(cache = key, "cache volume already tracked"),
            Err(index) => self.mounts.insert(
                index,
                TrackedMount {
                    key: key.to_string(),
                    path: path.to_string(),
                    platform_aware,
                    step: mounted.clone(),
                },
            ),
        }

        Ok(mounted)
    }

    async fn remote_key(&self, mount: &TrackedMount<S>) -> Result<RemoteKey> {
        let platform: Option<Platform> = if mount.platform_aware {
            Some(mount.step.platform().await?)
        } else {
            None
        };
        self.cache.remote_key(&mount.key, platform.as_ref())
    }

    /// Restores remote content into every tracked volume.
    ///
    /// # Errors
    ///
    /// Returns the first import or replacement error.
    pub async fn download(&self, cancel: &CancellationToken) -> Result<()> {
        for mount in &self.mounts {
            let key = self.remote_key(mount).await?;
            let span = info_span!("tracked_cache.download", cache.key = %key);
            async {
                let artifact = self.cache.backend.import(&key, cancel).await?;
                if artifact.is_empty() {
                    debug!("no remote cache");
                    return Ok(());
                }

                replace_contents(&mount.step, &mount.path, &artifact, &key)
                    .sync(cancel)
                    .await?;
                info!(entries = artifact.len(), "restored cache");
                Ok::<_, Error>(())
            }
            .instrument(span)
            .await?;
        }
        Ok(())
    }

    /// Writes every tracked volume back to the store.
    ///
    /// Honors the skip-if-exists setting. Failures are reported per key.
    pub async fn upload(&self, cancel: &CancellationToken) -> ExportReport {
        let mut report = ExportReport::default();

        for mount in &self.mounts {
            let key = match self.remote_key(mount).await {
                Ok(key) => key,
                Err(e) => {
                    report.push(mount.key.as_str(), ExportOutcome::Failed(e.to_string()));
                    continue;
                }
            };

            let outcome = self
                .upload_one(mount, &key, cancel)
                .instrument(info_span!("tracked_cache.upload", cache.key = %key))
                .await
                .unwrap_or_else(|e| {
                    warn!(cache.key = %key, error = %e, "failed to upload cache");
                    ExportOutcome::Failed(e.to_string())
                });
            report.push(key.as_str(), outcome);
        }

        report
    }

    async fn upload_one(
        &self,
        mount: &TrackedMount<S>,
        key: &RemoteKey,
        cancel: &CancellationToken,
    ) -> Result<ExportOutcome> {
        let backend = &self.cache.backend;
        if !backend.is_enabled() {
            return Ok(ExportOutcome::Skipped(SkipReason::RemoteDisabled));
        }
        if self.skip_if_exists && backend.exists(key, cancel).await {
            debug!("remote cache exists, skipping upload");
            return Ok(ExportOutcome::Skipped(SkipReason::AlreadyCached));
        }

        let artifact = mount.step.directory(&mount.path, cancel).await?;
        if let Some(max_size) = self.cache.max_artifact_size {
            super::ArtifactVerifier::verify_size(&artifact, max_size)?;
        }
        backend.export(key, &artifact, cancel).await?;
        info!(entries = artifact.len(), "uploaded cache");
        Ok(ExportOutcome::Exported)
    }

    /// Downloads, resolves `step`, then uploads.
    ///
    /// # Errors
    ///
    /// Returns an error if the download or the resolution fails.
    pub async fn sync(&self, step: &S, cancel: &CancellationToken) -> Result<(S, ExportReport)> {
        self.download(cancel).await?;
        self.resolve_and_upload(step, cancel).await
    }

    /// Resolves `step`, then uploads.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolution fails.
    pub async fn resolve_and_upload(
        &self,
        step: &S,
        cancel: &CancellationToken,
    ) -> Result<(S, ExportReport)> {
        let resolved = step.sync(cancel).await?;
        let report = self.upload(cancel).await;
        Ok((resolved, report))
    }
}
