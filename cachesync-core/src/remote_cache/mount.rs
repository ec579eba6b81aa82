//! Binding of a logical cache to one build step.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::error::{Error, Result};
use crate::step::{BuildStep, CacheVolume, MountOptions};

use super::artifact::Artifact;
use super::key::RemoteKey;
use super::metadata::{label_name, MountMetadata};
use super::RemoteCache;

/// Where imported content lands inside the step before it is copied over.
const IMPORT_SCRATCH_PREFIX: &str = "/tmp/cachesync-import-";

/// Queues the destructive replacement of `path` with `artifact`: delete every
/// entry under `path`, then copy the imported tree in, preserving mode,
/// ownership and timestamps.
pub(crate) fn replace_contents<S: BuildStep>(
    step: &S,
    path: &str,
    artifact: &Artifact,
    key: &RemoteKey,
) -> S {
    let scratch = format!("{}{}", IMPORT_SCRATCH_PREFIX, key);
    step.with_directory(&scratch, artifact)
        .with_exec(&["find", path, "-mindepth", "1", "-delete"])
        .with_exec(&["cp", "-rTp", &scratch, path])
        .without_mount(&scratch)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountTarget {
    /// A named cache volume attached at the path.
    Volume,
    /// The step's own filesystem at the path.
    Directory,
}

/// A cache about to be mounted onto a build step.
///
/// Created by [`RemoteCache::cache_volume`] or
/// [`RemoteCache::mounted_directory`]; optional settings are applied with the
/// builder methods before calling [`VolumeMount::mount`].
#[derive(Debug, Clone)]
pub struct VolumeMount {
    cache: RemoteCache,
    metadata: MountMetadata,
    target: MountTarget,
}

impl VolumeMount {
    pub(crate) fn volume(cache: RemoteCache, path: &str, key: &str) -> Self {
        Self::with_target(cache, path, key, MountTarget::Volume)
    }

    pub(crate) fn directory(cache: RemoteCache, path: &str, key: &str) -> Self {
        Self::with_target(cache, path, key, MountTarget::Directory)
    }

    fn with_target(cache: RemoteCache, path: &str, key: &str, target: MountTarget) -> Self {
        Self {
            cache,
            metadata: MountMetadata::new(path, key),
            target,
        }
    }

    /// Qualifies the remote key with the step platform.
    pub fn platform_aware(mut self, platform_aware: bool) -> Self {
        self.metadata.platform_aware = platform_aware;
        self
    }

    /// Sets the owner of the mount point, `user[:group]`.
    ///
    /// Volumes receive it when attached; directory mounts are `chown`ed
    /// after their content is restored.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.metadata.owner = owner.into();
        self
    }

    /// Expands `$VAR` references in the path from the step environment.
    pub fn expand(mut self, expand: bool) -> Self {
        self.metadata.expand = expand;
        self
    }

    /// Exports the cache even if it already existed remotely.
    pub fn force_export(mut self, force_export: bool) -> Self {
        self.metadata.force_export = force_export;
        self
    }

    pub fn metadata(&self) -> &MountMetadata {
        &self.metadata
    }

    /// Mounts the cache onto `step`, restoring remote content first.
    ///
    /// The local volume is named by the derived remote key, so pipelines and
    /// platforms never share one.
    ///
    /// # Arguments
    ///
    /// * `step` - The build step to mount onto
    /// * `cancel` - Cancellation signal for store and resolution calls
    ///
    /// # Returns
    ///
    /// Returns the new step, carrying the mount and its metadata label.
    ///
    /// # Errors
    ///
    /// Returns an error if the import or the replacement of the mount path
    /// fails. No label is attached in that case.
    pub async fn mount<S: BuildStep>(self, step: &S, cancel: &CancellationToken) -> Result<S> {
        let mut metadata = self.metadata;
        let remote_key = self.cache.mount_remote_key(step, &metadata).await?;
        let path = self.cache.mount_path(step, &metadata)?;

        let span = info_span!("remote_cache.mount", cache.key = %remote_key, cache.path = %path);
        async move {
            let artifact = self.cache.backend().import(&remote_key, cancel).await?;
            metadata.cache_exists = !artifact.is_empty();

            let mut next = match self.target {
                MountTarget::Volume => {
                    let options = MountOptions::default().with_owner(metadata.owner.clone());
                    let volume = CacheVolume::new(remote_key.as_str());
                    step.with_mounted_cache(&path, &volume, &options)
                }
                MountTarget::Directory => step.with_exec(&["mkdir", "-p", &path]),
            };

            if metadata.cache_exists {
                info!(entries = artifact.len(), "restoring cache from remote");
                next = replace_contents(&next, &path, &artifact, &remote_key)
                    .sync(cancel)
                    .await?;
            } else {
                debug!("no remote cache, starting cold");
            }

            if self.target == MountTarget::Directory && !metadata.owner.is_empty() {
                next = next.with_exec(&["chown", &metadata.owner, &path]);
            }

            let label = metadata.to_label()?;
            Ok::<_, Error>(next.with_label(&label_name(&remote_key), &label))
        }
        .instrument(span)
        .await
    }
}
