use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cachesync_core::step::{BuildStep, CacheVolume, MountOptions};
use cachesync_core::{Artifact, CancellationToken, Error, Platform, Result};
use tracing::debug;
use uuid::Uuid;

use crate::ops::{MountSource, MountTable, Op, OpKind};

const VOLUMES_DIR: &str = "volumes";
const STEPS_DIR: &str = "steps";
const SCRATCH_DIR: &str = "scratch";

/// Engine state rooted at one host directory.
///
/// ```text
/// <root>/volumes/<name>   cache volumes, persistent
/// <root>/steps/<id>       step filesystems
/// <root>/scratch/<id>     directories attached with `with_directory`
/// ```
#[derive(Debug, Clone)]
pub struct LocalEngine {
    root: PathBuf,
}

impl LocalEngine {
    /// Opens (and creates if needed) an engine rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine directories cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [VOLUMES_DIR, STEPS_DIR, SCRATCH_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host directory backing a cache volume.
    ///
    /// The name always maps to a single entry directly under the volumes
    /// directory: separators become `_`, and names made only of dots are
    /// prefixed so they cannot refer to a parent.
    pub fn volume_path(&self, volume: &CacheVolume) -> PathBuf {
        let mut name: String = volume
            .name()
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
            .collect();
        if name.chars().all(|c| c == '.') {
            name.insert(0, '_');
        }
        self.root.join(VOLUMES_DIR).join(name)
    }

    /// Creates an empty step with its own filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the step directory cannot be created.
    pub fn step(&self) -> Result<LocalStep> {
        let rootfs = self.root.join(STEPS_DIR).join(Uuid::new_v4().to_string());
        fs::create_dir_all(&rootfs)?;
        debug!(rootfs = %rootfs.display(), "created step");

        Ok(LocalStep {
            engine: self.clone(),
            rootfs,
            platform: Platform::host(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            mounts: MountTable::default(),
            pending: Vec::new(),
        })
    }

    /// Deletes a step filesystem. Cache volumes are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn remove_step(&self, step: &LocalStep) -> Result<()> {
        match fs::remove_dir_all(&step.rootfs) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn scratch_dir(&self) -> PathBuf {
        self.root
            .join(SCRATCH_DIR)
            .join(Uuid::new_v4().to_string())
    }
}

/// A lazily evaluated step running on the host.
///
/// Commands run with the step filesystem as working directory. Absolute
/// paths among their arguments are rebased onto the step filesystem or the
/// mount that contains them; the program itself is looked up as usual.
#[derive(Debug, Clone)]
pub struct LocalStep {
    engine: LocalEngine,
    rootfs: PathBuf,
    platform: Platform,
    env: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    mounts: MountTable,
    pending: Vec<Arc<Op>>,
}

impl LocalStep {
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Returns a copy that reports `platform` instead of the host platform.
    pub fn with_platform(&self, platform: Platform) -> Self {
        Self {
            platform,
            ..self.clone()
        }
    }

    pub fn with_env_variable(&self, name: &str, value: &str) -> Self {
        let mut next = self.clone();
        next.env.insert(name.to_string(), value.to_string());
        next
    }

    /// Maps a path inside the step to the host directory holding it.
    pub fn host_path(&self, path: &str) -> PathBuf {
        self.mounts.resolve(&self.rootfs, path)
    }

    /// Checks if every queued operation has run.
    pub fn is_resolved(&self) -> bool {
        self.pending.iter().all(|op| op.is_done())
    }

    fn queue(mut self, kind: OpKind) -> Self {
        self.pending.push(Op::new(kind));
        self
    }
}

#[async_trait]
impl BuildStep for LocalStep {
    fn with_mounted_cache(
        &self,
        path: &str,
        volume: &CacheVolume,
        options: &MountOptions,
    ) -> Self {
        let host = self.engine.volume_path(volume);
        let mut next = self.clone();
        next.mounts.insert(
            path,
            MountSource {
                host: host.clone(),
                ephemeral: false,
            },
        );
        next.queue(OpKind::CreateDir {
            dir: host,
            owner: options.owner.clone(),
        })
    }

    fn with_directory(&self, path: &str, artifact: &Artifact) -> Self {
        let dest = self.engine.scratch_dir();
        let mut next = self.clone();
        next.mounts.insert(
            path,
            MountSource {
                host: dest.clone(),
                ephemeral: true,
            },
        );
        next.queue(OpKind::Extract {
            artifact: artifact.clone(),
            dest,
        })
    }

    fn without_mount(&self, path: &str) -> Self {
        let mut next = self.clone();
        match next.mounts.remove(path) {
            Some(source) if source.ephemeral => next.queue(OpKind::RemoveDir { dir: source.host }),
            _ => next,
        }
    }

    fn with_exec(&self, args: &[&str]) -> Self {
        let translated = args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                if i > 0 && arg.starts_with('/') {
                    self.host_path(arg).to_string_lossy().into_owned()
                } else {
                    arg.to_string()
                }
            })
            .collect();

        self.clone().queue(OpKind::Exec {
            display: args.join(" "),
            args: translated,
            env: self.env.clone(),
            cwd: self.rootfs.clone(),
        })
    }

    fn with_label(&self, name: &str, value: &str) -> Self {
        let mut next = self.clone();
        next.labels.insert(name.to_string(), value.to_string());
        next
    }

    fn without_label(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.labels.remove(name);
        next
    }

    fn env_variable(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }

    async fn labels(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.labels.clone())
    }

    async fn platform(&self) -> Result<Platform> {
        Ok(self.platform.clone())
    }

    async fn sync(&self, cancel: &CancellationToken) -> Result<Self> {
        for op in &self.pending {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            op.run(cancel).await?;
        }

        Ok(Self {
            pending: Vec::new(),
            ..self.clone()
        })
    }

    async fn directory(&self, path: &str, cancel: &CancellationToken) -> Result<Artifact> {
        let resolved = self.sync(cancel).await?;
        let host = resolved.host_path(path);
        if !host.is_dir() {
            return Err(Error::PathNotFound(PathBuf::from(path)));
        }

        tokio::task::spawn_blocking(move || Artifact::from_dir(&host))
            .await
            .map_err(|e| Error::Step(format!("Snapshot task failed: {}", e)))?
    }
}
