//! Boundary between the cache layer and a build execution engine.
//!
//! A [`BuildStep`] is an immutable, lazily evaluated description of work.
//! Every `with_*` call returns a new step; nothing touches a filesystem
//! until [`BuildStep::sync`] resolves the queued operations in order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::remote_cache::Artifact;

/// A named, host-persistent cache volume.
///
/// Volumes are shared by name across every step that mounts them. There is
/// no locking; concurrent writers to the same volume must coordinate
/// themselves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheVolume {
    name: String,
}

impl CacheVolume {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Options applied when a cache volume is attached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Owner of the mount point, `user[:group]`.
    pub owner: Option<String>,
}

impl MountOptions {
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        let owner = owner.into();
        self.owner = if owner.is_empty() { None } else { Some(owner) };
        self
    }
}

/// Operations the cache layer needs from an execution engine.
#[async_trait]
pub trait BuildStep: Clone + Send + Sync + 'static {
    /// Attaches a cache volume at `path`.
    fn with_mounted_cache(&self, path: &str, volume: &CacheVolume, options: &MountOptions)
        -> Self;

    /// Attaches a read-only copy of `artifact` at `path`.
    fn with_directory(&self, path: &str, artifact: &Artifact) -> Self;

    /// Detaches whatever is mounted at `path`.
    fn without_mount(&self, path: &str) -> Self;

    /// Queues a command. Arguments are passed verbatim, without a shell.
    fn with_exec(&self, args: &[&str]) -> Self;

    fn with_label(&self, name: &str, value: &str) -> Self;

    fn without_label(&self, name: &str) -> Self;

    /// Returns an environment variable defined on the step.
    fn env_variable(&self, name: &str) -> Option<String>;

    /// Returns all labels, sorted by name.
    async fn labels(&self) -> Result<BTreeMap<String, String>>;

    /// Returns the platform the step runs on.
    async fn platform(&self) -> Result<Platform>;

    /// Runs every queued operation and returns the resolved step.
    ///
    /// # Errors
    ///
    /// Returns the first failing operation's error, or [`Error::Cancelled`].
    async fn sync(&self, cancel: &CancellationToken) -> Result<Self>;

    /// Snapshots the subtree at `path` after resolving the step.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails or `path` does not exist.
    async fn directory(&self, path: &str, cancel: &CancellationToken) -> Result<Artifact>;
}

static VARIABLE_PATTERN: Lazy<std::result::Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))"));

/// Replaces `$VAR` and `${VAR}` in `path` with values from `lookup`.
///
/// Unknown variables expand to the empty string.
///
/// # Errors
///
/// Returns an error if the variable pattern cannot be compiled.
pub fn expand_path<F>(path: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = VARIABLE_PATTERN
        .as_ref()
        .map_err(|e| Error::Config(format!("Invalid variable pattern: {}", e)))?;

    let expanded = pattern.replace_all(path, |caps: &regex::Captures<'_>| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .and_then(|name| lookup(name.as_str()))
            .unwrap_or_default()
    });
    Ok(expanded.into_owned())
}
