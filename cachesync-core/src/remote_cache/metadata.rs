//! Mount metadata carried on build steps as labels.
//!
//! A mount records itself on the step under `MOUNT_LABEL_PREFIX + remote key`
//! so that a later export, possibly in another invocation, can find every
//! cache that was mounted on that step.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::key::RemoteKey;

/// Fixed prefix of every mount metadata label.
pub const MOUNT_LABEL_PREFIX: &str = "cachesync.remote-cache.mount.";

/// State of one mounted cache, as serialized into its label.
///
/// Field names are part of the label wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MountMetadata {
    /// Mount path inside the build step, unexpanded.
    pub path: String,
    /// Logical cache key.
    pub key: String,
    /// Whether the remote key carries the step platform.
    pub platform_aware: bool,
    /// Owner applied to the mount, `user[:group]`.
    pub owner: String,
    /// Whether `$VAR` references in the path are expanded.
    pub expand: bool,
    /// Whether the remote object existed at mount time. Never recomputed.
    pub cache_exists: bool,
    /// Export even when the remote object already existed.
    pub force_export: bool,
}

impl MountMetadata {
    pub fn new(path: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    /// Encodes the metadata as a label value.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_label(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Metadata {
            label: self.key.clone(),
            message: format!("Failed to serialize: {}", e),
        })
    }

    /// Decodes a label value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not valid metadata JSON.
    pub fn from_label(label: &str, value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|e| Error::Metadata {
            label: label.to_string(),
            message: e.to_string(),
        })
    }

    /// Returns `true` if export must not write this mount back.
    pub fn should_skip_export(&self) -> bool {
        self.cache_exists && !self.force_export
    }
}

/// Returns the label name recording a mount for `key`.
pub fn label_name(key: &RemoteKey) -> String {
    format!("{}{}", MOUNT_LABEL_PREFIX, key)
}

/// Returns the remote key part of a mount label, if `name` is one.
pub fn label_remote_key(name: &str) -> Option<&str> {
    name.strip_prefix(MOUNT_LABEL_PREFIX)
        .filter(|key| !key.is_empty())
}
