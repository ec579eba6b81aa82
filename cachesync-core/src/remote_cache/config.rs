//! Configuration for remote cache.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix selecting the filesystem backend instead of a registry.
pub const FILESYSTEM_SCHEME: &str = "file://";

const ENV_REGISTRY: &str = "CACHESYNC_REGISTRY";
const ENV_REPO: &str = "CACHESYNC_REPO";
const ENV_PIPELINE: &str = "CACHESYNC_PIPELINE";
const ENV_USERNAME: &str = "CACHESYNC_USERNAME";
const ENV_PASSWORD_ENV: &str = "CACHESYNC_PASSWORD_ENV";
const ENV_INSECURE: &str = "CACHESYNC_INSECURE";

/// Configuration for remote cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCacheConfig {
    /// Registry host (e.g. `ghcr.io`), or `file:///path` for a directory store.
    ///
    /// An empty or invalid value disables remote caching.
    pub registry: String,
    /// Repository path inside the registry.
    pub repo: String,
    /// Name of the owning build pipeline, used as a key namespace.
    pub pipeline: String,
    /// Registry username.
    pub username: Option<String>,
    /// Name of the environment variable holding the registry secret.
    pub password_env: Option<String>,
    /// Talk plain HTTP to the registry.
    pub insecure: bool,
    /// Retries for pull and push.
    pub max_retries: u32,
    /// Maximum artifact size in bytes (default: 1GB).
    pub max_artifact_size: Option<u64>,
    /// Skip uploads of keys that already exist remotely (tracked mounts).
    pub skip_if_exists: bool,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            registry: String::new(),
            repo: "cache".to_string(),
            pipeline: String::new(),
            username: None,
            password_env: None,
            insecure: false,
            max_retries: 3,
            max_artifact_size: Some(1024 * 1024 * 1024),
            skip_if_exists: false,
        }
    }
}

impl RemoteCacheConfig {
    /// Creates a new remote cache configuration.
    pub fn new(registry: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            repo: repo.into(),
            ..Default::default()
        }
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|error| Error::Toml {
            error,
            context: path.display().to_string(),
        })
    }

    /// Loads configuration from `path` if it exists, defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cachesync").join("config.toml"))
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Overlays `CACHESYNC_*` environment variables.
    pub fn apply_env(self) -> Self {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Overlays variables resolved through `lookup`.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(registry) = lookup(ENV_REGISTRY) {
            self.registry = registry;
        }
        if let Some(repo) = lookup(ENV_REPO) {
            self.repo = repo;
        }
        if let Some(pipeline) = lookup(ENV_PIPELINE) {
            self.pipeline = pipeline;
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.username = Some(username);
        }
        if let Some(password_env) = lookup(ENV_PASSWORD_ENV) {
            self.password_env = Some(password_env);
        }
        if let Some(insecure) = lookup(ENV_INSECURE) {
            self.insecure = matches!(insecure.as_str(), "1" | "true" | "yes");
        }
        self
    }

    /// Sets the pipeline name.
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = pipeline.into();
        self
    }

    /// Sets registry credentials; the secret is read from `password_env`.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password_env: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password_env = Some(password_env.into());
        self
    }

    /// Sets plain-HTTP mode.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Sets the retry count for transfers.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets maximum artifact size.
    pub fn max_artifact_size(mut self, size: u64) -> Self {
        self.max_artifact_size = Some(size);
        self
    }

    /// Sets skip-if-exists mode.
    pub fn skip_if_exists(mut self, skip: bool) -> Self {
        self.skip_if_exists = skip;
        self
    }

    /// Checks if remote caching is configured at all.
    pub fn is_enabled(&self) -> bool {
        !self.registry.trim().is_empty()
    }

    /// Checks if this is a filesystem backend.
    pub fn is_filesystem(&self) -> bool {
        self.registry.starts_with(FILESYSTEM_SCHEME)
    }

    /// Returns the root directory of a filesystem backend.
    pub fn filesystem_root(&self) -> Option<PathBuf> {
        self.registry
            .strip_prefix(FILESYSTEM_SCHEME)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    /// Checks that the registry root can form valid addresses.
    ///
    /// Hosts must be non-empty, carry no URL scheme and no whitespace.
    pub fn is_valid_registry(&self) -> bool {
        if self.is_filesystem() {
            return self.filesystem_root().is_some();
        }
        let registry = self.registry.trim();
        !registry.is_empty()
            && !registry.contains("://")
            && !registry.chars().any(char::is_whitespace)
            && !registry.starts_with('/')
            && !registry.ends_with('/')
    }

    /// Resolves the registry secret from the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns an error if a username is set but the secret is unavailable.
    pub fn resolve_password(&self) -> Result<Option<String>> {
        self.resolve_password_with(|name| std::env::var(name).ok())
    }

    /// Resolves the registry secret through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if a username is set but the secret is unavailable.
    pub fn resolve_password_with<F>(&self, lookup: F) -> Result<Option<String>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(username) = &self.username else {
            return Ok(None);
        };
        let var = self.password_env.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "Registry username '{}' is set but password_env is missing",
                username
            ))
        })?;
        lookup(var)
            .filter(|secret| !secret.is_empty())
            .map(Some)
            .ok_or_else(|| {
                Error::Config(format!(
                    "Registry secret variable {} is not set",
                    var
                ))
            })
    }
}
