//! Deterministic remote key derivation for cache volumes.

use std::fmt;

use crate::error::{Error, Result};
use crate::platform::Platform;

/// Inputs a key formatter derives a remote key from.
#[derive(Debug, Clone, Copy)]
pub struct KeyParts<'a> {
    /// Name of the owning build pipeline.
    pub pipeline: &'a str,
    /// Logical cache key supplied by the caller.
    pub key: &'a str,
    /// Platform qualifier, present only for platform-aware mounts.
    pub platform: Option<&'a Platform>,
}

/// Signature of a remote key formatting function.
pub type FormatFn = fn(&KeyParts<'_>) -> String;

/// Remote key (the tag part of a remote address).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemoteKey(String);

impl RemoteKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Turns a pipeline name, a logical key and an optional platform into a
/// [`RemoteKey`].
///
/// The default layout is `<pipeline>-<key>[-<platform suffix>]`. A custom
/// function can be installed with [`KeyFormatter::custom`].
#[derive(Clone, Copy)]
pub struct KeyFormatter {
    format: FormatFn,
}

impl KeyFormatter {
    /// Creates a formatter using a caller-provided function.
    pub fn custom(format: FormatFn) -> Self {
        Self { format }
    }

    /// Derives the remote key for a mount.
    ///
    /// # Arguments
    ///
    /// * `pipeline` - Name of the owning build pipeline
    /// * `key` - Logical cache key
    /// * `platform` - Platform qualifier for platform-aware mounts, `None` otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline name or the key is empty.
    pub fn remote_key(
        &self,
        pipeline: &str,
        key: &str,
        platform: Option<&Platform>,
    ) -> Result<RemoteKey> {
        if pipeline.is_empty() {
            return Err(Error::Config(
                "Pipeline name is required to derive remote cache keys".to_string(),
            ));
        }
        if key.is_empty() {
            return Err(Error::Config("Cache key must not be empty".to_string()));
        }

        let parts = KeyParts {
            pipeline,
            key,
            platform,
        };
        Ok(RemoteKey((self.format)(&parts)))
    }
}

impl Default for KeyFormatter {
    fn default() -> Self {
        Self {
            format: default_remote_key,
        }
    }
}

impl fmt::Debug for KeyFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFormatter").finish_non_exhaustive()
    }
}

/// Default remote key layout: `<pipeline>-<key>[-<os>-<arch>[-<variant>]]`.
pub fn default_remote_key(parts: &KeyParts<'_>) -> String {
    match parts.platform {
        Some(platform) => format!("{}-{}-{}", parts.pipeline, parts.key, platform.suffix()),
        None => format!("{}-{}", parts.pipeline, parts.key),
    }
}

/// Composes the fully-qualified address of a remote key: `<registry>/<repo>:<key>`.
pub fn cache_key_addr(registry: &str, repo: &str, key: &RemoteKey) -> String {
    format!("{}/{}:{}", registry, repo, key)
}

/// Derives the fully-qualified remote address for a logical cache key.
///
/// # Errors
///
/// Returns an error if the pipeline name or the key is empty.
pub fn format_address(
    registry: &str,
    repo: &str,
    pipeline: &str,
    key: &str,
    platform: Option<&Platform>,
) -> Result<String> {
    let remote_key = KeyFormatter::default().remote_key(pipeline, key, platform)?;
    Ok(cache_key_addr(registry, repo, &remote_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let address = format_address("registry.local", "team/cache", "ci", "apt-cache", None).unwrap();
        assert_eq!(address, "registry.local/team/cache:ci-apt-cache");
    }

    #[test]
    fn test_platform_suffix() {
        let platform = Platform::new("linux/amd64").unwrap();
        let address =
            format_address("ghcr.io", "acme/cache", "ci", "go-mod", Some(&platform)).unwrap();
        assert_eq!(address, "ghcr.io/acme/cache:ci-go-mod-linux-amd64");
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let result = KeyFormatter::default().remote_key("", "apt-cache", None);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_custom_formatter() {
        fn arch_only(parts: &KeyParts<'_>) -> String {
            let arch = parts.platform.map(|p| p.architecture()).unwrap_or("any");
            format!("{}-{}", parts.key, arch)
        }

        let formatter = KeyFormatter::custom(arch_only);
        let platform = Platform::new("linux/arm64").unwrap();
        let key = formatter.remote_key("ci", "ccache", Some(&platform)).unwrap();
        assert_eq!(key.as_str(), "ccache-arm64");
    }
}
