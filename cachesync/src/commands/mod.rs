//! Command implementations for the CLI.

mod config;
mod run;
mod transfer;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use cachesync_core::{CancellationToken, Platform, RemoteCache, RemoteCacheConfig};
use tracing::info;

pub use config::cmd_config;
pub use run::{cmd_run, parse_env, CacheSpec};
pub use transfer::{cmd_address, cmd_probe, cmd_pull, cmd_push};

/// Settings shared by every command.
pub struct Context {
    pub config: RemoteCacheConfig,
    pub config_path: Option<PathBuf>,
    pub quiet: bool,
}

impl Context {
    /// Loads the configuration file, then overlays the environment and the
    /// command line.
    pub fn load(config_path: Option<PathBuf>, pipeline: Option<String>, quiet: bool) -> Result<Self> {
        let config_path = config_path.or_else(RemoteCacheConfig::default_path);
        let mut config = match &config_path {
            Some(path) => RemoteCacheConfig::load_or_default(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => RemoteCacheConfig::default(),
        }
        .apply_env();

        if let Some(pipeline) = pipeline {
            config.pipeline = pipeline;
        }
        if config.pipeline.trim().is_empty() {
            if let Some(pipeline) = default_pipeline() {
                info!(pipeline = %pipeline, "no pipeline configured, using directory name");
                config.pipeline = pipeline;
            }
        }

        Ok(Self {
            config,
            config_path,
            quiet,
        })
    }

    fn remote_cache(&self) -> Result<RemoteCache> {
        RemoteCache::from_config(&self.config).context("Failed to set up remote cache")
    }
}

fn default_pipeline() -> Option<String> {
    std::env::current_dir()
        .ok()?
        .file_name()?
        .to_str()
        .map(str::to_string)
}

fn parse_platform(platform: Option<&str>) -> Result<Option<Platform>> {
    platform
        .map(|value| Platform::new(value).map_err(anyhow::Error::from))
        .transpose()
}

/// Creates the async runtime and a token cancelled on Ctrl+C.
fn runtime() -> Result<(tokio::runtime::Runtime, CancellationToken)> {
    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| anyhow::anyhow!("Failed to create tokio runtime: {}", e))?;

    let cancel = CancellationToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || handler.cancel())
        .map_err(|e| anyhow::anyhow!("Failed to set signal handler: {}", e))?;

    Ok((rt, cancel))
}
