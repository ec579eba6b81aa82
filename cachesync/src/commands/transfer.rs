//! Direct access to single remote cache objects.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context as _, Result};
use cachesync_core::remote_cache::{Artifact, ArtifactVerifier, RemoteKey};
use cachesync_core::RemoteCache;

use crate::formatting::{
    create_spinner, format_bytes, format_duration, print_key_value, print_success, print_warning,
};

use super::{parse_platform, runtime, Context};

fn resolve_key(
    ctx: &Context,
    key: &str,
    platform: Option<&str>,
) -> Result<(RemoteCache, RemoteKey)> {
    let cache = ctx.remote_cache()?;
    let platform = parse_platform(platform)?;
    let remote_key = cache.remote_key(key, platform.as_ref())?;
    Ok((cache, remote_key))
}

fn require_enabled(cache: &RemoteCache) -> Result<()> {
    if !cache.is_enabled() {
        anyhow::bail!("No remote cache configured. Set `registry` in the config file or CACHESYNC_REGISTRY");
    }
    Ok(())
}

/// Prints the remote address of a cache key.
pub fn cmd_address(ctx: &Context, key: String, platform: Option<String>) -> Result<()> {
    let (cache, remote_key) = resolve_key(ctx, &key, platform.as_deref())?;
    require_enabled(&cache)?;
    println!("{}", cache.backend().describe(&remote_key));
    Ok(())
}

/// Checks whether a cache key exists remotely. Exits non-zero when it does not.
pub fn cmd_probe(ctx: &Context, key: String, platform: Option<String>) -> Result<()> {
    let (cache, remote_key) = resolve_key(ctx, &key, platform.as_deref())?;
    require_enabled(&cache)?;

    let (rt, cancel) = runtime()?;
    let exists = rt.block_on(cache.backend().exists(&remote_key, &cancel));
    let address = cache.backend().describe(&remote_key);

    if exists {
        print_success(&format!("{} is cached", address));
        Ok(())
    } else {
        print_warning(&format!("{} is not cached", address));
        std::process::exit(1);
    }
}

/// Downloads a cache key and replaces the contents of `dir` with it.
pub fn cmd_pull(ctx: &Context, key: String, dir: PathBuf, platform: Option<String>) -> Result<()> {
    let start = Instant::now();
    let (cache, remote_key) = resolve_key(ctx, &key, platform.as_deref())?;
    require_enabled(&cache)?;

    let (rt, cancel) = runtime()?;
    let pb = create_spinner(&format!("Pulling {}", remote_key), ctx.quiet);
    let artifact = rt.block_on(cache.backend().import(&remote_key, &cancel));
    pb.finish_and_clear();
    let artifact = artifact.with_context(|| format!("Failed to pull {}", remote_key))?;

    if artifact.is_empty() {
        print_warning(&format!("{} is not cached, leaving {} untouched", remote_key, dir.display()));
        return Ok(());
    }

    clear_dir(&dir)?;
    artifact
        .extract_to(&dir, false)
        .with_context(|| format!("Failed to extract into {}", dir.display()))?;

    print_success(&format!("Restored {} into {}", remote_key, dir.display()));
    print_key_value("Entries", &artifact.len().to_string());
    print_key_value("Size", &format_bytes(artifact.manifest().total_size));
    print_key_value("Took", &format_duration(start.elapsed()));
    Ok(())
}

/// Uploads the contents of `dir` under a cache key.
pub fn cmd_push(ctx: &Context, key: String, dir: PathBuf, platform: Option<String>) -> Result<()> {
    let start = Instant::now();
    let (cache, remote_key) = resolve_key(ctx, &key, platform.as_deref())?;
    require_enabled(&cache)?;

    let artifact = Artifact::from_dir(&dir)
        .with_context(|| format!("Failed to pack {}", dir.display()))?;
    if let Some(max_size) = ctx.config.max_artifact_size {
        ArtifactVerifier::verify_size(&artifact, max_size)?;
    }

    let (rt, cancel) = runtime()?;
    let pb = create_spinner(&format!("Pushing {}", remote_key), ctx.quiet);
    let result = rt.block_on(cache.backend().export(&remote_key, &artifact, &cancel));
    pb.finish_and_clear();
    result.with_context(|| format!("Failed to push {}", remote_key))?;

    print_success(&format!("Pushed {}", cache.backend().describe(&remote_key)));
    print_key_value("Entries", &artifact.len().to_string());
    print_key_value("Compressed", &format_bytes(artifact.compressed_data().len() as u64));
    print_key_value("Took", &format_duration(start.elapsed()));
    Ok(())
}

/// Empties `dir`, creating it if needed.
fn clear_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
