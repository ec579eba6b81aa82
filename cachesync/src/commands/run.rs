//! Running a command with remote-backed cache volumes.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{Context as _, Result};
use cachesync_core::BuildStep;
use cachesync_engine::LocalEngine;
use tracing::warn;

use crate::formatting::{
    create_spinner, format_duration, print_export_table, print_section_header, print_success,
    print_summary_box, print_warning, SectionStyle,
};

use super::{runtime, Context};

/// A `--cache` argument: `PATH=KEY[,OPTION...]`.
///
/// Options are `platform`, `force`, `expand`, `dir` and `owner=UID:GID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSpec {
    pub path: String,
    pub key: String,
    pub platform_aware: bool,
    pub force_export: bool,
    pub expand: bool,
    /// Restore into the step filesystem instead of a cache volume.
    pub directory: bool,
    pub owner: Option<String>,
}

impl FromStr for CacheSpec {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let (path, rest) = value
            .split_once('=')
            .ok_or_else(|| format!("expected PATH=KEY[,OPTION...], got '{}'", value))?;
        let mut options = rest.split(',');
        let key = options.next().unwrap_or_default();
        if path.is_empty() || key.is_empty() {
            return Err(format!("cache path and key must not be empty in '{}'", value));
        }

        let mut spec = CacheSpec {
            path: path.to_string(),
            key: key.to_string(),
            platform_aware: false,
            force_export: false,
            expand: false,
            directory: false,
            owner: None,
        };

        for option in options {
            match option {
                "platform" => spec.platform_aware = true,
                "force" => spec.force_export = true,
                "expand" => spec.expand = true,
                "dir" => spec.directory = true,
                other => match other.strip_prefix("owner=") {
                    Some(owner) if !owner.is_empty() => spec.owner = Some(owner.to_string()),
                    _ => return Err(format!("unknown cache option '{}'", other)),
                },
            }
        }

        Ok(spec)
    }
}

/// Parses a `NAME=VALUE` environment argument.
pub fn parse_env(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", value)),
    }
}

/// Mounts the requested caches, runs `command` and exports what changed.
///
/// # Arguments
///
/// * `ctx` - Loaded configuration
/// * `caches` - Caches to mount before running
/// * `env` - Environment of the command
/// * `state` - Engine state directory; defaults to the user cache directory
/// * `keep` - Keep the step filesystem after the run
/// * `command` - Program and arguments
pub fn cmd_run(
    ctx: &Context,
    caches: Vec<CacheSpec>,
    env: Vec<(String, String)>,
    state: Option<PathBuf>,
    keep: bool,
    command: Vec<String>,
) -> Result<()> {
    let start = Instant::now();
    let cache = ctx.remote_cache()?;
    if !cache.is_enabled() {
        print_warning("No remote cache configured, using local volumes only");
    }

    let state = state
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("cachesync")))
        .ok_or_else(|| anyhow::anyhow!("No cache directory available, pass --state"))?;
    let engine = LocalEngine::new(state.clone())
        .with_context(|| format!("Failed to open engine state at {}", state.display()))?;

    let (rt, cancel) = runtime()?;

    let base = engine.step()?;
    let result = rt.block_on(async {
        let mut step = base.clone();
        for (name, value) in &env {
            step = step.with_env_variable(name, value);
        }

        if !caches.is_empty() {
            print_section_header("Mounting caches", SectionStyle::Primary);
        }
        for spec in &caches {
            let mount = if spec.directory {
                cache.mounted_directory(&spec.path, &spec.key)
            } else {
                cache.cache_volume(&spec.path, &spec.key)
            }
            .platform_aware(spec.platform_aware)
            .force_export(spec.force_export)
            .expand(spec.expand);
            let mount = match &spec.owner {
                Some(owner) => mount.owner(owner.clone()),
                None => mount,
            };

            let pb = create_spinner(&format!("Mounting {}", spec.key), ctx.quiet);
            let mounted = mount.mount(&step, &cancel).await;
            pb.finish_and_clear();
            step = mounted.with_context(|| format!("Failed to mount cache {}", spec.key))?;
            print_success(&format!("Mounted {} at {}", spec.key, spec.path));
        }
        println!();

        print_section_header(&command.join(" "), SectionStyle::Secondary);
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        let step = step
            .with_exec(&args)
            .sync(&cancel)
            .await
            .context("Command failed")?;

        let pb = create_spinner("Exporting caches", ctx.quiet);
        let exported = cache.export(&step, &cancel).await;
        pb.finish_and_clear();
        Ok::<_, anyhow::Error>(exported?)
    });

    // Derived steps share the base filesystem, so this also covers early exits.
    if !keep {
        if let Err(e) = engine.remove_step(&base) {
            warn!(rootfs = %base.rootfs().display(), error = %e, "failed to remove step filesystem");
        }
    }
    let (_, report) = result?;

    if !report.is_empty() {
        print_export_table(&report);
        println!();
    }
    print_summary_box(
        "Run",
        &[
            ("Exported", &report.exported().to_string()),
            ("Skipped", &report.skipped().to_string()),
            ("Failed", &report.failed().to_string()),
            ("Took", &format_duration(start.elapsed())),
        ],
    );

    if !report.is_success() {
        print_warning(&format!("{} cache(s) failed to export", report.failed()));
        std::process::exit(1);
    }
    Ok(())
}
