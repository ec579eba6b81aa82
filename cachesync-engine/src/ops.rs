use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use cachesync_core::{Artifact, CancellationToken, Error, Result};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Host directory backing a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountSource {
    pub(crate) host: PathBuf,
    /// Scratch directories are removed when unmounted; volumes persist.
    pub(crate) ephemeral: bool,
}

/// Mount points of a step, keyed by their path inside the step.
#[derive(Debug, Clone, Default)]
pub(crate) struct MountTable {
    entries: Vec<(String, MountSource)>,
}

impl MountTable {
    pub(crate) fn insert(&mut self, path: &str, source: MountSource) {
        let path = normalize(path);
        self.entries.retain(|(mounted, _)| *mounted != path);
        self.entries.push((path, source));
    }

    pub(crate) fn remove(&mut self, path: &str) -> Option<MountSource> {
        let path = normalize(path);
        let index = self.entries.iter().position(|(mounted, _)| *mounted == path)?;
        Some(self.entries.remove(index).1)
    }

    /// Maps an absolute step path to the host, using the deepest mount that
    /// contains it and falling back to the step root.
    pub(crate) fn resolve(&self, rootfs: &Path, path: &str) -> PathBuf {
        let path = normalize(path);
        let deepest = self
            .entries
            .iter()
            .filter(|(mounted, _)| contains(mounted, &path))
            .max_by_key(|(mounted, _)| mounted.len());

        match deepest {
            Some((mounted, source)) => {
                let rest = path[mounted.len()..].trim_start_matches('/');
                if rest.is_empty() {
                    source.host.clone()
                } else {
                    source.host.join(rest)
                }
            }
            None => rootfs.join(path.trim_start_matches('/')),
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn contains(mounted: &str, path: &str) -> bool {
    mounted == "/"
        || path == mounted
        || path
            .strip_prefix(mounted)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug)]
pub(crate) enum OpKind {
    CreateDir {
        dir: PathBuf,
        owner: Option<String>,
    },
    Extract {
        artifact: Artifact,
        dest: PathBuf,
    },
    Exec {
        /// Command as written by the caller, for logs and errors.
        display: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: PathBuf,
    },
    RemoveDir {
        dir: PathBuf,
    },
}

/// A queued operation. Steps derived from one another share their common
/// operations, so each runs at most once successfully.
#[derive(Debug)]
pub(crate) struct Op {
    kind: OpKind,
    done: OnceCell<()>,
}

impl Op {
    pub(crate) fn new(kind: OpKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            done: OnceCell::new(),
        })
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.initialized()
    }

    pub(crate) async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.done
            .get_or_try_init(|| self.kind.execute(cancel))
            .await
            .map(|_| ())
    }
}

impl OpKind {
    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match self {
            OpKind::CreateDir { dir, owner } => {
                tokio::fs::create_dir_all(dir).await?;
                if let Some(owner) = owner {
                    apply_owner(dir, owner);
                }
                Ok(())
            }
            OpKind::Extract { artifact, dest } => {
                let artifact = artifact.clone();
                let dest = dest.clone();
                tokio::task::spawn_blocking(move || artifact.extract_to(&dest, false))
                    .await
                    .map_err(|e| Error::Step(format!("Extraction task failed: {}", e)))?
            }
            OpKind::Exec {
                display,
                args,
                env,
                cwd,
            } => exec(display, args, env, cwd, cancel).await,
            OpKind::RemoveDir { dir } => match tokio::fs::remove_dir_all(dir).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        }
    }
}

async fn exec(
    command_display: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    cwd: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| Error::Step("Cannot run an empty command".to_string()))?;

    debug!(command = command_display, "running command");
    let mut command = Command::new(program);
    command
        .args(rest)
        .envs(env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        output = command.output() => output.map_err(|e| {
            Error::Step(format!("Failed to execute `{}`: {}", command_display, e))
        })?,
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        debug!(command = command_display, stdout = %stdout.trim(), "command output");
    }

    if !output.status.success() {
        return Err(Error::Exec {
            command: command_display.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Changes ownership of a mount point. Only numeric `uid[:gid]` owners are
/// applied; anything else, or a lack of privileges, leaves it unchanged.
#[cfg(unix)]
fn apply_owner(dir: &Path, owner: &str) {
    let (user, group) = owner.split_once(':').unwrap_or((owner, owner));
    match (user.parse::<u32>(), group.parse::<u32>()) {
        (Ok(uid), Ok(gid)) => {
            if let Err(e) = std::os::unix::fs::chown(dir, Some(uid), Some(gid)) {
                warn!(owner, dir = %dir.display(), error = %e, "failed to change mount owner");
            }
        }
        _ => warn!(owner, "only numeric owners are supported, leaving mount owner unchanged"),
    }
}

#[cfg(not(unix))]
fn apply_owner(_dir: &Path, owner: &str) {
    warn!(owner, "mount owners are not supported on this host");
}
