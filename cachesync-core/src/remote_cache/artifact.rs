//! Portable filesystem subtrees exchanged with the backing store.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};

const COMPRESSION_LEVEL: i32 = 3;

/// Kind of an entry stored in an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Manifest record for a single artifact entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: EntryKind,
    /// Content size in bytes (zero for directories and symlinks).
    pub size: u64,
    /// SHA-256 of the file content, for regular files only.
    pub sha256: Option<String>,
}

/// Manifest of the entries contained in an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Map of relative paths to entry records.
    pub entries: BTreeMap<PathBuf, ManifestEntry>,
    /// Total size of all files (uncompressed).
    pub total_size: u64,
}

impl ArtifactManifest {
    fn record(&mut self, path: PathBuf, kind: EntryKind, content: Option<&[u8]>) {
        let size = content.map(|c| c.len() as u64).unwrap_or(0);
        let sha256 = content.map(sha256_hex);
        self.total_size += size;
        self.entries.insert(path, ManifestEntry { kind, size, sha256 });
    }
}

/// A directory tree packed as a zstd-compressed tar stream.
///
/// Entries keep their mode, ownership and modification time. Symlinks are
/// stored as links. Cloning is cheap; the compressed payload is shared.
#[derive(Debug, Clone)]
pub struct Artifact {
    manifest: ArtifactManifest,
    compressed_data: Arc<[u8]>,
    diff_id: String,
}

impl Artifact {
    /// Returns an artifact with no entries.
    ///
    /// This is what a cache miss looks like.
    pub fn empty() -> Self {
        Self {
            manifest: ArtifactManifest::default(),
            compressed_data: Arc::from(Vec::new()),
            diff_id: String::new(),
        }
    }

    /// Packs the contents of a directory. The directory itself is not an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be walked or read.
    pub fn from_dir(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::PathNotFound(root.to_path_buf()));
        }

        let mut manifest = ArtifactManifest::default();
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);

        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry
                .map_err(|e| Error::Artifact(format!("Failed to walk {}: {}", root.display(), e)))?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| Error::Artifact(format!("Unexpected path outside root: {}", e)))?
                .to_path_buf();
            let file_type = entry.file_type();

            if file_type.is_dir() {
                manifest.record(relative.clone(), EntryKind::Directory, None);
            } else if file_type.is_symlink() {
                manifest.record(relative.clone(), EntryKind::Symlink, None);
            } else if file_type.is_file() {
                let content = fs::read(entry.path())?;
                manifest.record(relative.clone(), EntryKind::File, Some(&content));
            } else {
                debug!(path = %entry.path().display(), "skipping special file");
                continue;
            }

            builder
                .append_path_with_name(entry.path(), &relative)
                .map_err(|e| {
                    Error::Artifact(format!("Failed to append {}: {}", relative.display(), e))
                })?;
        }

        let tar_data = builder
            .into_inner()
            .map_err(|e| Error::Artifact(format!("Failed to finish tar archive: {}", e)))?;
        let diff_id = format!("sha256:{}", sha256_hex(&tar_data));

        let compressed_data = zstd::encode_all(&tar_data[..], COMPRESSION_LEVEL)
            .map_err(|e| Error::Artifact(format!("Failed to compress artifact: {}", e)))?;

        Ok(Self {
            manifest,
            compressed_data: Arc::from(compressed_data),
            diff_id,
        })
    }

    /// Reads an artifact from compressed data.
    ///
    /// Zero-length data is treated as the empty artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if decompression or archive parsing fails.
    pub fn from_compressed(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::empty());
        }

        let tar_data = zstd::decode_all(&data[..])
            .map_err(|e| Error::Artifact(format!("Failed to decompress artifact: {}", e)))?;

        let mut manifest = ArtifactManifest::default();
        let mut archive = tar::Archive::new(&tar_data[..]);
        let entries = archive
            .entries()
            .map_err(|e| Error::Artifact(format!("Failed to read tar archive: {}", e)))?;

        for entry_result in entries {
            let mut entry = entry_result
                .map_err(|e| Error::Artifact(format!("Failed to read tar entry: {}", e)))?;
            let path = entry
                .path()
                .map_err(|e| Error::Artifact(format!("Failed to get entry path: {}", e)))?
                .into_owned();
            let relative = path.strip_prefix(".").unwrap_or(&path).to_path_buf();
            if relative.as_os_str().is_empty() {
                continue;
            }

            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                manifest.record(relative, EntryKind::Directory, None);
            } else if entry_type.is_symlink() || entry_type.is_hard_link() {
                manifest.record(relative, EntryKind::Symlink, None);
            } else if entry_type.is_file() {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).map_err(|e| {
                    Error::Artifact(format!("Failed to read {}: {}", relative.display(), e))
                })?;
                manifest.record(relative, EntryKind::File, Some(&content));
            }
        }

        Ok(Self {
            manifest,
            diff_id: format!("sha256:{}", sha256_hex(&tar_data)),
            compressed_data: Arc::from(data),
        })
    }

    /// Returns `true` if the artifact has no entries.
    pub fn is_empty(&self) -> bool {
        self.manifest.entries.is_empty()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.manifest.entries.len()
    }

    /// Returns the artifact manifest.
    pub fn manifest(&self) -> &ArtifactManifest {
        &self.manifest
    }

    /// Returns the relative paths of all entries, sorted.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.manifest.entries.keys().map(PathBuf::as_path)
    }

    /// Returns the compressed artifact data.
    pub fn compressed_data(&self) -> &[u8] {
        &self.compressed_data
    }

    /// Returns the digest of the uncompressed tar stream (`sha256:<hex>`).
    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    /// Computes the SHA-256 hash of the compressed artifact.
    pub fn hash(&self) -> String {
        sha256_hex(&self.compressed_data)
    }

    /// Unpacks the artifact into `dest`, creating it if needed.
    ///
    /// Modes and modification times are always restored. Ownership is only
    /// restored when `preserve_ownership` is set, which requires privileges.
    ///
    /// # Errors
    ///
    /// Returns an error if decompression or unpacking fails.
    pub fn extract_to(&self, dest: &Path, preserve_ownership: bool) -> Result<()> {
        fs::create_dir_all(dest)?;
        if self.is_empty() {
            return Ok(());
        }

        let tar_data = zstd::decode_all(&self.compressed_data[..])
            .map_err(|e| Error::Artifact(format!("Failed to decompress artifact: {}", e)))?;

        let mut archive = tar::Archive::new(&tar_data[..]);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_preserve_ownerships(preserve_ownership);
        archive.set_overwrite(true);
        archive.unpack(dest).map_err(|e| {
            Error::Artifact(format!("Failed to extract into {}: {}", dest.display(), e))
        })?;

        Ok(())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
