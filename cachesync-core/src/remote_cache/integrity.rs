//! Integrity checks for artifacts moving through a backend.

use crate::error::{Error, Result};

use super::artifact::Artifact;

/// Verifies artifacts before they are trusted or written.
pub struct ArtifactVerifier;

impl ArtifactVerifier {
    /// Checks the SHA-256 hash of the compressed payload.
    ///
    /// # Arguments
    ///
    /// * `artifact` - The artifact to verify
    /// * `expected_hash` - Hex digest recorded when the artifact was stored
    ///
    /// # Errors
    ///
    /// Returns an error if the digests differ.
    pub fn verify(artifact: &Artifact, expected_hash: &str) -> Result<()> {
        let actual_hash = artifact.hash();
        if actual_hash != expected_hash {
            return Err(Error::Artifact(format!(
                "Artifact hash mismatch: expected {}, got {}",
                expected_hash, actual_hash
            )));
        }
        Ok(())
    }

    /// Checks the uncompressed size against a limit.
    ///
    /// This is a lightweight check that needs no extraction.
    pub fn verify_size(artifact: &Artifact, max_size: u64) -> Result<()> {
        let total_size = artifact.manifest().total_size;
        if total_size > max_size {
            return Err(Error::Artifact(format!(
                "Artifact size {} exceeds maximum {}",
                total_size, max_size
            )));
        }
        Ok(())
    }
}
