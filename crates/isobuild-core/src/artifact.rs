//! Compiled artifact and the handoff between stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::inspect::Architecture;
use crate::{Error, Result};

/// Linkage of the artifact against the cryptography library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    /// No shared object of the library is requested at load time.
    Static,
    /// The artifact requests these shared objects.
    Dynamic { libraries: Vec<String> },
}

impl Linkage {
    pub fn is_static(&self) -> bool {
        matches!(self, Linkage::Static)
    }
}

/// The single executable produced by the builder stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    /// File name (e.g., "tws-rust").
    pub name: String,
    /// Path inside the build environment.
    pub source_path: String,
    /// Where the artifact was staged on the host after extraction.
    pub staged_path: PathBuf,
    pub architecture: Architecture,
    pub linkage: Linkage,
    pub stripped: bool,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the file contents, hex encoded.
    pub checksum: String,
    pub produced_at: DateTime<Utc>,
}

/// Size and SHA-256 of a file.
pub fn checksum_file(path: &Path) -> Result<(u64, String)> {
    let data = std::fs::read(path)?;
    let digest = Sha256::digest(&data);
    Ok((data.len() as u64, hex::encode(digest)))
}

/// The one-way edge from the builder stage to the runtime stage.
///
/// Deliberately not `Clone`: the runtime stage takes it by value, so an
/// artifact can be packaged at most once per run.
#[derive(Debug)]
pub struct ArtifactHandoff {
    artifact: CompiledArtifact,
    fingerprint: String,
}

impl ArtifactHandoff {
    pub fn new(artifact: CompiledArtifact, fingerprint: impl Into<String>) -> Self {
        Self {
            artifact,
            fingerprint: fingerprint.into(),
        }
    }

    pub fn artifact(&self) -> &CompiledArtifact {
        &self.artifact
    }

    /// Fingerprint of the build environment that produced the artifact.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Confirm the staged file is still the one the builder produced.
    pub fn verify_present(&self) -> Result<()> {
        let path = &self.artifact.staged_path;
        let metadata = std::fs::metadata(path).map_err(|e| {
            Error::ArtifactHandoff(format!("artifact missing at {}: {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(Error::ArtifactHandoff(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let (size, checksum) = checksum_file(path)?;
        if size != self.artifact.size || checksum != self.artifact.checksum {
            return Err(Error::ArtifactHandoff(format!(
                "artifact at {} changed after the build (expected sha256 {}, found {})",
                path.display(),
                self.artifact.checksum,
                checksum
            )));
        }
        Ok(())
    }

    pub fn into_parts(self) -> (CompiledArtifact, String) {
        (self.artifact, self.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(dir: &Path, contents: &[u8]) -> CompiledArtifact {
        let path = dir.join("tws-rust");
        std::fs::write(&path, contents).unwrap();
        let (size, checksum) = checksum_file(&path).unwrap();
        CompiledArtifact {
            name: "tws-rust".to_string(),
            source_path: "/build/target/release/tws-rust".to_string(),
            staged_path: path,
            architecture: Architecture::X86_64,
            linkage: Linkage::Static,
            stripped: true,
            size,
            checksum,
            produced_at: Utc::now(),
        }
    }

    #[test]
    fn test_checksum_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        std::fs::write(&path, b"abc").unwrap();

        let (size, checksum) = checksum_file(&path).unwrap();
        assert_eq!(size, 3);
        assert_eq!(
            checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_handoff_verifies_present_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let handoff = ArtifactHandoff::new(staged(dir.path(), b"\x7fELF"), "fp");
        assert!(handoff.verify_present().is_ok());
        assert_eq!(handoff.fingerprint(), "fp");
    }

    #[test]
    fn test_handoff_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = staged(dir.path(), b"\x7fELF");
        std::fs::remove_file(&artifact.staged_path).unwrap();

        let err = ArtifactHandoff::new(artifact, "fp")
            .verify_present()
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactHandoff(_)));
    }

    #[test]
    fn test_handoff_detects_stale_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = staged(dir.path(), b"\x7fELF-one");
        std::fs::write(&artifact.staged_path, b"\x7fELF-two").unwrap();

        let err = ArtifactHandoff::new(artifact, "fp")
            .verify_present()
            .unwrap_err();
        assert!(err.to_string().contains("changed after the build"));
    }

    #[test]
    fn test_handoff_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = staged(dir.path(), b"x");
        artifact.staged_path = dir.path().to_path_buf();

        let err = ArtifactHandoff::new(artifact, "fp")
            .verify_present()
            .unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }
}
