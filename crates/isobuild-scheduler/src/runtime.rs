//! Runtime stage: package the handed-off artifact into the runtime image.

use chrono::Utc;
use isobuild_core::Result;
use isobuild_core::artifact::ArtifactHandoff;
use isobuild_core::image::{AssemblyRequest, ImageAssembler, RuntimeImage};
use isobuild_core::pipeline::{RuntimeStageSpec, validate_image_tag};
use std::sync::Arc;
use tracing::info;

/// Builds the runtime image through an [`ImageAssembler`].
#[derive(Clone)]
pub struct RuntimeStage {
    assembler: Arc<dyn ImageAssembler>,
    tag: Option<String>,
}

impl RuntimeStage {
    pub fn new(assembler: Arc<dyn ImageAssembler>) -> Self {
        Self {
            assembler,
            tag: None,
        }
    }

    /// Tag every image with `tag`, overriding the configured one.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// `<pipeline>:<first 12 fingerprint digits>`.
    pub fn default_tag(pipeline: &str, fingerprint: &str) -> String {
        let short: String = fingerprint.chars().take(12).collect();
        format!("{}:{}", pipeline.to_lowercase(), short)
    }

    /// The tag an image for `spec` gets: the override, else the configured
    /// tag, else [`default_tag`](Self::default_tag). Fails if it is not a
    /// usable image reference.
    pub fn resolve_tag(
        &self,
        pipeline: &str,
        spec: &RuntimeStageSpec,
        fingerprint: &str,
    ) -> Result<String> {
        let tag = self
            .tag
            .clone()
            .or_else(|| spec.tag.clone())
            .unwrap_or_else(|| Self::default_tag(pipeline, fingerprint));
        validate_image_tag(&tag)?;
        Ok(tag)
    }

    /// Package `handoff`. Taking it by value ends the builder's claim on the
    /// artifact; a missing or modified file fails before any assembly starts.
    pub async fn package(
        &self,
        pipeline: &str,
        spec: &RuntimeStageSpec,
        handoff: ArtifactHandoff,
    ) -> Result<RuntimeImage> {
        handoff.verify_present()?;
        let tag = self.resolve_tag(pipeline, spec, handoff.fingerprint())?;
        let (artifact, fingerprint) = handoff.into_parts();

        let request = AssemblyRequest::new(spec.clone(), artifact, tag, pipeline, &fingerprint);
        info!(
            assembler = self.assembler.name(),
            tag = %request.tag,
            base = %spec.base_image,
            destination = %spec.destination,
            "Assembling runtime image"
        );
        let id = self.assembler.assemble(&request).await?;

        Ok(RuntimeImage {
            id,
            tag: request.tag,
            base_image: spec.base_image.clone(),
            artifact: request.artifact,
            destination: spec.destination.clone(),
            entry_command: spec.entry_command(),
            fingerprint,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAssembler, definition};
    use isobuild_core::Error;
    use isobuild_core::artifact::{CompiledArtifact, Linkage, checksum_file};
    use isobuild_core::inspect::Architecture;
    use std::path::Path;

    fn handoff(dir: &Path) -> ArtifactHandoff {
        let path = dir.join("tws-rust");
        std::fs::write(&path, b"\x7fELF").unwrap();
        let (size, checksum) = checksum_file(&path).unwrap();
        ArtifactHandoff::new(
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
            },
            "0123456789abcdef0123",
        )
    }

    #[test]
    fn test_default_tag() {
        assert_eq!(
            RuntimeStage::default_tag("TWS-rust", "0123456789abcdef"),
            "tws-rust:0123456789ab"
        );
        assert_eq!(RuntimeStage::default_tag("svc", "abc"), "svc:abc");
    }

    #[tokio::test]
    async fn test_package() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = Arc::new(MockAssembler::default());
        let stage = RuntimeStage::new(assembler.clone());
        let spec = definition().runtime;

        let image = stage
            .package("tws-rust", &spec, handoff(dir.path()))
            .await
            .unwrap();

        assert_eq!(image.id, "sha256:5e1f0a");
        assert_eq!(image.tag, "tws-rust:0123456789ab");
        assert_eq!(image.entry_command, vec![image.destination.clone()]);
        assert_eq!(image.fingerprint, "0123456789abcdef0123");

        let request = assembler.last_request();
        let containerfile = request.containerfile();
        assert!(containerfile.contains("COPY artifact /usr/local/bin/tws-rust"));
        assert!(!containerfile.contains("RUN "));
    }

    #[tokio::test]
    async fn test_tag_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = Arc::new(MockAssembler::default());
        let mut spec = definition().runtime;
        spec.tag = Some("tws-rust:configured".to_string());

        let image = RuntimeStage::new(assembler.clone())
            .package("tws-rust", &spec, handoff(dir.path()))
            .await
            .unwrap();
        assert_eq!(image.tag, "tws-rust:configured");

        let image = RuntimeStage::new(assembler)
            .with_tag("registry.local/tws-rust:ci")
            .package("tws-rust", &spec, handoff(dir.path()))
            .await
            .unwrap();
        assert_eq!(image.tag, "registry.local/tws-rust:ci");
    }

    #[tokio::test]
    async fn test_malformed_override_never_reaches_assembler() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = Arc::new(MockAssembler::default());

        let err = RuntimeStage::new(assembler.clone())
            .with_tag("tws-rust:")
            .package("tws-rust", &definition().runtime, handoff(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(assembler.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_never_reaches_assembler() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = Arc::new(MockAssembler::default());
        let stage = RuntimeStage::new(assembler.clone());
        let handoff = handoff(dir.path());
        std::fs::remove_file(&handoff.artifact().staged_path).unwrap();

        let err = stage
            .package("tws-rust", &definition().runtime, handoff)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactHandoff(_)));
        assert_eq!(assembler.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_artifact_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = Arc::new(MockAssembler::default());
        let handoff = handoff(dir.path());
        std::fs::write(&handoff.artifact().staged_path, b"something else").unwrap();

        let err = RuntimeStage::new(assembler.clone())
            .package("tws-rust", &definition().runtime, handoff)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("changed after the build"));
        assert_eq!(assembler.calls(), 0);
    }
}
