//! Runtime image types and the assembler trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Result;
use crate::artifact::CompiledArtifact;
use crate::pipeline::RuntimeStageSpec;

pub const LABEL_PIPELINE: &str = "isobuild.pipeline";
pub const LABEL_FINGERPRINT: &str = "isobuild.fingerprint";
pub const LABEL_ARTIFACT_SHA256: &str = "isobuild.artifact.sha256";

/// Name of the containerfile inside a runtime build context.
pub const CONTAINERFILE_NAME: &str = "Containerfile";
/// Name the artifact is stored under in the runtime build context,
/// whatever its own file name is.
pub const ARTIFACT_CONTEXT_NAME: &str = "artifact";

/// Everything an assembler needs to produce the runtime image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyRequest {
    pub spec: RuntimeStageSpec,
    pub artifact: CompiledArtifact,
    /// Final image tag.
    pub tag: String,
    pub labels: BTreeMap<String, String>,
}

impl AssemblyRequest {
    pub fn new(
        spec: RuntimeStageSpec,
        artifact: CompiledArtifact,
        tag: impl Into<String>,
        pipeline: &str,
        fingerprint: &str,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_PIPELINE.to_string(), pipeline.to_string());
        labels.insert(LABEL_FINGERPRINT.to_string(), fingerprint.to_string());
        labels.insert(
            LABEL_ARTIFACT_SHA256.to_string(),
            artifact.checksum.clone(),
        );
        Self {
            spec,
            artifact,
            tag: tag.into(),
            labels,
        }
    }

    /// Runtime containerfile: the base image, the one artifact, the entry
    /// command. No step runs inside the image.
    pub fn containerfile(&self) -> String {
        let entry = self
            .spec
            .entry_command()
            .iter()
            .map(|arg| quoted(arg))
            .collect::<Vec<_>>()
            .join(", ");

        let mut out = String::new();
        out.push_str(&format!("FROM {}\n", self.spec.base_image));
        for (key, value) in &self.labels {
            out.push_str(&format!("LABEL {}={}\n", key, quoted(value)));
        }
        out.push_str(&format!(
            "COPY {} {}\n",
            ARTIFACT_CONTEXT_NAME, self.spec.destination
        ));
        out.push_str(&format!("CMD [{}]\n", entry));
        out
    }
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// The terminal output of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeImage {
    /// Engine image id (e.g., "sha256:...").
    pub id: String,
    pub tag: String,
    pub base_image: String,
    pub artifact: CompiledArtifact,
    pub destination: String,
    pub entry_command: Vec<String>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// Builds the runtime image from a request.
#[async_trait]
pub trait ImageAssembler: Send + Sync {
    /// Name of this assembler.
    fn name(&self) -> &'static str;

    /// Assemble the image and return its id.
    async fn assemble(&self, request: &AssemblyRequest) -> Result<String>;
}
