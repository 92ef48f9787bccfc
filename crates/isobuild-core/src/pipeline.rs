//! Pipeline and stage definitions.
//!
//! A pipeline is always two nodes joined by one artifact-typed edge:
//! the builder stage produces an [`ArtifactHandoff`](crate::artifact::ArtifactHandoff),
//! the runtime stage consumes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::ResourceId;
use crate::environment::BuildEnvironment;
use crate::{Error, Result};

/// Where the service source is mounted inside the builder.
pub const SOURCE_MOUNT: &str = "/src";

/// A complete two-stage pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (e.g., "tws-rust").
    pub name: String,
    pub builder: BuilderStageSpec,
    pub runtime: RuntimeStageSpec,
}

impl PipelineDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("pipeline name is empty".to_string()));
        }
        self.builder.validate()?;
        self.runtime.validate()
    }

    /// Fingerprint of everything that determines the artifact.
    pub fn fingerprint(&self) -> String {
        self.builder.environment.fingerprint(&self.builder.commands)
    }
}

/// Host source tree made available to the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Directory on the host.
    pub host_dir: PathBuf,
    /// Mount point inside the builder; mounted read-only.
    pub mount_path: String,
}

impl SourceSpec {
    pub fn new(host_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_dir: host_dir.into(),
            mount_path: SOURCE_MOUNT.to_string(),
        }
    }
}

/// Inputs of the builder stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderStageSpec {
    pub environment: BuildEnvironment,
    /// Optional host source; builds that fetch their source need none.
    pub source: Option<SourceSpec>,
    /// Build commands, run in order after provisioning.
    pub commands: Vec<String>,
    /// Absolute path of the executable inside the builder.
    pub artifact_path: String,
}

impl BuilderStageSpec {
    /// File name of the artifact.
    pub fn artifact_name(&self) -> &str {
        Path::new(&self.artifact_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.artifact_path)
    }

    pub fn validate(&self) -> Result<()> {
        self.environment.validate()?;
        if self.commands.is_empty() {
            return Err(Error::InvalidInput(
                "builder stage has no build commands".to_string(),
            ));
        }
        require_absolute("artifact path", &self.artifact_path)?;
        if self.artifact_path.ends_with('/') {
            return Err(Error::InvalidInput(format!(
                "artifact path '{}' names a directory",
                self.artifact_path
            )));
        }
        Ok(())
    }
}

/// Inputs of the runtime stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStageSpec {
    /// Minimal base image (e.g., "debian:bookworm-slim").
    pub base_image: String,
    /// Absolute destination path of the artifact in the image.
    pub destination: String,
    /// Tag to give the assembled image.
    pub tag: Option<String>,
}

impl RuntimeStageSpec {
    /// The image runs the artifact at `destination` with no arguments.
    pub fn entry_command(&self) -> Vec<String> {
        vec![self.destination.clone()]
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_image.trim().is_empty() {
            return Err(Error::InvalidInput(
                "runtime base image is empty".to_string(),
            ));
        }
        require_absolute("destination", &self.destination)?;
        if self.destination.ends_with('/') {
            return Err(Error::InvalidInput(format!(
                "destination '{}' names a directory",
                self.destination
            )));
        }
        if let Some(tag) = &self.tag {
            validate_image_tag(tag)?;
        }
        Ok(())
    }
}

/// Check that `reference` is a usable `[registry/]name[:tag]` image tag.
///
/// Path components must be lowercase. A registry host (the first component
/// when it contains `.` or `:` or is `localhost`) may carry a port.
/// Digests are not accepted.
pub fn validate_image_tag(reference: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(Error::InvalidInput(format!(
            "image tag '{}' is invalid: {}",
            reference, reason
        )))
    };

    let name_end = reference.rfind('/').map_or(0, |i| i + 1);
    let (name, tag) = match reference[name_end..].rfind(':') {
        Some(i) => (&reference[..name_end + i], Some(&reference[name_end + i + 1..])),
        None => (reference, None),
    };

    if name.is_empty() {
        return invalid("missing repository name");
    }
    if let Some(tag) = tag {
        let mut chars = tag.chars();
        let first_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        if !first_ok || tag.len() > 128 {
            return invalid("tag must be 1-128 characters starting with a letter, digit or '_'");
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
            return invalid("tag may only contain letters, digits, '_', '.' and '-'");
        }
    }

    let components: Vec<&str> = name.split('/').collect();
    let has_registry = components.len() > 1
        && (components[0].contains(['.', ':']) || components[0] == "localhost");
    let (registry, path) = if has_registry {
        (Some(components[0]), &components[1..])
    } else {
        (None, &components[..])
    };

    if let Some(host) = registry {
        if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
        {
            return invalid("malformed registry host");
        }
    }
    for component in path {
        let well_formed = !component.is_empty()
            && component.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && component.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if !well_formed {
            return invalid(&format!("repository component '{}' is malformed", component));
        }
    }
    Ok(())
}

fn require_absolute(what: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidInput(format!(
            "{} '{}' must be absolute",
            what, path
        )));
    }
    Ok(())
}

/// The two nodes of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Builder,
    Runtime,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Builder => write!(f, "builder"),
            StageKind::Runtime => write!(f, "runtime"),
        }
    }
}

/// Overall pipeline state: `Building` → `Packaged`, or `Building` → `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Building,
    Packaged,
    Failed {
        stage: StageKind,
        kind: String,
        message: String,
    },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Packaged | PipelineState::Failed { .. })
    }

    pub fn failed(stage: StageKind, error: &Error) -> Self {
        PipelineState::Failed {
            stage,
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub succeeded: bool,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A pipeline invocation and what it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: ResourceId,
    pub pipeline: String,
    pub fingerprint: String,
    pub state: PipelineState,
    pub stages: Vec<StageResult>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(definition: &PipelineDefinition) -> Self {
        Self {
            id: ResourceId::new(),
            pipeline: definition.name.clone(),
            fingerprint: definition.fingerprint(),
            state: PipelineState::Building,
            stages: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}
