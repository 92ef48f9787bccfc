//! Builder stage: provision, compile, extract, verify.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use isobuild_core::artifact::{ArtifactHandoff, CompiledArtifact, checksum_file};
use isobuild_core::executor::{Executor, JobHandle, JobSpec, LogLine, VolumeMount};
use isobuild_core::inspect::ArtifactInspector;
use isobuild_core::pipeline::BuilderStageSpec;
use isobuild_core::{Error, ResourceId, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Exit code of the build script when package installation fails.
pub const EXIT_PROVISIONING: i32 = 100;
/// Exit code of the build script when a build command fails.
pub const EXIT_COMPILATION: i32 = 101;
/// Exit code of the build script when the artifact is not a regular file.
pub const EXIT_ARTIFACT_MISSING: i32 = 102;

/// How long trailing log lines may take to drain after the job exits.
const LOG_DRAIN: Duration = Duration::from_secs(2);

/// Produces one executable from the builder inputs.
#[async_trait]
pub trait ArtifactProducer: Send + Sync {
    /// Build the artifact for `run_id` and hand it off. Log lines from the
    /// build are sent on `logs`.
    async fn produce(
        &self,
        run_id: &ResourceId,
        spec: &BuilderStageSpec,
        fingerprint: &str,
        logs: mpsc::Sender<LogLine>,
    ) -> Result<ArtifactHandoff>;

    /// Drop whatever was staged for `run_id` once the run no longer needs it.
    async fn discard(&self, _run_id: &ResourceId) {}
}

/// Runs the builder job on an executor and verifies what comes out.
pub struct BuilderStage {
    executor: Arc<dyn Executor>,
    inspector: Arc<dyn ArtifactInspector>,
    staging_dir: PathBuf,
    retain: bool,
}

impl BuilderStage {
    pub fn new(
        executor: Arc<dyn Executor>,
        inspector: Arc<dyn ArtifactInspector>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            inspector,
            staging_dir: staging_dir.into(),
            retain: false,
        }
    }

    /// Keep staged artifacts on disk after the run instead of discarding them.
    pub fn retaining_artifacts(mut self) -> Self {
        self.retain = true;
        self
    }

    fn run_staging(&self, run_id: &ResourceId) -> PathBuf {
        self.staging_dir.join(run_id.short())
    }

    /// The job that runs the build script in the toolchain image.
    pub fn job_spec(run_id: &ResourceId, spec: &BuilderStageSpec) -> Result<JobSpec> {
        let mut volumes = Vec::new();
        let mut working_dir = None;
        if let Some(source) = &spec.source {
            let host_dir = std::path::absolute(&source.host_dir)?;
            volumes.push(VolumeMount {
                source: host_dir.to_string_lossy().to_string(),
                mount_path: source.mount_path.clone(),
                read_only: true,
            });
            working_dir = Some(source.mount_path.clone());
        }

        Ok(JobSpec {
            id: *run_id,
            image: spec.environment.toolchain.image_ref(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), build_script(spec)],
            working_dir,
            env: spec.environment.compiler_env(),
            volumes,
        })
    }

    async fn run_job(
        &self,
        handle: &JobHandle,
        run_id: &ResourceId,
        spec: &BuilderStageSpec,
        fingerprint: &str,
        logs: mpsc::Sender<LogLine>,
    ) -> Result<ArtifactHandoff> {
        let mut log_stream = self.executor.logs(handle).await?;
        let mut log_task = tokio::spawn(async move {
            while let Some(line) = log_stream.next().await {
                if logs.send(line).await.is_err() {
                    break;
                }
            }
        });

        let result = self.executor.wait(handle).await;

        // The follow stream may outlive the container briefly.
        if tokio::time::timeout(LOG_DRAIN, &mut log_task).await.is_err() {
            log_task.abort();
            let _ = log_task.await;
        }

        let result = result?;
        if let Some(err) = classify_exit(result.exit_code, &spec.artifact_path) {
            return Err(err);
        }

        let staging = self.run_staging(run_id);
        tokio::fs::create_dir_all(&staging).await?;
        let staged_path = staging.join(spec.artifact_name());

        let copied = self
            .executor
            .copy_out(handle, &spec.artifact_path, &staged_path)
            .await?;
        debug!(path = %staged_path.display(), bytes = copied, "Artifact extracted");

        let artifact = self.verify(spec, &staged_path).await?;
        Ok(ArtifactHandoff::new(artifact, fingerprint))
    }

    async fn verify(&self, spec: &BuilderStageSpec, staged_path: &Path) -> Result<CompiledArtifact> {
        let environment = &spec.environment;
        let inspection = self.inspector.inspect(staged_path).await?;
        inspection.verify(&environment.flags, &environment.crypto)?;

        let (size, checksum) = checksum_file(staged_path)?;
        Ok(CompiledArtifact {
            name: spec.artifact_name().to_string(),
            source_path: spec.artifact_path.clone(),
            staged_path: staged_path.to_path_buf(),
            linkage: inspection.linkage(&environment.crypto),
            stripped: inspection.is_stripped(),
            architecture: inspection.architecture,
            size,
            checksum,
            produced_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ArtifactProducer for BuilderStage {
    async fn produce(
        &self,
        run_id: &ResourceId,
        spec: &BuilderStageSpec,
        fingerprint: &str,
        logs: mpsc::Sender<LogLine>,
    ) -> Result<ArtifactHandoff> {
        let job = Self::job_spec(run_id, spec)?;
        if !self.executor.can_execute(&job).await {
            return Err(Error::Internal(format!(
                "executor '{}' is not available",
                self.executor.name()
            )));
        }

        info!(
            run = %run_id,
            image = %job.image,
            artifact = %spec.artifact_path,
            "Starting builder job"
        );
        let handle = self.executor.spawn(job).await?;

        let result = self.run_job(&handle, run_id, spec, fingerprint, logs).await;

        // The build environment is discarded whatever the outcome.
        if let Err(e) = self.executor.remove(&handle).await {
            warn!(run = %run_id, error = %e, "Failed to remove builder container");
        }
        if result.is_err() {
            self.discard(run_id).await;
        }

        result
    }

    async fn discard(&self, run_id: &ResourceId) {
        if self.retain {
            return;
        }
        let staging = self.run_staging(run_id);
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => debug!(path = %staging.display(), "Staging discarded"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staging.display(), error = %e, "Failed to discard staging"),
        }
    }
}

/// Shell script run inside the builder. Each phase exits with its own code
/// so failures can be told apart without parsing logs.
pub fn build_script(spec: &BuilderStageSpec) -> String {
    let mut script = String::new();

    if let Some(install) = spec.environment.install_script() {
        script.push_str("echo '[isobuild] provisioning'\n");
        script.push_str(&format!("{{ {}\n}} || exit {}\n", install, EXIT_PROVISIONING));
    }

    script.push_str("echo '[isobuild] compiling'\n");
    for command in &spec.commands {
        script.push_str(&format!("{{ {}\n}} || exit {}\n", command, EXIT_COMPILATION));
    }

    let artifact = shell_quote(&spec.artifact_path);
    script.push_str(&format!(
        "if [ ! -f {0} ] || [ -L {0} ]; then echo \"[isobuild] artifact \"{0}\" is not a regular file\" >&2; exit {1}; fi\n",
        artifact, EXIT_ARTIFACT_MISSING
    ));
    script
}

/// Map the builder's exit code to a failure, or `None` on success.
pub fn classify_exit(exit_code: Option<i32>, artifact_path: &str) -> Option<Error> {
    match exit_code {
        Some(0) => None,
        Some(EXIT_PROVISIONING) => Some(Error::Provisioning(
            "package installation failed; see the build log".to_string(),
        )),
        Some(EXIT_COMPILATION) => Some(Error::Compilation(
            "a build command failed; see the build log".to_string(),
        )),
        Some(EXIT_ARTIFACT_MISSING) => Some(Error::ArtifactHandoff(format!(
            "{} was not produced by the build",
            artifact_path
        ))),
        Some(code) => Some(Error::Compilation(format!(
            "builder exited with code {}",
            code
        ))),
        None => Some(Error::Internal(
            "builder exited without a status code".to_string(),
        )),
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
