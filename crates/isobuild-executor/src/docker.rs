//! Local Docker executor and image assembler.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::HostConfig;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use isobuild_core::executor::*;
use isobuild_core::image::{AssemblyRequest, CONTAINERFILE_NAME, ImageAssembler};
use isobuild_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::context;

/// Runs builder jobs and assembles runtime images on the local Docker daemon.
pub struct LocalDockerExecutor {
    docker: Docker,
}

impl LocalDockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_name(run_id: &ResourceId) -> String {
        format!("isobuild-{}-builder", run_id.short())
    }

    async fn pull(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                // A missing image surfaces again at create time.
                Err(e) => warn!(error = %e, "Pull warning"),
            }
        }
    }
}

fn binds(volumes: &[VolumeMount]) -> Option<Vec<String>> {
    if volumes.is_empty() {
        return None;
    }
    Some(
        volumes
            .iter()
            .map(|v| {
                let mode = if v.read_only { "ro" } else { "rw" };
                format!("{}:{}:{}", v.source, v.mount_path, mode)
            })
            .collect(),
    )
}

fn env_list(spec: &JobSpec) -> Vec<String> {
    spec.env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

fn parse_time(value: Option<String>) -> Option<chrono::DateTime<Utc>> {
    value
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl Executor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn can_execute(&self, _spec: &JobSpec) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let container_name = Self::container_name(&spec.id);
        self.pull(&spec.image).await;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env_list(&spec)),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: binds(&spec.volumes),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, image = %spec.image, "Creating builder container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| {
                Error::Provisioning(format!("cannot create container from {}: {}", spec.image, e))
            })?;

        info!(container = %container_name, "Starting builder container");
        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.remove_by_name(&container_name).await {
                warn!(container = %container_name, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(Error::Provisioning(format!(
                "cannot start container {}: {}",
                container_name, e
            )));
        }

        Ok(JobHandle {
            id: spec.id,
            executor_id: container.id,
            executor_name: Executor::name(self).to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let container_name = Self::container_name(&handle.id);

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self.docker.logs(&container_name, Some(options));
        let mapped = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    Some(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content: String::from_utf8_lossy(&message).trim_end().to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let container_name = Self::container_name(&handle.id);

        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("container {}: {}", container_name, e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("container has no state".to_string()))?;

        let started_at = parse_time(state.started_at);
        let status = if state.running.unwrap_or(false) {
            JobStatus::Running {
                started_at: started_at.unwrap_or_else(Utc::now),
            }
        } else if state.paused.unwrap_or(false) {
            JobStatus::Pending
        } else {
            let exit_code = state.exit_code.map(|c| c as i32);
            let finished_at = parse_time(state.finished_at).unwrap_or_else(Utc::now);
            if exit_code == Some(0) {
                JobStatus::Succeeded {
                    started_at: started_at.unwrap_or(finished_at),
                    finished_at,
                }
            } else {
                JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message: state.error.unwrap_or_default(),
                }
            }
        };

        Ok(status)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let container_name = Self::container_name(&handle.id);

        let current = self.status(handle).await?;
        if current.is_terminal() {
            let exit_code = match &current {
                JobStatus::Succeeded { .. } => Some(0),
                JobStatus::Failed { exit_code, .. } => *exit_code,
                _ => None,
            };
            return Ok(JobResult {
                status: current,
                exit_code,
            });
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&container_name, Some(options));

        // Non-zero exits arrive as an error carrying the code.
        let exit_code = match stream.next().await {
            Some(Ok(response)) => Some(response.status_code as i32),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Some(code as i32),
            Some(Err(e)) => {
                warn!(error = %e, "Wait error");
                None
            }
            None => None,
        };

        let status = self.status(handle).await?;
        Ok(JobResult { status, exit_code })
    }

    async fn copy_out(&self, handle: &JobHandle, path: &str, dest: &Path) -> Result<u64> {
        let container_name = Self::container_name(&handle.id);
        debug!(container = %container_name, path = %path, "Copying artifact out");

        let options = DownloadFromContainerOptions { path: path.to_string() };
        let mut stream = self
            .docker
            .download_from_container(&container_name, Some(options));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    return Err(Error::ArtifactHandoff(format!(
                        "{} does not exist in the builder",
                        path
                    )));
                }
                Err(e) => {
                    return Err(Error::ArtifactHandoff(format!(
                        "cannot copy {} out of {}: {}",
                        path, container_name, e
                    )));
                }
            }
        }

        context::extract_single_file(&archive, dest)
    }

    async fn remove(&self, handle: &JobHandle) -> Result<()> {
        self.remove_by_name(&Self::container_name(&handle.id)).await
    }
}

impl LocalDockerExecutor {
    async fn remove_by_name(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(container_name, Some(options))
            .await
            .map_err(|e| Error::Internal(format!("cannot remove container: {}", e)))?;
        debug!(container = %container_name, "Removed container");
        Ok(())
    }
}

#[async_trait]
impl ImageAssembler for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn assemble(&self, request: &AssemblyRequest) -> Result<String> {
        let context = context::runtime_context(request)?;

        let options = BuildImageOptions {
            dockerfile: CONTAINERFILE_NAME.to_string(),
            t: request.tag.clone(),
            rm: true,
            forcerm: true,
            pull: true,
            labels: request
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        };

        info!(tag = %request.tag, base = %request.spec.base_image, "Assembling runtime image");
        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(context)));

        let mut image_id = None;
        while let Some(result) = stream.next().await {
            let info = result
                .map_err(|e| Error::ArtifactHandoff(format!("image build failed: {}", e)))?;
            if let Some(error) = info.error {
                return Err(Error::ArtifactHandoff(error.trim().to_string()));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(line = %line, "Image build");
                }
            }
            if let Some(id) = info.aux.and_then(|aux| aux.id) {
                image_id = Some(id);
            }
        }

        match image_id {
            Some(id) => Ok(id),
            None => {
                let inspect = self
                    .docker
                    .inspect_image(&request.tag)
                    .await
                    .map_err(|e| Error::NotFound(format!("image {}: {}", request.tag, e)))?;
                inspect
                    .id
                    .ok_or_else(|| Error::Internal(format!("image {} has no id", request.tag)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(volumes: Vec<VolumeMount>) -> JobSpec {
        JobSpec {
            id: ResourceId::new(),
            image: "rust:1.75".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "cargo build".to_string()],
            working_dir: Some("/src".to_string()),
            env: BTreeMap::from([
                ("OPENSSL_STATIC".to_string(), "1".to_string()),
                ("CARGO_TARGET_DIR".to_string(), "/build/target".to_string()),
            ]),
            volumes,
        }
    }

    #[test]
    fn test_container_name_is_per_run() {
        let id = ResourceId::new();
        let name = LocalDockerExecutor::container_name(&id);
        assert_eq!(name, format!("isobuild-{}-builder", id.short()));
        assert_eq!(name, LocalDockerExecutor::container_name(&id));
        assert_ne!(name, LocalDockerExecutor::container_name(&ResourceId::new()));
    }

    #[test]
    fn test_binds_are_read_only_when_requested() {
        let mounts = vec![VolumeMount {
            source: "/home/dev/tws-rust".to_string(),
            mount_path: "/src".to_string(),
            read_only: true,
        }];
        assert_eq!(
            binds(&mounts),
            Some(vec!["/home/dev/tws-rust:/src:ro".to_string()])
        );
        assert_eq!(binds(&[]), None);
    }

    #[test]
    fn test_env_list_is_sorted() {
        assert_eq!(
            env_list(&spec(vec![])),
            vec![
                "CARGO_TARGET_DIR=/build/target".to_string(),
                "OPENSSL_STATIC=1".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_time() {
        let parsed = parse_time(Some("2024-03-01T12:00:00.5Z".to_string())).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-01T12:00:00.500+00:00");
        assert!(parse_time(Some("0001-bogus".to_string())).is_none());
        assert!(parse_time(None).is_none());
    }
}
