//! Executor trait and job types.
//!
//! Executors run the builder job in an isolated environment (a container) and
//! hand back files from it. The job's filesystem is discarded on `remove`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::{ResourceId, Result};

/// Specification for a job to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Run this job belongs to.
    pub id: ResourceId,
    /// Container image to run.
    pub image: String,
    /// Command to execute.
    pub command: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Volumes to mount.
    pub volumes: Vec<VolumeMount>,
}

/// A bind mount from the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path.
    pub source: String,
    /// Path to mount in the container.
    pub mount_path: String,
    pub read_only: bool,
}

/// Handle to a running or completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: ResourceId,
    /// Executor-specific identifier (e.g., container ID).
    pub executor_id: String,
    /// Name of the executor running this job.
    pub executor_name: String,
}

/// Status of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running {
        started_at: DateTime<Utc>,
    },
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Failed { .. })
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: LogStream::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Trait for job executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Check if this executor can run jobs right now.
    async fn can_execute(&self, spec: &JobSpec) -> bool;

    /// Spawn a new job.
    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle>;

    /// Get a stream of log lines from a job.
    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Get the current status of a job.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Wait for a job to exit.
    async fn wait(&self, handle: &JobHandle) -> Result<JobResult>;

    /// Copy one regular file out of a finished job to `dest` on the host.
    /// Returns the number of bytes written.
    async fn copy_out(&self, handle: &JobHandle, path: &str, dest: &Path) -> Result<u64>;

    /// Remove the job and its filesystem.
    async fn remove(&self, handle: &JobHandle) -> Result<()>;
}
