//! Mock backends shared by the scheduler tests.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use isobuild_core::environment::{BuildEnvironment, CryptoLinkage, Toolchain};
use isobuild_core::executor::*;
use isobuild_core::image::{AssemblyRequest, ImageAssembler};
use isobuild_core::inspect::{Architecture, ArtifactInspection, ArtifactInspector};
use isobuild_core::pipeline::{BuilderStageSpec, PipelineDefinition, RuntimeStageSpec, SourceSpec};
use isobuild_core::{Error, Result};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const ARTIFACT_BYTES: &[u8] = b"\x7fELF static stripped tws-rust";

pub fn definition() -> PipelineDefinition {
    PipelineDefinition {
        name: "tws-rust".to_string(),
        builder: BuilderStageSpec {
            environment: BuildEnvironment::new(
                Toolchain::new("rust", "1.75"),
                CryptoLinkage::new("openssl").with_lib_dir("/usr/lib/x86_64-linux-gnu"),
            )
            .with_packages(["libssl-dev", "pkg-config"]),
            source: Some(SourceSpec::new("/home/dev/tws-rust")),
            commands: vec!["cargo build --release --locked".to_string()],
            artifact_path: "/build/target/release/tws-rust".to_string(),
        },
        runtime: RuntimeStageSpec {
            base_image: "debian:bookworm-slim".to_string(),
            destination: "/usr/local/bin/tws-rust".to_string(),
            tag: None,
        },
    }
}

/// Executor whose job exits with a fixed code and leaves `artifact` behind.
pub struct MockExecutor {
    pub exit_code: i32,
    pub artifact: Option<Vec<u8>>,
    pub spawned: Mutex<Vec<JobSpec>>,
    pub removed: AtomicUsize,
}

impl MockExecutor {
    pub fn exiting(exit_code: i32) -> Self {
        Self {
            exit_code,
            artifact: (exit_code == 0).then(|| ARTIFACT_BYTES.to_vec()),
            spawned: Mutex::new(Vec::new()),
            removed: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::exiting(0)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> JobSpec {
        self.spawned.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn can_execute(&self, _spec: &JobSpec) -> bool {
        true
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let id = spec.id;
        self.spawned.lock().unwrap().push(spec);
        Ok(JobHandle {
            id,
            executor_id: "mock-container".to_string(),
            executor_name: "mock".to_string(),
        })
    }

    async fn logs(&self, _handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let lines = vec![
            LogLine::system("[isobuild] provisioning"),
            LogLine::system("[isobuild] compiling"),
        ];
        Ok(Box::pin(stream::iter(lines)))
    }

    async fn status(&self, _handle: &JobHandle) -> Result<JobStatus> {
        Ok(self.terminal_status())
    }

    async fn wait(&self, _handle: &JobHandle) -> Result<JobResult> {
        Ok(JobResult {
            status: self.terminal_status(),
            exit_code: Some(self.exit_code),
        })
    }

    async fn copy_out(&self, _handle: &JobHandle, path: &str, dest: &Path) -> Result<u64> {
        match &self.artifact {
            Some(bytes) => {
                std::fs::write(dest, bytes)?;
                Ok(bytes.len() as u64)
            }
            None => Err(Error::ArtifactHandoff(format!("{} does not exist", path))),
        }
    }

    async fn remove(&self, _handle: &JobHandle) -> Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl MockExecutor {
    fn terminal_status(&self) -> JobStatus {
        let now = chrono::Utc::now();
        if self.exit_code == 0 {
            JobStatus::Succeeded {
                started_at: now,
                finished_at: now,
            }
        } else {
            JobStatus::Failed {
                started_at: Some(now),
                finished_at: now,
                exit_code: Some(self.exit_code),
                message: String::new(),
            }
        }
    }
}

/// Inspector returning a fixed report.
pub struct MockInspector {
    pub report: ArtifactInspection,
}

impl MockInspector {
    pub fn clean() -> Self {
        Self {
            report: ArtifactInspection {
                architecture: Architecture::X86_64,
                needed: vec!["libc.so.6".to_string()],
                interpreter: Some("/lib64/ld-linux-x86-64.so.2".to_string()),
                has_symtab: false,
                debug_sections: vec![],
            },
        }
    }

    pub fn linking(needed: &[&str]) -> Self {
        let mut inspector = Self::clean();
        inspector.report.needed = needed.iter().map(|s| s.to_string()).collect();
        inspector
    }
}

#[async_trait]
impl ArtifactInspector for MockInspector {
    async fn inspect(&self, _path: &Path) -> Result<ArtifactInspection> {
        Ok(self.report.clone())
    }
}

/// Assembler that records requests and returns a fixed image id.
#[derive(Default)]
pub struct MockAssembler {
    pub requests: Mutex<Vec<AssemblyRequest>>,
    pub calls: AtomicUsize,
}

impl MockAssembler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> AssemblyRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ImageAssembler for MockAssembler {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn assemble(&self, request: &AssemblyRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        Ok("sha256:5e1f0a".to_string())
    }
}
