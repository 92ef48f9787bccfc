//! Pipeline orchestrator - runs the builder stage, then the runtime stage.

use chrono::Utc;
use isobuild_core::Error;
use isobuild_core::artifact::CompiledArtifact;
use isobuild_core::executor::LogLine;
use isobuild_core::image::{ImageAssembler, RuntimeImage};
use isobuild_core::pipeline::{
    PipelineDefinition, PipelineRun, PipelineState, StageKind, StageResult,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::builder::ArtifactProducer;
use crate::runtime::RuntimeStage;

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted {
        stage: StageKind,
    },
    StageLog {
        stage: StageKind,
        line: LogLine,
    },
    StageCompleted {
        stage: StageKind,
        success: bool,
        message: Option<String>,
    },
    ArtifactProduced {
        artifact: CompiledArtifact,
    },
    PipelineCompleted {
        state: PipelineState,
    },
}

/// Result of a pipeline execution.
#[derive(Debug, Serialize)]
pub struct PipelineResult {
    pub run: PipelineRun,
    /// Present only when the run reached `Packaged`.
    pub image: Option<RuntimeImage>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.run.state == PipelineState::Packaged
    }
}

/// Orchestrates one pipeline run.
pub struct PipelineOrchestrator {
    producer: Arc<dyn ArtifactProducer>,
    runtime: RuntimeStage,
}

impl PipelineOrchestrator {
    pub fn new(producer: Arc<dyn ArtifactProducer>, assembler: Arc<dyn ImageAssembler>) -> Self {
        Self {
            producer,
            runtime: RuntimeStage::new(assembler),
        }
    }

    /// Tag the runtime image with `tag` instead of the configured one.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.runtime = self.runtime.with_tag(tag);
        self
    }

    /// Execute a pipeline, returning a channel of events and a handle to get
    /// the final result.
    pub fn execute(
        &self,
        definition: &PipelineDefinition,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    ) {
        let (tx, rx) = mpsc::channel(256);
        let producer = self.producer.clone();
        let runtime = self.runtime.clone();
        let definition = definition.clone();

        let handle = tokio::spawn(async move {
            Self::execute_inner(producer, runtime, definition, tx).await
        });

        (rx, handle)
    }

    async fn execute_inner(
        producer: Arc<dyn ArtifactProducer>,
        runtime: RuntimeStage,
        definition: PipelineDefinition,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        let mut run = PipelineRun::new(&definition);
        info!(run = %run.id, pipeline = %run.pipeline, fingerprint = %run.fingerprint, "Pipeline started");

        let checked = definition.validate().and_then(|()| {
            runtime.resolve_tag(&definition.name, &definition.runtime, &run.fingerprint)
        });
        if let Err(e) = checked {
            return Self::fail(run, StageKind::Builder, e, &tx).await;
        }

        // Builder stage.
        let _ = tx
            .send(PipelineEvent::StageStarted {
                stage: StageKind::Builder,
            })
            .await;
        let started_at = Utc::now();

        let (log_tx, mut log_rx) = mpsc::channel::<LogLine>(256);
        let forward_tx = tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(line) = log_rx.recv().await {
                let _ = forward_tx
                    .send(PipelineEvent::StageLog {
                        stage: StageKind::Builder,
                        line,
                    })
                    .await;
            }
        });

        let produced = producer
            .produce(&run.id, &definition.builder, &run.fingerprint, log_tx)
            .await;
        // All senders are gone once `produce` returns.
        let _ = forward.await;

        let handoff = match produced {
            Ok(handoff) => handoff,
            Err(e) => {
                producer.discard(&run.id).await;
                run.stages.push(Self::stage_result(StageKind::Builder, started_at, Some(&e)));
                return Self::fail(run, StageKind::Builder, e, &tx).await;
            }
        };

        run.stages
            .push(Self::stage_result(StageKind::Builder, started_at, None));
        info!(
            run = %run.id,
            artifact = %handoff.artifact().name,
            checksum = %handoff.artifact().checksum,
            "Builder stage completed"
        );
        let _ = tx
            .send(PipelineEvent::StageCompleted {
                stage: StageKind::Builder,
                success: true,
                message: None,
            })
            .await;
        let _ = tx
            .send(PipelineEvent::ArtifactProduced {
                artifact: handoff.artifact().clone(),
            })
            .await;

        // Runtime stage. The handoff moves in; nothing else crosses over.
        let _ = tx
            .send(PipelineEvent::StageStarted {
                stage: StageKind::Runtime,
            })
            .await;
        let started_at = Utc::now();

        let packaged = runtime
            .package(&definition.name, &definition.runtime, handoff)
            .await;
        // The image holds its own copy; the staged file is no longer needed.
        producer.discard(&run.id).await;

        match packaged {
            Ok(image) => {
                run.stages
                    .push(Self::stage_result(StageKind::Runtime, started_at, None));
                let _ = tx
                    .send(PipelineEvent::StageLog {
                        stage: StageKind::Runtime,
                        line: LogLine::system(format!("Tagged {} ({})", image.tag, image.id)),
                    })
                    .await;
                let _ = tx
                    .send(PipelineEvent::StageCompleted {
                        stage: StageKind::Runtime,
                        success: true,
                        message: None,
                    })
                    .await;

                info!(run = %run.id, image = %image.id, tag = %image.tag, "Pipeline packaged");
                run.state = PipelineState::Packaged;
                run.finished_at = Some(Utc::now());
                let _ = tx
                    .send(PipelineEvent::PipelineCompleted {
                        state: run.state.clone(),
                    })
                    .await;

                PipelineResult {
                    run,
                    image: Some(image),
                }
            }
            Err(e) => {
                run.stages
                    .push(Self::stage_result(StageKind::Runtime, started_at, Some(&e)));
                Self::fail(run, StageKind::Runtime, e, &tx).await
            }
        }
    }

    fn stage_result(
        stage: StageKind,
        started_at: chrono::DateTime<Utc>,
        error: Option<&Error>,
    ) -> StageResult {
        StageResult {
            stage,
            succeeded: error.is_none(),
            message: error.map(|e| e.to_string()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn fail(
        mut run: PipelineRun,
        stage: StageKind,
        error: Error,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        error!(run = %run.id, stage = %stage, kind = error.kind(), error = %error, "Stage failed");
        let _ = tx
            .send(PipelineEvent::StageCompleted {
                stage,
                success: false,
                message: Some(error.to_string()),
            })
            .await;

        run.state = PipelineState::failed(stage, &error);
        run.finished_at = Some(Utc::now());
        let _ = tx
            .send(PipelineEvent::PipelineCompleted {
                state: run.state.clone(),
            })
            .await;

        PipelineResult { run, image: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuilderStage;
    use crate::testing::*;
    use isobuild_core::artifact::Linkage;
    use std::path::Path;

    struct Harness {
        executor: Arc<MockExecutor>,
        assembler: Arc<MockAssembler>,
        orchestrator: PipelineOrchestrator,
    }

    fn harness(executor: MockExecutor, inspector: MockInspector, staging: &Path) -> Harness {
        let executor = Arc::new(executor);
        let assembler = Arc::new(MockAssembler::default());
        let builder = BuilderStage::new(executor.clone(), Arc::new(inspector), staging);
        Harness {
            executor,
            assembler: assembler.clone(),
            orchestrator: PipelineOrchestrator::new(Arc::new(builder), assembler),
        }
    }

    async fn run(
        orchestrator: &PipelineOrchestrator,
        definition: &PipelineDefinition,
    ) -> (PipelineResult, Vec<PipelineEvent>) {
        let (mut rx, handle) = orchestrator.execute(definition);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (handle.await.unwrap(), events)
    }

    fn failed_kind(result: &PipelineResult) -> (StageKind, String) {
        match &result.run.state {
            PipelineState::Failed { stage, kind, .. } => (*stage, kind.clone()),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_successful_run_is_packaged() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::succeeding(), MockInspector::clean(), dir.path());

        let (result, events) = run(&h.orchestrator, &definition()).await;

        assert!(result.success());
        let image = result.image.as_ref().unwrap();
        assert_eq!(image.entry_command, vec!["/usr/local/bin/tws-rust"]);
        assert_eq!(image.artifact.linkage, Linkage::Static);
        assert!(image.artifact.stripped);
        assert_eq!(image.fingerprint, definition().fingerprint());
        assert_eq!(result.run.stages.len(), 2);
        assert!(result.run.stages.iter().all(|s| s.succeeded));
        assert!(result.run.finished_at.is_some());

        assert_eq!(h.executor.removed(), 1);
        assert_eq!(h.assembler.calls(), 1);

        let builder_logs = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    PipelineEvent::StageLog {
                        stage: StageKind::Builder,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(builder_logs, 2);

        let produced = events
            .iter()
            .position(|e| matches!(e, PipelineEvent::ArtifactProduced { .. }))
            .unwrap();
        let runtime_started = events
            .iter()
            .position(|e| {
                matches!(
                    e,
                    PipelineEvent::StageStarted {
                        stage: StageKind::Runtime
                    }
                )
            })
            .unwrap();
        assert!(produced < runtime_started);
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::PipelineCompleted {
                state: PipelineState::Packaged
            })
        ));
    }

    #[tokio::test]
    async fn test_provisioning_failure_produces_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::exiting(100), MockInspector::clean(), dir.path());

        let (result, events) = run(&h.orchestrator, &definition()).await;

        assert_eq!(failed_kind(&result), (StageKind::Builder, "provisioning".to_string()));
        assert!(result.image.is_none());
        assert_eq!(h.assembler.calls(), 0);
        assert_eq!(h.executor.removed(), 1);
        assert!(!events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageStarted {
                stage: StageKind::Runtime
            }
        )));
    }

    #[tokio::test]
    async fn test_compilation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::exiting(101), MockInspector::clean(), dir.path());

        let (result, _) = run(&h.orchestrator, &definition()).await;
        assert_eq!(failed_kind(&result), (StageKind::Builder, "compilation".to_string()));
        assert_eq!(h.assembler.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_header_fails_compilation() {
        // Packages install fine but a crate's build script cannot find
        // openssl/ssl.h, so `cargo build` exits non-zero.
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::exiting(101), MockInspector::clean(), dir.path());
        let mut def = definition();
        def.builder.environment.packages.remove("libssl-dev");

        let (result, _) = run(&h.orchestrator, &def).await;
        assert_eq!(failed_kind(&result), (StageKind::Builder, "compilation".to_string()));
        assert!(result.image.is_none());
        assert_eq!(h.assembler.calls(), 0);
        assert_eq!(h.executor.removed(), 1);
    }

    #[tokio::test]
    async fn test_wrong_artifact_path_fails_handoff() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::exiting(102), MockInspector::clean(), dir.path());

        let (result, _) = run(&h.orchestrator, &definition()).await;
        assert_eq!(
            failed_kind(&result),
            (StageKind::Builder, "artifact-handoff".to_string())
        );
        assert_eq!(h.assembler.calls(), 0);
    }

    #[tokio::test]
    async fn test_copy_failure_fails_handoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = MockExecutor::succeeding();
        executor.artifact = None;
        let h = harness(executor, MockInspector::clean(), dir.path());

        let (result, _) = run(&h.orchestrator, &definition()).await;
        assert_eq!(
            failed_kind(&result),
            (StageKind::Builder, "artifact-handoff".to_string())
        );
        assert_eq!(h.assembler.calls(), 0);
        assert_eq!(h.executor.removed(), 1);
    }

    #[tokio::test]
    async fn test_unstripped_artifact_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut inspector = MockInspector::clean();
        inspector.report.has_symtab = true;
        let h = harness(MockExecutor::succeeding(), inspector, dir.path());

        let (result, _) = run(&h.orchestrator, &definition()).await;
        assert_eq!(
            failed_kind(&result),
            (StageKind::Builder, "invariant-violation".to_string())
        );
        assert!(result.image.is_none());
    }

    #[tokio::test]
    async fn test_invalid_definition_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::succeeding(), MockInspector::clean(), dir.path());
        let mut def = definition();
        def.builder.commands.clear();

        let (result, _) = run(&h.orchestrator, &def).await;
        assert_eq!(
            failed_kind(&result),
            (StageKind::Builder, "invalid-input".to_string())
        );
        assert!(h.executor.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::succeeding(), MockInspector::clean(), dir.path());

        let (first, _) = run(&h.orchestrator, &definition()).await;
        let (second, _) = run(&h.orchestrator, &definition()).await;

        let a = first.image.unwrap();
        let b = second.image.unwrap();
        assert_ne!(first.run.id, second.run.id);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.tag, b.tag);
        assert_eq!(a.artifact.checksum, b.artifact.checksum);
        assert_eq!(a.artifact.linkage, b.artifact.linkage);
        assert_eq!(a.artifact.stripped, b.artifact.stripped);
        assert_ne!(a.artifact.staged_path, b.artifact.staged_path);
    }

    #[tokio::test]
    async fn test_tag_override() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::succeeding(), MockInspector::clean(), dir.path());
        let orchestrator = h.orchestrator.with_tag("tws-rust:ci");

        let (result, _) = run(&orchestrator, &definition()).await;
        assert_eq!(result.image.unwrap().tag, "tws-rust:ci");
        assert_eq!(h.assembler.last_request().tag, "tws-rust:ci");
    }

    #[tokio::test]
    async fn test_malformed_tag_override_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::succeeding(), MockInspector::clean(), dir.path());
        let orchestrator = h.orchestrator.with_tag("tws-rust:${git.tag}");

        let (result, _) = run(&orchestrator, &definition()).await;
        assert_eq!(
            failed_kind(&result),
            (StageKind::Builder, "invalid-input".to_string())
        );
        assert!(h.executor.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_staging_is_emptied_after_each_run() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::succeeding(), MockInspector::clean(), dir.path());

        for _ in 0..3 {
            let (result, _) = run(&h.orchestrator, &definition()).await;
            assert!(result.success());
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let mut inspector = MockInspector::clean();
        inspector.report.has_symtab = true;
        let h = harness(MockExecutor::succeeding(), inspector, dir.path());
        let (result, _) = run(&h.orchestrator, &definition()).await;
        assert!(!result.success());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_retained_staging_survives_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::succeeding());
        let builder = BuilderStage::new(executor, Arc::new(MockInspector::clean()), dir.path())
            .retaining_artifacts();
        let orchestrator =
            PipelineOrchestrator::new(Arc::new(builder), Arc::new(MockAssembler::default()));

        let (result, _) = run(&orchestrator, &definition()).await;
        let image = result.image.unwrap();
        assert!(image.artifact.staged_path.is_file());
        assert!(image.artifact.staged_path.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn test_builder_job_receives_compiler_env() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockExecutor::succeeding(), MockInspector::clean(), dir.path());

        run(&h.orchestrator, &definition()).await;
        let spec = h.executor.last_spec();
        assert_eq!(spec.env.get("OPENSSL_STATIC"), Some(&"1".to_string()));
        assert_eq!(
            spec.env.get("OPENSSL_LIB_DIR"),
            Some(&"/usr/lib/x86_64-linux-gnu".to_string())
        );
        assert!(spec.env["RUSTFLAGS"].contains("-C link-arg=-s"));
    }
}
