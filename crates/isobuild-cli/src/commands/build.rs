//! Local pipeline execution command.

use anyhow::{Context, Result, bail};
use isobuild_core::executor::LogStream;
use isobuild_core::pipeline::{PipelineState, StageKind};
use isobuild_executor::{LocalDockerExecutor, ReadelfInspector};
use isobuild_scheduler::{BuilderStage, PipelineEvent, PipelineOrchestrator, PipelineResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Run a pipeline locally using Docker.
pub async fn run_local(
    config_path: &Path,
    vars: &[String],
    staging: Option<PathBuf>,
    tag: Option<String>,
    json: bool,
) -> Result<()> {
    let definition = super::load(config_path, vars)?;
    // An explicit staging directory keeps the extracted artifact after the run.
    let retain = staging.is_some();
    let staging = staging.unwrap_or_else(|| std::env::temp_dir().join("isobuild"));

    let docker = Arc::new(LocalDockerExecutor::new().context("Failed to connect to Docker")?);
    let mut builder = BuilderStage::new(docker.clone(), Arc::new(ReadelfInspector::new()), &staging);
    if retain {
        builder = builder.retaining_artifacts();
    }
    let mut orchestrator = PipelineOrchestrator::new(Arc::new(builder), docker);
    if let Some(tag) = tag {
        orchestrator = orchestrator.with_tag(tag);
    }

    if !json {
        println!("Building pipeline: {}", definition.name);
        println!("Fingerprint: {}", definition.fingerprint());
        println!("Staging: {}", staging.display());
        println!("\n--- Starting pipeline execution ---\n");
    }

    let (mut rx, result_handle) = orchestrator.execute(&definition);

    while let Some(event) = rx.recv().await {
        if !json {
            print_event(event);
        }
    }

    let result = result_handle
        .await
        .context("Pipeline execution task failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    if result.success() {
        Ok(())
    } else {
        bail!("Pipeline failed");
    }
}

fn print_event(event: PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { stage } => {
            println!("▶ Stage '{}' started", stage);
        }
        PipelineEvent::StageLog { stage, line } => {
            let marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            println!("  [{}]{} {}", stage, marker, line.content);
        }
        PipelineEvent::StageCompleted {
            stage,
            success,
            message,
        } => {
            if success {
                println!("✓ Stage '{}' completed successfully\n", stage);
            } else {
                println!(
                    "✗ Stage '{}' failed: {}\n",
                    stage,
                    message.unwrap_or_default()
                );
            }
        }
        PipelineEvent::ArtifactProduced { artifact } => {
            println!(
                "  artifact {} ({} bytes, {}, sha256 {})",
                artifact.name,
                artifact.size,
                artifact.architecture,
                artifact.checksum
            );
        }
        PipelineEvent::PipelineCompleted { state } => match state {
            PipelineState::Packaged => println!("--- Pipeline completed successfully ---"),
            _ => println!("--- Pipeline failed ---"),
        },
    }
}

fn print_summary(result: &PipelineResult) {
    println!("\n--- Stage Summary ---");
    for stage in [StageKind::Builder, StageKind::Runtime] {
        let status = match result.run.stages.iter().find(|s| s.stage == stage) {
            Some(s) if s.succeeded => "✓ succeeded".to_string(),
            Some(s) => format!("✗ failed: {}", s.message.as_deref().unwrap_or("")),
            None => "⊘ not run".to_string(),
        };
        println!("  {} - {}", stage, status);
    }

    match &result.image {
        Some(image) => {
            println!("\n✓ Image {} ({})", image.tag, image.id);
            println!("  entry command: {:?}", image.entry_command);
        }
        None => {
            if let PipelineState::Failed { kind, .. } = &result.run.state {
                println!("\n✗ No image produced ({})", kind);
            }
        }
    }
}
