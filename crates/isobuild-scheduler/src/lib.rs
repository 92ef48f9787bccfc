//! Stage execution for isobuild.
//!
//! The builder stage produces an [`ArtifactHandoff`](isobuild_core::artifact::ArtifactHandoff),
//! the runtime stage consumes it, and the orchestrator runs the two in order
//! while streaming events.

pub mod builder;
pub mod orchestrator;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::{ArtifactProducer, BuilderStage};
pub use orchestrator::{PipelineEvent, PipelineOrchestrator, PipelineResult};
pub use runtime::RuntimeStage;
