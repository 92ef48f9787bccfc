//! Execution backends for isobuild.
//!
//! Provides:
//! - A local Docker executor that runs the builder job and assembles the
//!   runtime image
//! - Build context packing and artifact extraction
//! - A `readelf` based artifact inspector

pub mod context;
pub mod docker;
pub mod readelf;

pub use docker::LocalDockerExecutor;
pub use isobuild_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream,
};
pub use readelf::ReadelfInspector;
