//! KDL configuration for isobuild.
//!
//! This crate handles:
//! - Parsing pipeline definitions (isobuild.kdl)
//! - Variable interpolation
//! - Rendering a definition as a two-stage containerfile

pub mod containerfile;
pub mod error;
pub mod pipeline;
pub mod variables;

pub use containerfile::render_containerfile;
pub use error::{ConfigError, ConfigResult};
pub use pipeline::{parse_pipeline, parse_pipeline_file};
pub use variables::{GitContext, ToolchainContext, VariableContext};
