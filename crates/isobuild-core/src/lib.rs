//! Core domain types and traits for the isobuild artifact pipeline.
//!
//! This crate contains:
//! - Resource identifiers and the error taxonomy
//! - The immutable build environment handed to the builder stage
//! - Compiled artifact, inspection and handoff types
//! - Runtime image types and the assembler trait
//! - Pipeline definition and state
//! - Executor trait and job types

pub mod artifact;
pub mod environment;
pub mod error;
pub mod executor;
pub mod id;
pub mod image;
pub mod inspect;
pub mod pipeline;

pub use error::{Error, Result};
pub use id::ResourceId;
