//! Error types for isobuild.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Package installation could not satisfy the declared dependency set.
    #[error("environment provisioning failed: {0}")]
    Provisioning(String),

    /// The service source failed to compile or link under the given flags.
    #[error("compilation failed: {0}")]
    Compilation(String),

    /// The artifact was not where the runtime stage expected it.
    #[error("artifact handoff failed: {0}")]
    ArtifactHandoff(String),

    /// The artifact was produced but is not static or not stripped as declared.
    #[error("artifact invariant violated: {0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short machine-readable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Provisioning(_) => "provisioning",
            Error::Compilation(_) => "compilation",
            Error::ArtifactHandoff(_) => "artifact-handoff",
            Error::InvariantViolation(_) => "invariant-violation",
            Error::NotFound(_) => "not-found",
            Error::InvalidInput(_) => "invalid-input",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
