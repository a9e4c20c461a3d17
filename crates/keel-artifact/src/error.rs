//! Artifact resolution error types.

use thiserror::Error;

pub type ArtifactResult<T> = Result<T, ArtifactError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArtifactError {
    /// No build exists for the revision, or its tag is unknown to the registry.
    #[error("no artifact found for revision {0}")]
    NotFound(String),

    /// Transient lookup failure; the caller may retry.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error(transparent)]
    InvalidReference(#[from] keel_core::ReferenceError),
}

impl ArtifactError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArtifactError::RegistryUnavailable(_))
    }
}
