//! Rollout error types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use keel_artifact::ArtifactError;
use keel_health::HealthError;

use crate::workload::WorkloadError;

pub type RolloutResult<T> = Result<T, RolloutError>;

/// Everything that can end a rollout (or refuse to start one).
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RolloutError {
    #[error("no artifact found for revision {revision}")]
    NotFound { revision: String },

    /// Transient; retried with backoff before it surfaces.
    #[error("registry unavailable: {message}")]
    RegistryUnavailable { message: String },

    #[error("invalid image reference: {message}")]
    InvalidReference { message: String },

    #[error(
        "infeasible plan: max_unavailable={max_unavailable} and max_surge={max_surge} allow no progress"
    )]
    InfeasiblePlan { max_unavailable: u32, max_surge: u32 },

    #[error("health gate timed out on {target} after {elapsed:?}")]
    HealthTimeout { target: String, elapsed: Duration },

    #[error("rollout cancelled")]
    Cancelled,

    #[error("a rollout is already in progress for {target}")]
    RolloutInProgress { target: String },

    #[error("workload error: {message}")]
    Workload { message: String },
}

impl RolloutError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RolloutError::RegistryUnavailable { .. })
    }
}

impl From<ArtifactError> for RolloutError {
    fn from(e: ArtifactError) -> Self {
        match e {
            ArtifactError::NotFound(revision) => RolloutError::NotFound { revision },
            ArtifactError::RegistryUnavailable(message) => {
                RolloutError::RegistryUnavailable { message }
            }
            ArtifactError::InvalidReference(e) => RolloutError::InvalidReference {
                message: e.to_string(),
            },
        }
    }
}

impl From<HealthError> for RolloutError {
    fn from(e: HealthError) -> Self {
        match e {
            HealthError::HealthTimeout {
                target, elapsed, ..
            } => RolloutError::HealthTimeout { target, elapsed },
            HealthError::Cancelled => RolloutError::Cancelled,
        }
    }
}

impl From<WorkloadError> for RolloutError {
    fn from(e: WorkloadError) -> Self {
        RolloutError::Workload {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_registry_unavailable_is_retryable() {
        assert!(RolloutError::from(ArtifactError::RegistryUnavailable("503".into())).is_retryable());
        assert!(!RolloutError::from(ArtifactError::NotFound("abc".into())).is_retryable());
        assert!(!RolloutError::Cancelled.is_retryable());
    }

    #[test]
    fn health_errors_map_onto_taxonomy() {
        let err = RolloutError::from(HealthError::HealthTimeout {
            target: "web".into(),
            elapsed: Duration::from_secs(30),
            streak: 1,
        });
        assert!(matches!(err, RolloutError::HealthTimeout { ref target, .. } if target == "web"));
        assert_eq!(RolloutError::from(HealthError::Cancelled), RolloutError::Cancelled);
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(RolloutError::RolloutInProgress {
            target: "web".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "rollout_in_progress");
        assert_eq!(json["target"], "web");
    }
}
