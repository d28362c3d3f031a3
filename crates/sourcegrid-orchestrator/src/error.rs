//! The public error taxonomy of the control plane.

use thiserror::Error;

use sourcegrid_lifecycle::{InstanceOutcome, LifecycleError, OutcomeError};
use sourcegrid_placement::PlacementError;
use sourcegrid_rollout::RolloutError;
use sourcegrid_state::StateError;
use sourcegrid_status::StatusError;

use crate::artifacts::ArtifactError;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no capacity: {0}")]
    NoCapacity(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("{} of {} instances failed", failed_count(.0), .0.len())]
    PartialFailure(Vec<InstanceOutcome>),

    #[error("internal error: {0}")]
    Internal(String),
}

fn failed_count(outcomes: &[InstanceOutcome]) -> usize {
    outcomes.iter().filter(|o| !o.is_ok()).count()
}

impl From<StateError> for OrchestratorError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(key) => OrchestratorError::NotFound(key),
            StateError::AlreadyExists(key) => OrchestratorError::AlreadyExists(key),
            StateError::VersionConflict {
                expected, actual, ..
            } => OrchestratorError::VersionConflict { expected, actual },
            StateError::Conflict(msg) => OrchestratorError::Conflict(msg),
            other => OrchestratorError::Internal(other.to_string()),
        }
    }
}

impl From<LifecycleError> for OrchestratorError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::InstanceNotFound(key) => OrchestratorError::NotFound(key.to_string()),
            LifecycleError::Placement(e @ PlacementError::NoCapacity { .. }) => {
                OrchestratorError::NoCapacity(e.to_string())
            }
            LifecycleError::State(e) => e.into(),
            LifecycleError::Registry(e) => OrchestratorError::Unreachable(e.to_string()),
            other => OrchestratorError::Internal(other.to_string()),
        }
    }
}

impl From<RolloutError> for OrchestratorError {
    fn from(err: RolloutError) -> Self {
        match err {
            RolloutError::InvalidUpdate(msg) => OrchestratorError::InvalidUpdate(msg),
            RolloutError::Lifecycle(e) => e.into(),
            RolloutError::State(e) => e.into(),
        }
    }
}

impl From<StatusError> for OrchestratorError {
    fn from(err: StatusError) -> Self {
        OrchestratorError::Unreachable(err.to_string())
    }
}

impl From<ArtifactError> for OrchestratorError {
    fn from(err: ArtifactError) -> Self {
        OrchestratorError::InvalidConfig(err.to_string())
    }
}

impl From<OutcomeError> for OrchestratorError {
    fn from(err: OutcomeError) -> Self {
        match err {
            OutcomeError::Unreachable(msg) | OutcomeError::Rejected(msg) => {
                OrchestratorError::Unreachable(msg)
            }
            OutcomeError::NoCapacity(msg) => OrchestratorError::NoCapacity(msg),
            OutcomeError::Internal(msg) => OrchestratorError::Internal(msg),
        }
    }
}
