//! Update coordinator error types.

use thiserror::Error;

use sourcegrid_lifecycle::LifecycleError;
use sourcegrid_state::StateError;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
