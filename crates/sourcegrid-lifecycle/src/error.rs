//! Lifecycle controller error types.

use thiserror::Error;

use sourcegrid_dispatch::RegistryError;
use sourcegrid_placement::PlacementError;
use sourcegrid_state::{InstanceKey, InstanceState, StateError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("illegal transition {from:?} -> {to:?} for {key}")]
    IllegalTransition {
        key: InstanceKey,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceKey),

    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("operation cancelled by caller")]
    Cancelled,
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
