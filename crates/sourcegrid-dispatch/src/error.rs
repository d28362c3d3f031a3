//! Dispatch error types.

use std::time::Duration;

use sourcegrid_state::{InstanceKey, NodeId};
use thiserror::Error;

/// Errors a single transport call can produce.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, reset, or handshake failure.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request was sent but the exchange failed or returned a server error.
    #[error("request failed: {0}")]
    Request(String),

    /// No answer within the call timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The worker understood the command and refused it.
    #[error("rejected by worker: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

/// Errors surfaced by the dispatcher after retries are exhausted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("worker {node} unreachable for {target} after {attempts} attempt(s)")]
    Unreachable {
        node: NodeId,
        target: InstanceKey,
        attempts: u32,
    },

    #[error("worker {node} rejected command for {target}: {reason}")]
    Rejected {
        node: NodeId,
        target: InstanceKey,
        reason: String,
    },

    #[error("dispatch to {target} cancelled by caller")]
    Cancelled { target: InstanceKey },
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Failure to read the live node set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("node registry error: {0}")]
pub struct RegistryError(pub String);
