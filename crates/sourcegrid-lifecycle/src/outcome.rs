//! Per-instance results of lifecycle operations.

use serde::{Deserialize, Serialize};

use sourcegrid_dispatch::DispatchError;
use sourcegrid_state::{InstanceRecord, NodeId, WorkerInstanceStatus};

/// What the controller did to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Stop,
    Restart,
    Remove,
    Noop,
}

/// Why an action on one instance did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum OutcomeError {
    Unreachable(String),
    Rejected(String),
    NoCapacity(String),
    Internal(String),
}

impl std::fmt::Display for OutcomeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeError::Unreachable(m) => write!(f, "unreachable: {m}"),
            OutcomeError::Rejected(m) => write!(f, "rejected: {m}"),
            OutcomeError::NoCapacity(m) => write!(f, "no capacity: {m}"),
            OutcomeError::Internal(m) => write!(f, "internal: {m}"),
        }
    }
}

impl From<&DispatchError> for OutcomeError {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::Rejected { reason, .. } => OutcomeError::Rejected(reason.clone()),
            other => OutcomeError::Unreachable(other.to_string()),
        }
    }
}

/// Result of one action on one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOutcome {
    pub ordinal: u32,
    pub node_id: Option<NodeId>,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

impl InstanceOutcome {
    pub(crate) fn ok(record: &InstanceRecord, action: Action) -> Self {
        Self {
            ordinal: record.ordinal,
            node_id: record.node_id.clone(),
            action,
            error: None,
        }
    }

    pub(crate) fn failed(record: &InstanceRecord, action: Action, error: OutcomeError) -> Self {
        Self {
            ordinal: record.ordinal,
            node_id: record.node_id.clone(),
            action,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A worker's status report for one instance it hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub tenant: String,
    pub namespace: String,
    pub name: String,
    pub ordinal: u32,
    pub status: WorkerInstanceStatus,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub outcomes: Vec<InstanceOutcome>,
    /// Ordinals left without a node because placement failed.
    pub unplaced: Vec<u32>,
    /// Records whose version was adopted without a restart.
    pub adopted: usize,
}

impl ReconcileReport {
    /// Nothing was sent or changed.
    pub fn is_quiet(&self) -> bool {
        self.outcomes.is_empty() && self.unplaced.is_empty() && self.adopted == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &InstanceOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }
}
