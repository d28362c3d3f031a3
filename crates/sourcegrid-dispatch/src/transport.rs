//! Collaborator seams: how commands reach workers and who the workers are.
//!
//! Both are injected into the orchestrator at construction time.

use async_trait::async_trait;

use sourcegrid_state::{InstanceKey, WorkerNode};

use crate::command::{Command, CommandReply};
use crate::error::{RegistryError, TransportError};

/// Delivers one command to one worker and returns its reply.
///
/// Implementations need not enforce timeouts; the dispatcher bounds every call.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn send(
        &self,
        node: &WorkerNode,
        target: &InstanceKey,
        command: &Command,
    ) -> Result<CommandReply, TransportError>;
}

/// Supplies the set of worker nodes currently considered alive.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn live_nodes(&self) -> Result<Vec<WorkerNode>, RegistryError>;
}
