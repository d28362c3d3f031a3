//! Membership manager: tracks worker node state.
//!
//! Manages the set of worker nodes, their status, and detects dead nodes
//! based on missed heartbeats.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sourcegrid_dispatch::{NodeRegistry, RegistryError};
use sourcegrid_state::{ResourceLimits, StateResult, StateStore, WorkerNode, epoch_secs};

/// Status of a worker in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Ready,
    /// Alive, but takes no new instances.
    Draining,
    /// Missed heartbeats for longer than the dead timeout.
    Dead,
}

/// A worker node with its derived status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Member {
    #[serde(flatten)]
    pub node: WorkerNode,
    pub status: MemberStatus,
}

/// A worker announcing itself.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    /// Stable id chosen by the worker. Generated when absent.
    #[serde(default)]
    pub node_id: Option<String>,
    pub address: String,
    pub port: u16,
    pub capacity: ResourceLimits,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Periodic liveness signal with current resource usage.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub used: ResourceLimits,
    /// Set to start or stop draining.
    #[serde(default)]
    pub draining: Option<bool>,
}

/// Manages worker membership.
///
/// Node information is persisted to the `StateStore`; liveness is derived
/// from the last heartbeat on every read.
#[derive(Clone)]
pub struct MembershipManager {
    state: StateStore,
    /// Dead node detection threshold.
    dead_timeout: Duration,
    /// Heartbeat interval expected from workers.
    heartbeat_interval: Duration,
}

impl MembershipManager {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            dead_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
        }
    }

    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_interval_secs(&self) -> u32 {
        self.heartbeat_interval.as_secs() as u32
    }

    /// Register a worker, or refresh it if it rejoins under the same id.
    pub fn join(&self, request: JoinRequest) -> StateResult<WorkerNode> {
        let node_id = request
            .node_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| generate_node_id(&request.address, request.port));

        let mut node = WorkerNode::new(&node_id, &request.address, request.port, request.capacity);
        node.labels = request.labels;

        let rejoined = self.state.get_node(&node_id)?.is_some();
        self.state.put_node(&node)?;
        info!(
            %node_id,
            address = %request.address,
            port = request.port,
            rejoined,
            "worker joined cluster"
        );
        Ok(node)
    }

    /// Process a heartbeat. Returns `false` for an unknown worker, which
    /// should join again.
    pub fn heartbeat(&self, node_id: &str, request: &HeartbeatRequest) -> StateResult<bool> {
        match self.state.get_node(node_id)? {
            Some(mut node) => {
                node.used = request.used;
                if let Some(draining) = request.draining {
                    if draining != node.draining {
                        info!(%node_id, draining, "worker drain state changed");
                    }
                    node.draining = draining;
                }
                node.last_heartbeat = epoch_secs();
                self.state.put_node(&node)?;
                debug!(%node_id, "heartbeat received");
                Ok(true)
            }
            None => {
                warn!(%node_id, "heartbeat from unknown worker");
                Ok(false)
            }
        }
    }

    /// Remove a worker from the cluster.
    pub fn leave(&self, node_id: &str) -> StateResult<bool> {
        let existed = self.state.delete_node(node_id)?;
        if existed {
            info!(%node_id, "worker left cluster");
        }
        Ok(existed)
    }

    pub fn list_members(&self) -> StateResult<Vec<Member>> {
        let now = epoch_secs();
        Ok(self
            .state
            .list_nodes()?
            .into_iter()
            .map(|node| self.member(node, now))
            .collect())
    }

    pub fn get_member(&self, node_id: &str) -> StateResult<Option<Member>> {
        let now = epoch_secs();
        Ok(self.state.get_node(node_id)?.map(|node| self.member(node, now)))
    }

    /// Detect and remove dead workers. Returns the removed ids.
    pub fn reap_dead_nodes(&self) -> StateResult<Vec<String>> {
        let mut reaped = Vec::new();
        for member in self.list_members()? {
            if member.status == MemberStatus::Dead {
                self.state.delete_node(&member.node.id)?;
                warn!(node_id = %member.node.id, "reaped dead worker");
                reaped.push(member.node.id);
            }
        }
        Ok(reaped)
    }

    pub fn ready_count(&self) -> StateResult<usize> {
        Ok(self
            .list_members()?
            .iter()
            .filter(|m| m.status == MemberStatus::Ready)
            .count())
    }

    /// Reap dead workers every `interval` until `shutdown` is cancelled.
    pub async fn run_reaper(&self, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reap_dead_nodes() {
                        error!(error = %e, "failed to reap dead workers");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("membership reaper shutting down");
                    break;
                }
            }
        }
    }

    fn member(&self, node: WorkerNode, now: u64) -> Member {
        let status = if now.saturating_sub(node.last_heartbeat) > self.dead_timeout.as_secs() {
            MemberStatus::Dead
        } else if node.draining {
            MemberStatus::Draining
        } else {
            MemberStatus::Ready
        };
        Member { node, status }
    }
}

/// Workers that are not dead. Draining workers stay live so commands still
/// reach the instances they host; placement skips them.
#[async_trait]
impl NodeRegistry for MembershipManager {
    async fn live_nodes(&self) -> Result<Vec<WorkerNode>, RegistryError> {
        let members = self
            .list_members()
            .map_err(|e| RegistryError(format!("membership unavailable: {e}")))?;
        Ok(members
            .into_iter()
            .filter(|m| m.status != MemberStatus::Dead)
            .map(|m| m.node)
            .collect())
    }
}

/// Generate a node ID from address and port.
fn generate_node_id(address: &str, port: u16) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    address.hash(&mut hasher);
    port.hash(&mut hasher);
    epoch_secs().hash(&mut hasher);
    format!("node-{:08x}", hasher.finish() as u32)
}
