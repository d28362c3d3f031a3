//! In-process worker fleet.
//!
//! Implements both [`WorkerTransport`] and [`NodeRegistry`] against
//! simulated workers for tests and local runs.
//! Individual nodes can be made unreachable, made to hang, or made to
//! reject starts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use sourcegrid_state::{InstanceKey, NodeId, WorkerInstanceStatus, WorkerNode};

use crate::command::{Command, CommandReply, Verb};
use crate::error::{RegistryError, TransportError};
use crate::transport::{NodeRegistry, WorkerTransport};

/// A command the fleet received, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub node: NodeId,
    pub target: InstanceKey,
    pub verb: Verb,
}

#[derive(Debug)]
struct SimWorker {
    node: WorkerNode,
    live: bool,
    reachable: bool,
    hanging: bool,
    reject_starts: Option<String>,
    instances: HashMap<InstanceKey, WorkerInstanceStatus>,
}

impl SimWorker {
    fn apply(&mut self, target: &InstanceKey, command: &Command) -> Result<CommandReply, TransportError> {
        match command {
            Command::Start(payload) | Command::Restart(payload) => {
                if let Some(reason) = &self.reject_starts {
                    return Err(TransportError::Rejected(reason.clone()));
                }
                let status = self.instances.entry(target.clone()).or_default();
                if matches!(command, Command::Restart(_)) {
                    status.num_restarts += 1;
                }
                status.running = true;
                status.config_version = payload.config_version;
                status.last_error = None;
                Ok(status.clone())
            }
            Command::Stop => {
                let status = self.instances.entry(target.clone()).or_default();
                status.running = false;
                Ok(status.clone())
            }
            Command::FetchStatus => Ok(self.instances.get(target).cloned().unwrap_or_default()),
        }
    }
}

#[derive(Debug, Default)]
struct Fleet {
    workers: BTreeMap<NodeId, SimWorker>,
    log: Vec<SentCommand>,
}

/// Simulated worker nodes.
#[derive(Debug, Default)]
pub struct InMemoryWorkers {
    fleet: Mutex<Fleet>,
}

enum Outcome {
    Reply(Result<CommandReply, TransportError>),
    Hang,
}

impl InMemoryWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    fn fleet(&self) -> MutexGuard<'_, Fleet> {
        self.fleet.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add (or replace) a live, reachable worker.
    pub fn add_node(&self, node: WorkerNode) {
        let id = node.id.clone();
        self.fleet().workers.insert(
            id,
            SimWorker {
                node,
                live: true,
                reachable: true,
                hanging: false,
                reject_starts: None,
                instances: HashMap::new(),
            },
        );
    }

    /// Drop a worker from the live set; commands to it fail to connect.
    pub fn kill_node(&self, id: &str) {
        if let Some(worker) = self.fleet().workers.get_mut(id) {
            worker.live = false;
            worker.reachable = false;
            worker.instances.clear();
        }
    }

    /// Keep the worker live but refuse its connections.
    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        if let Some(worker) = self.fleet().workers.get_mut(id) {
            worker.reachable = !unreachable;
        }
    }

    /// Keep the worker live but never answer its calls.
    pub fn set_hanging(&self, id: &str, hanging: bool) {
        if let Some(worker) = self.fleet().workers.get_mut(id) {
            worker.hanging = hanging;
        }
    }

    /// Make the worker reject start and restart with `reason`.
    pub fn reject_starts(&self, id: &str, reason: Option<&str>) {
        if let Some(worker) = self.fleet().workers.get_mut(id) {
            worker.reject_starts = reason.map(str::to_string);
        }
    }

    /// Simulate an instance crashing on its worker.
    pub fn crash_instance(&self, key: &InstanceKey, error: &str) {
        for worker in self.fleet().workers.values_mut() {
            if let Some(status) = worker.instances.get_mut(key) {
                status.running = false;
                status.last_error = Some(error.to_string());
            }
        }
    }

    /// Node currently hosting a running copy of `key`, if any.
    pub fn running_on(&self, key: &InstanceKey) -> Vec<NodeId> {
        self.fleet()
            .workers
            .iter()
            .filter(|(_, w)| w.instances.get(key).is_some_and(|s| s.running))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every running instance across the fleet.
    pub fn running_instances(&self) -> Vec<InstanceKey> {
        let fleet = self.fleet();
        let mut keys: Vec<InstanceKey> = fleet
            .workers
            .values()
            .flat_map(|w| {
                w.instances
                    .iter()
                    .filter(|(_, s)| s.running)
                    .map(|(k, _)| k.clone())
            })
            .collect();
        keys.sort_by(|a, b| a.table_key().cmp(&b.table_key()));
        keys
    }

    pub fn command_log(&self) -> Vec<SentCommand> {
        self.fleet().log.clone()
    }

    pub fn clear_log(&self) {
        self.fleet().log.clear();
    }

    /// Count of logged commands with the given verb.
    pub fn count(&self, verb: Verb) -> usize {
        self.fleet().log.iter().filter(|c| c.verb == verb).count()
    }
}

#[async_trait]
impl WorkerTransport for InMemoryWorkers {
    async fn send(
        &self,
        node: &WorkerNode,
        target: &InstanceKey,
        command: &Command,
    ) -> Result<CommandReply, TransportError> {
        let outcome = {
            let mut fleet = self.fleet();
            fleet.log.push(SentCommand {
                node: node.id.clone(),
                target: target.clone(),
                verb: command.verb(),
            });
            match fleet.workers.get_mut(&node.id) {
                None => Outcome::Reply(Err(TransportError::Connect(format!(
                    "no worker at {}",
                    node.endpoint()
                )))),
                Some(worker) if worker.hanging => Outcome::Hang,
                Some(worker) if !worker.reachable => Outcome::Reply(Err(
                    TransportError::Connect(format!("connection refused by {}", node.id)),
                )),
                Some(worker) => Outcome::Reply(worker.apply(target, command)),
            }
        };

        match outcome {
            Outcome::Reply(result) => result,
            Outcome::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Request("worker never answered".to_string()))
            }
        }
    }
}

#[async_trait]
impl NodeRegistry for InMemoryWorkers {
    async fn live_nodes(&self) -> Result<Vec<WorkerNode>, RegistryError> {
        Ok(self
            .fleet()
            .workers
            .values()
            .filter(|w| w.live)
            .map(|w| w.node.clone())
            .collect())
    }
}
