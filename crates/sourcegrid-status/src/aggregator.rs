//! Status aggregator.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sourcegrid_dispatch::{Command, CommandReply, DispatchTarget, Dispatcher, NodeRegistry};
use sourcegrid_state::{
    AggregatedStatus, ConnectorDefinition, DesiredState, InstanceKey, InstanceRecord,
    InstanceState, InstanceStatusEntry, NodeId, ReportedState, WorkerNode,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("instance {instance} unreachable: {reason}")]
    Unreachable { instance: InstanceKey, reason: String },
}

pub type StatusResult<T> = Result<T, StatusError>;

/// Aggregator tuning.
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Upper bound on one whole aggregation, regardless of per-call timeouts.
    pub aggregation_deadline: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            aggregation_deadline: Duration::from_secs(10),
        }
    }
}

/// Fans `FetchStatus` out to workers and merges the replies.
#[derive(Clone)]
pub struct StatusAggregator {
    dispatcher: Dispatcher,
    registry: Arc<dyn NodeRegistry>,
    config: StatusConfig,
}

impl StatusAggregator {
    pub fn new(dispatcher: Dispatcher, registry: Arc<dyn NodeRegistry>, config: StatusConfig) -> Self {
        Self {
            dispatcher,
            registry,
            config,
        }
    }

    async fn live_nodes(&self) -> HashMap<NodeId, WorkerNode> {
        match self.registry.live_nodes().await {
            Ok(nodes) => nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            Err(e) => {
                warn!(error = %e, "node registry unavailable; reporting instances as unknown");
                HashMap::new()
            }
        }
    }

    /// Merged status of every instance of `def`.
    ///
    /// Never fails: instances whose worker does not answer in time, and
    /// ordinals with no record, are reported as `UNKNOWN`.
    pub async fn aggregate(
        &self,
        def: &ConnectorDefinition,
        records: &[InstanceRecord],
        cancel: &CancellationToken,
    ) -> AggregatedStatus {
        let live = self.live_nodes().await;
        let targets: Vec<DispatchTarget> = records
            .iter()
            .filter_map(|record| {
                let node = record.node_id.as_ref().and_then(|id| live.get(id))?;
                Some(DispatchTarget {
                    node: node.clone(),
                    key: record.key(),
                    command: Command::FetchStatus,
                })
            })
            .collect();

        // Calls still outstanding at the deadline are cancelled; finished ones are kept.
        let scope = cancel.child_token();
        let deadline = tokio::time::Instant::now() + self.config.aggregation_deadline;
        let fan_out = self.dispatcher.dispatch_all(targets, &scope);
        tokio::pin!(fan_out);
        let results = tokio::select! {
            results = &mut fan_out => results,
            _ = tokio::time::sleep_until(deadline) => {
                warn!(definition = %def.id, "aggregation deadline reached");
                scope.cancel();
                fan_out.await
            }
        };

        let mut replies: HashMap<u32, CommandReply> = HashMap::new();
        for (key, result) in results {
            match result {
                Ok(reply) => {
                    replies.insert(key.ordinal, reply);
                }
                Err(e) => debug!(definition = %def.id, ordinal = key.ordinal, error = %e, "status fetch failed"),
            }
        }

        merge(def, records, &live, &replies)
    }

    /// Status of a single instance, straight from its worker.
    pub async fn instance_status(
        &self,
        def: &ConnectorDefinition,
        record: &InstanceRecord,
        cancel: &CancellationToken,
    ) -> StatusResult<InstanceStatusEntry> {
        let key = record.key();
        let Some(node_id) = record.node_id.as_ref() else {
            return Ok(entry_from_record(record, ReportedState::from(record.state)));
        };

        let live = self.live_nodes().await;
        let Some(node) = live.get(node_id) else {
            return Err(StatusError::Unreachable {
                instance: key,
                reason: format!("node {node_id} is not live"),
            });
        };

        let reply = tokio::time::timeout(
            self.config.aggregation_deadline,
            self.dispatcher.dispatch(node, &key, &Command::FetchStatus, cancel),
        )
        .await
        .map_err(|_| StatusError::Unreachable {
            instance: key.clone(),
            reason: "status deadline exceeded".to_string(),
        })?
        .map_err(|e| StatusError::Unreachable {
            instance: key.clone(),
            reason: e.to_string(),
        })?;

        debug!(definition = %def.id, ordinal = record.ordinal, "instance status fetched");
        Ok(entry_from_reply(record, &reply))
    }
}

fn merge(
    def: &ConnectorDefinition,
    records: &[InstanceRecord],
    live: &HashMap<NodeId, WorkerNode>,
    replies: &HashMap<u32, CommandReply>,
) -> AggregatedStatus {
    let mut entries: BTreeMap<u32, InstanceStatusEntry> = BTreeMap::new();

    for record in records {
        let entry = match (replies.get(&record.ordinal), record.node_id.as_ref()) {
            (Some(reply), _) => entry_from_reply(record, reply),
            // Never placed: nothing to ask, the record is authoritative.
            (None, None) => entry_from_record(record, ReportedState::from(record.state)),
            (None, Some(node)) => {
                if !live.contains_key(node) {
                    debug!(definition = %def.id, ordinal = record.ordinal, %node, "owning node not live");
                }
                entry_from_record(record, ReportedState::Unknown)
            }
        };
        entries.insert(record.ordinal, entry);
    }

    for ordinal in 0..def.parallelism {
        entries.entry(ordinal).or_insert_with(|| InstanceStatusEntry {
            ordinal,
            state: ReportedState::Unknown,
            node_id: None,
            config_version: 0,
            num_restarts: 0,
            num_received: 0,
            num_written: 0,
            last_error: None,
            last_heartbeat: 0,
        });
    }

    let instances: Vec<InstanceStatusEntry> = entries.into_values().collect();
    let num_running = instances
        .iter()
        .filter(|e| e.state == ReportedState::Running)
        .count() as u32;
    let all_current = instances
        .iter()
        .filter(|e| e.ordinal < def.parallelism)
        .all(|e| e.state == ReportedState::Running && e.config_version == def.version);
    let healthy = all_current && num_running == def.parallelism;

    AggregatedStatus {
        definition: def.id.clone(),
        version: def.version,
        parallelism: def.parallelism,
        num_running,
        instances,
        healthy,
    }
}

fn entry_from_record(record: &InstanceRecord, state: ReportedState) -> InstanceStatusEntry {
    InstanceStatusEntry {
        ordinal: record.ordinal,
        state,
        node_id: record.node_id.clone(),
        config_version: record.config_version,
        num_restarts: record.restart_count,
        num_received: 0,
        num_written: 0,
        last_error: record.failure.as_ref().map(|f| f.to_string()),
        last_heartbeat: record.last_heartbeat,
    }
}

/// Combine a worker reply with the record it answers for.
fn entry_from_reply(record: &InstanceRecord, reply: &CommandReply) -> InstanceStatusEntry {
    let state = if reply.running {
        ReportedState::Running
    } else {
        match record.state {
            InstanceState::Running if record.desired == DesiredState::Running => ReportedState::Failed,
            InstanceState::Running => ReportedState::Stopped,
            other => ReportedState::from(other),
        }
    };
    InstanceStatusEntry {
        ordinal: record.ordinal,
        state,
        node_id: record.node_id.clone(),
        config_version: if reply.running {
            reply.config_version
        } else {
            record.config_version
        },
        num_restarts: reply.num_restarts,
        num_received: reply.num_received,
        num_written: reply.num_written,
        last_error: reply
            .last_error
            .clone()
            .or_else(|| record.failure.as_ref().map(|f| f.to_string())),
        last_heartbeat: record.last_heartbeat,
    }
}
