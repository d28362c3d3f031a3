//! Lifecycle controller: reconciles instance records with their definition.
//!
//! The controller owns every write to the instance arena. Each pass compares
//! the desired shape of a definition (parallelism, effective config digest,
//! desired run state) with the persisted records and the live node set, and
//! issues at most one corrective command per gap. Callers must hold the
//! definition's [`IdentityGuard`].
//!
//! Commands run on spawned tasks that keep a clone of the guard, so a caller
//! that gives up waiting (cancellation) does not lose the outcome: the task
//! still records it on the instance before releasing the identity.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sourcegrid_dispatch::{Command, CommandReply, DispatchError, Dispatcher, NodeRegistry, StartPayload};
use sourcegrid_placement::{
    PlacementPlan, PlacementPolicy, compute_placement, definition_to_requirements, node_loads,
};
use sourcegrid_state::{
    ConnectorDefinition, DefinitionId, DesiredState, FailureReason, InstanceKey, InstanceRecord,
    InstanceState, NodeId, StateStore, WorkerNode, epoch_secs,
};

use crate::arena::InstanceArena;
use crate::error::{LifecycleError, LifecycleResult};
use crate::locks::{IdentityGuard, IdentityLocks};
use crate::outcome::{Action, InstanceOutcome, InstanceReport, OutcomeError, ReconcileReport};
use crate::state_machine::{fail, reset_to_pending, transition};

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// An active instance with no report for longer than this is failed.
    /// Zero disables the check.
    pub heartbeat_threshold: Duration,
    /// Automatic FAILED → PENDING retries before waiting for an operator.
    pub max_auto_retries: u32,
    /// Stale-config restarts a single reconcile pass may issue.
    pub max_restarts_per_pass: u32,
    pub placement: PlacementPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_threshold: Duration::from_secs(30),
            max_auto_retries: 3,
            max_restarts_per_pass: 1,
            placement: PlacementPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Start,
    Restart,
    Stop,
    Remove,
}

impl Op {
    fn action(self) -> Action {
        match self {
            Op::Start => Action::Start,
            Op::Restart => Action::Restart,
            Op::Stop => Action::Stop,
            Op::Remove => Action::Remove,
        }
    }
}

struct Planned {
    record: InstanceRecord,
    node: WorkerNode,
    op: Op,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperatorVerb {
    Start,
    Stop,
    Restart,
}

type LiveNodes = BTreeMap<NodeId, WorkerNode>;

/// The lifecycle controller. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleController {
    arena: InstanceArena,
    dispatcher: Dispatcher,
    registry: Arc<dyn NodeRegistry>,
    locks: IdentityLocks,
    config: Arc<LifecycleConfig>,
    shutdown: CancellationToken,
}

impl LifecycleController {
    pub fn new(
        store: StateStore,
        dispatcher: Dispatcher,
        registry: Arc<dyn NodeRegistry>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            arena: InstanceArena::new(store),
            dispatcher,
            registry,
            locks: IdentityLocks::new(),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that aborts in-flight commands; cancelled on daemon shutdown.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn arena(&self) -> &InstanceArena {
        &self.arena
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Wait for exclusive access to a definition.
    pub async fn lock(&self, id: &DefinitionId) -> IdentityGuard {
        self.locks.lock(id).await
    }

    /// Exclusive access to a definition, only if it is free right now.
    pub fn try_lock(&self, id: &DefinitionId) -> Option<IdentityGuard> {
        self.locks.try_lock(id)
    }

    pub async fn live_nodes(&self) -> LifecycleResult<Vec<WorkerNode>> {
        Ok(self.registry.live_nodes().await?)
    }

    async fn live_map(&self) -> LifecycleResult<LiveNodes> {
        Ok(self
            .live_nodes()
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect())
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Drive the records of `def` towards its desired shape.
    ///
    /// Running this again with nothing changed issues no commands.
    pub async fn reconcile(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        cancel: &CancellationToken,
    ) -> LifecycleResult<ReconcileReport> {
        debug_assert_eq!(guard.id(), &def.id);
        let live = self.live_map().await?;
        let records = self.arena.records(&def.id)?;
        let digest = def.config_digest();
        let now = epoch_secs();
        let threshold = self.config.heartbeat_threshold.as_secs();

        let mut report = ReconcileReport::default();
        let mut planned = Vec::new();
        let mut needs_node = Vec::new();
        let mut removals = Vec::new();
        let mut restarts = 0;
        let present: BTreeSet<u32> = records.iter().map(|r| r.ordinal).collect();

        for mut record in records {
            if record.ordinal >= def.parallelism {
                removals.push(record);
                continue;
            }

            let node = owning_node(&record, &live);
            if record.node_id.is_some()
                && node.is_none()
                && !matches!(record.state, InstanceState::Stopped | InstanceState::Failed)
            {
                warn!(instance = %record.key(), node = ?record.node_id, "instance lost its node");
                fail(&mut record, FailureReason::NodeLost);
                self.arena.save(&mut record)?;
            } else if record.state.is_active()
                && threshold > 0
                && now.saturating_sub(record.last_heartbeat) > threshold
            {
                warn!(
                    instance = %record.key(),
                    last_heartbeat = record.last_heartbeat,
                    "instance missed heartbeats"
                );
                fail(&mut record, FailureReason::MissedHeartbeats);
                self.arena.save(&mut record)?;
            }

            match (record.desired, record.state) {
                (DesiredState::Stopped, InstanceState::Running | InstanceState::Starting) => {
                    if let Some(node) = node {
                        planned.push(Planned { record, node, op: Op::Stop });
                    }
                }
                (DesiredState::Stopped, InstanceState::Pending) => {
                    transition(&mut record, InstanceState::Stopped)?;
                    self.arena.save(&mut record)?;
                }
                (DesiredState::Stopped, _) => {}
                (DesiredState::Running, InstanceState::Stopping) => match node {
                    Some(node) => planned.push(Planned { record, node, op: Op::Stop }),
                    None => {
                        transition(&mut record, InstanceState::Stopped)?;
                        self.arena.save(&mut record)?;
                    }
                },
                (DesiredState::Running, InstanceState::Pending | InstanceState::Stopped) => {
                    transition(&mut record, InstanceState::Pending)?;
                    self.queue_start(record, node, &mut planned, &mut needs_node);
                }
                (DesiredState::Running, InstanceState::Failed) => {
                    if record.failure == Some(FailureReason::Unreachable) {
                        if node.is_some() {
                            debug!(
                                instance = %record.key(),
                                node = ?record.node_id,
                                "node unreachable, waiting for operator"
                            );
                            continue;
                        }
                        // The node has since left the fleet: reschedule like any lost node.
                        record.failure = Some(FailureReason::NodeLost);
                    }
                    let node_lost = record.failure == Some(FailureReason::NodeLost);
                    if !node_lost && record.auto_retries >= self.config.max_auto_retries {
                        debug!(
                            instance = %record.key(),
                            retries = record.auto_retries,
                            "retry budget exhausted, waiting for operator"
                        );
                        continue;
                    }
                    if !node_lost {
                        record.auto_retries += 1;
                    }
                    info!(
                        instance = %record.key(),
                        reason = ?record.failure,
                        attempt = record.auto_retries,
                        "retrying failed instance"
                    );
                    transition(&mut record, InstanceState::Pending)?;
                    self.queue_start(record, node, &mut planned, &mut needs_node);
                }
                (DesiredState::Running, InstanceState::Running | InstanceState::Starting) => {
                    if record.config_digest != digest {
                        if restarts < self.config.max_restarts_per_pass {
                            if let Some(node) = node {
                                restarts += 1;
                                planned.push(Planned { record, node, op: Op::Restart });
                            }
                        }
                    } else if record.config_version != def.version {
                        record.config_version = def.version;
                        self.arena.save(&mut record)?;
                        report.adopted += 1;
                    }
                }
            }
        }

        for ordinal in (0..def.parallelism).filter(|o| !present.contains(o)) {
            needs_node.push(InstanceRecord::pending(def, ordinal, None));
        }

        let (starts, unplaced) = self.assign(def, needs_node, &live)?;
        planned.extend(starts);
        report.unplaced = unplaced.iter().map(|r| r.ordinal).collect();

        report.outcomes = self.execute(guard, def, planned, false, cancel).await?;
        report
            .outcomes
            .extend(self.remove_records(guard, def, removals, &live, cancel).await?);

        if !report.is_quiet() {
            info!(
                definition = %def.id,
                commands = report.outcomes.len(),
                failed = report.failures().count(),
                unplaced = report.unplaced.len(),
                adopted = report.adopted,
                "reconcile pass complete"
            );
        }
        Ok(report)
    }

    fn queue_start(
        &self,
        mut record: InstanceRecord,
        node: Option<WorkerNode>,
        planned: &mut Vec<Planned>,
        needs_node: &mut Vec<InstanceRecord>,
    ) {
        match node {
            Some(node) => planned.push(Planned { record, node, op: Op::Start }),
            None => {
                record.node_id = None;
                needs_node.push(record);
            }
        }
    }

    /// Place `records`, persist them as `PENDING`, and plan a start for each
    /// placed one. Unplaced records are persisted without a node.
    fn assign(
        &self,
        def: &ConnectorDefinition,
        records: Vec<InstanceRecord>,
        live: &LiveNodes,
    ) -> LifecycleResult<(Vec<Planned>, Vec<InstanceRecord>)> {
        if records.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let ordinals: Vec<u32> = records.iter().map(|r| r.ordinal).collect();
        let plan = match self.place(def, &ordinals, live) {
            Ok(plan) => Some(plan),
            Err(LifecycleError::Placement(e)) => {
                warn!(definition = %def.id, ?ordinals, error = %e, "instances left unplaced");
                None
            }
            Err(e) => return Err(e),
        };

        let mut planned = Vec::new();
        let mut unplaced = Vec::new();
        for mut record in records {
            let node = plan
                .as_ref()
                .and_then(|p| p.assignments.get(&record.ordinal))
                .and_then(|id| live.get(id))
                .cloned();
            record.node_id = node.as_ref().map(|n| n.id.clone());
            self.arena.save(&mut record)?;
            match node {
                Some(node) => planned.push(Planned { record, node, op: Op::Start }),
                None => unplaced.push(record),
            }
        }
        Ok((planned, unplaced))
    }

    fn place(
        &self,
        def: &ConnectorDefinition,
        ordinals: &[u32],
        live: &LiveNodes,
    ) -> LifecycleResult<PlacementPlan> {
        let nodes: Vec<WorkerNode> = live.values().cloned().collect();
        let all = self.arena.all()?;
        let loads = node_loads(&nodes, &all, &def.id);
        Ok(compute_placement(
            &def.id.to_string(),
            ordinals,
            &definition_to_requirements(def),
            &loads,
            &self.config.placement,
        )?)
    }

    // ── Operator verbs ─────────────────────────────────────────────

    pub async fn start_instance(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        ordinal: u32,
        cancel: &CancellationToken,
    ) -> LifecycleResult<InstanceOutcome> {
        self.operate_one(def, guard, OperatorVerb::Start, ordinal, cancel).await
    }

    pub async fn stop_instance(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        ordinal: u32,
        cancel: &CancellationToken,
    ) -> LifecycleResult<InstanceOutcome> {
        self.operate_one(def, guard, OperatorVerb::Stop, ordinal, cancel).await
    }

    pub async fn restart_instance(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        ordinal: u32,
        cancel: &CancellationToken,
    ) -> LifecycleResult<InstanceOutcome> {
        self.operate_one(def, guard, OperatorVerb::Restart, ordinal, cancel).await
    }

    /// Start every instance. Best effort: failures are returned as outcomes.
    pub async fn start_all(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        cancel: &CancellationToken,
    ) -> LifecycleResult<Vec<InstanceOutcome>> {
        let ordinals = self.ordinals(def)?;
        self.operate(def, guard, OperatorVerb::Start, &ordinals, cancel).await
    }

    pub async fn stop_all(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        cancel: &CancellationToken,
    ) -> LifecycleResult<Vec<InstanceOutcome>> {
        let ordinals = self.ordinals(def)?;
        self.operate(def, guard, OperatorVerb::Stop, &ordinals, cancel).await
    }

    pub async fn restart_all(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        cancel: &CancellationToken,
    ) -> LifecycleResult<Vec<InstanceOutcome>> {
        let ordinals = self.ordinals(def)?;
        self.operate(def, guard, OperatorVerb::Restart, &ordinals, cancel).await
    }

    fn ordinals(&self, def: &ConnectorDefinition) -> LifecycleResult<Vec<u32>> {
        Ok(self
            .arena
            .records(&def.id)?
            .iter()
            .map(|r| r.ordinal)
            .filter(|o| *o < def.parallelism)
            .collect())
    }

    async fn operate_one(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        verb: OperatorVerb,
        ordinal: u32,
        cancel: &CancellationToken,
    ) -> LifecycleResult<InstanceOutcome> {
        let key = InstanceKey::new(&def.id, ordinal);
        self.operate(def, guard, verb, &[ordinal], cancel)
            .await?
            .pop()
            .ok_or(LifecycleError::InstanceNotFound(key))
    }

    async fn operate(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        verb: OperatorVerb,
        ordinals: &[u32],
        cancel: &CancellationToken,
    ) -> LifecycleResult<Vec<InstanceOutcome>> {
        debug_assert_eq!(guard.id(), &def.id);
        let live = self.live_map().await?;
        let mut outcomes = Vec::new();
        let mut planned = Vec::new();
        let mut needs_node = Vec::new();

        for &ordinal in ordinals {
            let mut record = self.arena.require(&InstanceKey::new(&def.id, ordinal))?;
            let node = owning_node(&record, &live);

            match verb {
                OperatorVerb::Start => {
                    record.desired = DesiredState::Running;
                    if record.state.is_active() {
                        self.arena.save(&mut record)?;
                        outcomes.push(InstanceOutcome::ok(&record, Action::Noop));
                        continue;
                    }
                    record.auto_retries = 0;
                    reset_to_pending(&mut record)?;
                    self.queue_start(record, node, &mut planned, &mut needs_node);
                }
                OperatorVerb::Stop => {
                    record.desired = DesiredState::Stopped;
                    match (record.state, node) {
                        (InstanceState::Stopped, _) => {
                            self.arena.save(&mut record)?;
                            outcomes.push(InstanceOutcome::ok(&record, Action::Noop));
                        }
                        (
                            InstanceState::Running | InstanceState::Starting | InstanceState::Stopping,
                            Some(node),
                        ) => planned.push(Planned { record, node, op: Op::Stop }),
                        _ => {
                            // Nothing reachable is running it.
                            if !record.state.can_transition_to(InstanceState::Stopped) {
                                fail(&mut record, FailureReason::NodeLost);
                            }
                            transition(&mut record, InstanceState::Stopped)?;
                            self.arena.save(&mut record)?;
                            outcomes.push(InstanceOutcome::ok(&record, Action::Stop));
                        }
                    }
                }
                OperatorVerb::Restart => {
                    record.desired = DesiredState::Running;
                    record.auto_retries = 0;
                    match (record.state, node) {
                        (InstanceState::Running | InstanceState::Starting, Some(node)) => {
                            planned.push(Planned { record, node, op: Op::Restart })
                        }
                        (_, node) => {
                            reset_to_pending(&mut record)?;
                            self.queue_start(record, node, &mut planned, &mut needs_node);
                        }
                    }
                }
            }
        }

        let (starts, unplaced) = self.assign(def, needs_node, &live)?;
        planned.extend(starts);
        for record in &unplaced {
            outcomes.push(InstanceOutcome::failed(
                record,
                Action::Start,
                OutcomeError::NoCapacity("no eligible worker node".to_string()),
            ));
        }

        outcomes.extend(self.execute(guard, def, planned, false, cancel).await?);
        outcomes.sort_by_key(|o| o.ordinal);
        Ok(outcomes)
    }

    // ── Worker reports ─────────────────────────────────────────────

    /// Ingest a worker's status report for one instance.
    ///
    /// Returns `false` when the report was ignored (unknown instance, or the
    /// sender does not own it).
    pub fn observe(
        &self,
        guard: &IdentityGuard,
        node_id: &str,
        report: &InstanceReport,
    ) -> LifecycleResult<bool> {
        let id = DefinitionId::new(&report.tenant, &report.namespace, &report.name);
        debug_assert_eq!(guard.id(), &id);
        let key = InstanceKey::new(&id, report.ordinal);

        let Some(mut record) = self.arena.get(&key)? else {
            debug!(instance = %key, node = node_id, "report for unknown instance ignored");
            return Ok(false);
        };
        if record.node_id.as_deref() != Some(node_id) {
            debug!(instance = %key, node = node_id, owner = ?record.node_id, "report from non-owning node ignored");
            return Ok(false);
        }

        record.last_heartbeat = epoch_secs();
        let status = &report.status;
        if status.running {
            if record.state == InstanceState::Starting {
                transition(&mut record, InstanceState::Running)?;
                record.auto_retries = 0;
                info!(instance = %key, node = node_id, "instance running");
            }
        } else {
            match record.state {
                InstanceState::Running | InstanceState::Starting => {
                    let reason = status
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "instance exited".to_string());
                    warn!(instance = %key, node = node_id, %reason, "worker reported instance failure");
                    fail(&mut record, FailureReason::Reported(reason));
                }
                InstanceState::Stopping => transition(&mut record, InstanceState::Stopped)?,
                _ => {}
            }
        }
        self.arena.save(&mut record)?;
        Ok(true)
    }

    // ── Update and teardown primitives ─────────────────────────────

    /// Stop and delete every instance of a definition.
    pub async fn teardown(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        cancel: &CancellationToken,
    ) -> LifecycleResult<Vec<InstanceOutcome>> {
        let live = self.live_map().await?;
        let records = self.arena.records(&def.id)?;
        let outcomes = self.remove_records(guard, def, records, &live, cancel).await?;
        info!(definition = %def.id, instances = outcomes.len(), "instances torn down");
        Ok(outcomes)
    }

    /// Stop and delete the given ordinals, highest first.
    pub async fn remove_ordinals(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        ordinals: &[u32],
        cancel: &CancellationToken,
    ) -> LifecycleResult<Vec<InstanceOutcome>> {
        let live = self.live_map().await?;
        let mut records = Vec::new();
        for &ordinal in ordinals {
            if let Some(record) = self.arena.get(&InstanceKey::new(&def.id, ordinal))? {
                records.push(record);
            }
        }
        self.remove_records(guard, def, records, &live, cancel).await
    }

    /// Restart the given ordinals onto the current config.
    ///
    /// Ordinals the operator stopped only adopt the new version; they pick
    /// up the config on their next start.
    pub async fn restart_ordinals(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        ordinals: &[u32],
        cancel: &CancellationToken,
    ) -> LifecycleResult<Vec<InstanceOutcome>> {
        let mut running = Vec::new();
        let mut outcomes = Vec::new();
        for &ordinal in ordinals {
            let mut record = self.arena.require(&InstanceKey::new(&def.id, ordinal))?;
            if record.desired == DesiredState::Stopped {
                record.config_version = def.version;
                record.config_digest = def.config_digest();
                self.arena.save(&mut record)?;
                outcomes.push(InstanceOutcome::ok(&record, Action::Noop));
            } else {
                running.push(ordinal);
            }
        }
        outcomes.extend(
            self.operate(def, guard, OperatorVerb::Restart, &running, cancel)
                .await?,
        );
        outcomes.sort_by_key(|o| o.ordinal);
        Ok(outcomes)
    }

    /// Create, place, and start new ordinals. Existing ordinals are skipped.
    pub async fn create_ordinals(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
        ordinals: &[u32],
        cancel: &CancellationToken,
    ) -> LifecycleResult<Vec<InstanceOutcome>> {
        let live = self.live_map().await?;
        let mut fresh = Vec::new();
        for &ordinal in ordinals {
            if self.arena.get(&InstanceKey::new(&def.id, ordinal))?.is_none() {
                fresh.push(InstanceRecord::pending(def, ordinal, None));
            }
        }

        let (planned, unplaced) = self.assign(def, fresh, &live)?;
        let mut outcomes: Vec<InstanceOutcome> = unplaced
            .iter()
            .map(|r| {
                InstanceOutcome::failed(
                    r,
                    Action::Start,
                    OutcomeError::NoCapacity("no eligible worker node".to_string()),
                )
            })
            .collect();
        outcomes.extend(self.execute(guard, def, planned, false, cancel).await?);
        outcomes.sort_by_key(|o| o.ordinal);
        Ok(outcomes)
    }

    /// Record the new version on ordinals whose effective config did not
    /// change, and on ordinals that are not running.
    pub fn adopt_version(
        &self,
        def: &ConnectorDefinition,
        guard: &IdentityGuard,
    ) -> LifecycleResult<usize> {
        debug_assert_eq!(guard.id(), &def.id);
        let digest = def.config_digest();
        let mut adopted = 0;
        for mut record in self.arena.records(&def.id)? {
            if record.config_version == def.version {
                continue;
            }
            if record.config_digest == digest || !record.state.is_active() {
                record.config_version = def.version;
                record.config_digest = digest.clone();
                self.arena.save(&mut record)?;
                adopted += 1;
            }
        }
        if adopted > 0 {
            debug!(definition = %def.id, version = def.version, adopted, "version adopted in place");
        }
        Ok(adopted)
    }

    async fn remove_records(
        &self,
        guard: &IdentityGuard,
        def: &ConnectorDefinition,
        mut records: Vec<InstanceRecord>,
        live: &LiveNodes,
        cancel: &CancellationToken,
    ) -> LifecycleResult<Vec<InstanceOutcome>> {
        records.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        let mut outcomes = Vec::new();
        let mut planned = Vec::new();
        for record in records {
            let node = owning_node(&record, live);
            match node {
                Some(node) if record.state != InstanceState::Stopped => {
                    planned.push(Planned { record, node, op: Op::Remove });
                }
                _ => {
                    self.arena.remove(&record.key())?;
                    debug!(instance = %record.key(), "instance record removed");
                    outcomes.push(InstanceOutcome::ok(&record, Action::Remove));
                }
            }
        }
        outcomes.extend(self.execute(guard, def, planned, true, cancel).await?);
        Ok(outcomes)
    }

    // ── Command execution ──────────────────────────────────────────

    /// Run planned commands on spawned tasks and wait for their outcomes.
    ///
    /// With `ordered` the commands run one after another in plan order.
    async fn execute(
        &self,
        guard: &IdentityGuard,
        def: &ConnectorDefinition,
        planned: Vec<Planned>,
        ordered: bool,
        cancel: &CancellationToken,
    ) -> LifecycleResult<Vec<InstanceOutcome>> {
        if planned.is_empty() {
            return Ok(Vec::new());
        }

        let def = Arc::new(def.clone());
        let mut handles = Vec::new();
        if ordered {
            let this = self.clone();
            let guard = guard.clone();
            let def = def.clone();
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                let mut outcomes = Vec::with_capacity(planned.len());
                for step in planned {
                    outcomes.push(this.run(&def, step).await);
                }
                outcomes
            }));
        } else {
            for step in planned {
                let this = self.clone();
                let guard = guard.clone();
                let def = def.clone();
                handles.push(tokio::spawn(async move {
                    let _guard = guard;
                    vec![this.run(&def, step).await]
                }));
            }
        }

        let collect = async move {
            let mut outcomes = Vec::new();
            for handle in handles {
                match handle.await {
                    Ok(batch) => outcomes.extend(batch),
                    Err(e) => error!(error = %e, "instance command task failed"),
                }
            }
            outcomes
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(definition = %def.id, "caller stopped waiting; commands continue in background");
                Err(LifecycleError::Cancelled)
            }
            outcomes = collect => Ok(outcomes),
        }
    }

    async fn run(&self, def: &ConnectorDefinition, step: Planned) -> InstanceOutcome {
        let Planned { mut record, node, op } = step;
        match self.try_run(def, &mut record, &node, op).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(instance = %record.key(), error = %e, "instance command bookkeeping failed");
                InstanceOutcome::failed(&record, op.action(), OutcomeError::Internal(e.to_string()))
            }
        }
    }

    async fn try_run(
        &self,
        def: &ConnectorDefinition,
        record: &mut InstanceRecord,
        node: &WorkerNode,
        op: Op,
    ) -> LifecycleResult<InstanceOutcome> {
        let key = record.key();
        match op {
            Op::Start => {
                transition(record, InstanceState::Starting)?;
                record.config_version = def.version;
                record.config_digest = def.config_digest();
                self.arena.save(record)?;

                let command = Command::Start(StartPayload::for_definition(def));
                match self.dispatcher.dispatch(node, &key, &command, &self.shutdown).await {
                    Ok(reply) => {
                        self.apply_started(record, &reply)?;
                        self.arena.save(record)?;
                        info!(instance = %key, node = %node.id, version = def.version, "instance started");
                        Ok(InstanceOutcome::ok(record, Action::Start))
                    }
                    Err(e) => self.record_failure(record, Action::Start, &e),
                }
            }
            Op::Restart => {
                transition(record, InstanceState::Stopping)?;
                self.arena.save(record)?;

                let command = Command::Restart(StartPayload::for_definition(def));
                match self.dispatcher.dispatch(node, &key, &command, &self.shutdown).await {
                    Ok(reply) => {
                        transition(record, InstanceState::Pending)?;
                        transition(record, InstanceState::Starting)?;
                        record.config_version = def.version;
                        record.config_digest = def.config_digest();
                        record.restart_count += 1;
                        self.apply_started(record, &reply)?;
                        self.arena.save(record)?;
                        info!(instance = %key, node = %node.id, version = def.version, "instance restarted");
                        Ok(InstanceOutcome::ok(record, Action::Restart))
                    }
                    Err(e) => self.record_failure(record, Action::Restart, &e),
                }
            }
            Op::Stop => {
                transition(record, InstanceState::Stopping)?;
                self.arena.save(record)?;

                match self.dispatcher.dispatch(node, &key, &Command::Stop, &self.shutdown).await {
                    Ok(_) => {
                        transition(record, InstanceState::Stopped)?;
                        self.arena.save(record)?;
                        info!(instance = %key, node = %node.id, "instance stopped");
                        Ok(InstanceOutcome::ok(record, Action::Stop))
                    }
                    Err(e) => self.record_failure(record, Action::Stop, &e),
                }
            }
            Op::Remove => {
                let stopped = self.dispatcher.dispatch(node, &key, &Command::Stop, &self.shutdown).await;
                self.arena.remove(&key)?;
                match stopped {
                    Ok(_) => {
                        info!(instance = %key, node = %node.id, "instance removed");
                        Ok(InstanceOutcome::ok(record, Action::Remove))
                    }
                    Err(e) => {
                        warn!(instance = %key, node = %node.id, error = %e, "instance removed without a confirmed stop");
                        Ok(InstanceOutcome::failed(record, Action::Remove, OutcomeError::from(&e)))
                    }
                }
            }
        }
    }

    fn apply_started(&self, record: &mut InstanceRecord, reply: &CommandReply) -> LifecycleResult<()> {
        record.last_heartbeat = epoch_secs();
        if reply.running {
            transition(record, InstanceState::Running)?;
            record.auto_retries = 0;
        }
        Ok(())
    }

    fn record_failure(
        &self,
        record: &mut InstanceRecord,
        action: Action,
        err: &DispatchError,
    ) -> LifecycleResult<InstanceOutcome> {
        let reason = match err {
            DispatchError::Rejected { reason, .. } => FailureReason::CommandRejected(reason.clone()),
            DispatchError::Unreachable { .. } => FailureReason::Unreachable,
            DispatchError::Cancelled { .. } => {
                debug!(instance = %record.key(), "command abandoned on shutdown");
                return Ok(InstanceOutcome::failed(record, action, OutcomeError::from(err)));
            }
        };
        warn!(instance = %record.key(), node = ?record.node_id, %reason, "instance command failed");
        fail(record, reason);
        self.arena.save(record)?;
        Ok(InstanceOutcome::failed(record, action, OutcomeError::from(err)))
    }
}

fn owning_node(record: &InstanceRecord, live: &LiveNodes) -> Option<WorkerNode> {
    record.node_id.as_ref().and_then(|id| live.get(id)).cloned()
}
