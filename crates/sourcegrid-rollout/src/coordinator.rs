//! Update coordinator: applies a validated update to running instances.
//!
//! Order of work: version adoption for unaffected ordinals, removal of
//! ordinals beyond the new parallelism (highest first), batched restarts
//! gated on the batch reporting RUNNING on the new version, then creation
//! of new ordinals. The caller holds the identity lock throughout, and the
//! new definition is already persisted.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sourcegrid_lifecycle::{Action, IdentityGuard, InstanceOutcome, LifecycleController, LifecycleError};
use sourcegrid_state::{ConnectorDefinition, DefinitionId, ReportedState};
use sourcegrid_status::StatusAggregator;

use crate::controller::{BatchHealth, Rollout, RolloutPhase};
use crate::error::RolloutResult;
use crate::plan::UpdatePlan;
use crate::strategy::RollingConfig;

/// Per-update knobs supplied by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Overrides the configured batch size.
    pub batch_size: Option<u32>,
    /// Restart every kept ordinal even if its config is unchanged.
    pub force_restart: bool,
}

/// What an update did.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub definition: DefinitionId,
    pub from_version: u64,
    pub to_version: u64,
    pub phase: RolloutPhase,
    pub batch_size: u32,
    pub plan: UpdatePlan,
    /// Records that took the new version without a restart.
    pub adopted: usize,
    pub removed: Vec<InstanceOutcome>,
    pub restarted: Vec<InstanceOutcome>,
    pub created: Vec<InstanceOutcome>,
}

impl RolloutReport {
    pub fn failures(&self) -> impl Iterator<Item = &InstanceOutcome> {
        self.removed
            .iter()
            .chain(&self.restarted)
            .chain(&self.created)
            .filter(|o| !o.is_ok())
    }

    pub fn completed(&self) -> bool {
        self.phase == RolloutPhase::Completed
    }
}

#[derive(Clone)]
pub struct UpdateCoordinator {
    controller: LifecycleController,
    status: StatusAggregator,
    config: RollingConfig,
}

impl UpdateCoordinator {
    pub fn new(controller: LifecycleController, status: StatusAggregator, config: RollingConfig) -> Self {
        Self {
            controller,
            status,
            config,
        }
    }

    pub fn config(&self) -> &RollingConfig {
        &self.config
    }

    /// Roll the instances of `new.id` from `old` to `new`.
    pub async fn apply(
        &self,
        old: &ConnectorDefinition,
        new: &ConnectorDefinition,
        guard: &IdentityGuard,
        options: ApplyOptions,
        cancel: &CancellationToken,
    ) -> RolloutResult<RolloutReport> {
        let records = self.controller.arena().records(&new.id)?;
        let plan = UpdatePlan::compute(&records, new, options.force_restart);
        debug!(definition = %new.id, ?plan, "update plan");

        let adopted = self.controller.adopt_version(new, guard)?;
        let removed = self
            .controller
            .remove_ordinals(new, guard, &plan.remove, cancel)
            .await?;

        let batch_size = self
            .config
            .effective_batch_size(new.parallelism, options.batch_size);
        let mut rollout = Rollout::new(&new.id.to_string(), plan.restart.clone(), batch_size);
        rollout.start();

        let mut restarted = Vec::new();
        while let Some(batch) = rollout.current_batch().map(<[u32]>::to_vec) {
            let outcomes = self
                .controller
                .restart_ordinals(new, guard, &batch, cancel)
                .await?;
            let failed: Vec<u32> = outcomes
                .iter()
                .filter(|o| !o.is_ok())
                .map(|o| o.ordinal)
                .collect();
            let expected: Vec<u32> = outcomes
                .iter()
                .filter(|o| o.is_ok() && o.action != Action::Noop)
                .map(|o| o.ordinal)
                .collect();
            restarted.extend(outcomes);

            let health = if failed.is_empty() {
                self.await_batch(new, &expected, cancel).await?
            } else {
                BatchHealth {
                    ready: 0,
                    expected: batch.len() as u32,
                    failed,
                }
            };
            rollout.advance(&health);
        }

        let created = if rollout.phase == RolloutPhase::Completed {
            self.controller
                .create_ordinals(new, guard, &plan.create, cancel)
                .await?
        } else {
            warn!(
                definition = %new.id,
                skipped = plan.create.len(),
                "rollout halted; new ordinals left to reconciliation"
            );
            Vec::new()
        };

        let report = RolloutReport {
            definition: new.id.clone(),
            from_version: old.version,
            to_version: new.version,
            phase: rollout.phase,
            batch_size,
            plan,
            adopted,
            removed,
            restarted,
            created,
        };
        info!(
            definition = %new.id,
            from = report.from_version,
            to = report.to_version,
            phase = ?report.phase,
            failures = report.failures().count(),
            "update applied"
        );
        Ok(report)
    }

    /// Poll worker status until every ordinal in `expected` runs the new
    /// version, or the health timeout passes.
    async fn await_batch(
        &self,
        def: &ConnectorDefinition,
        expected: &[u32],
        cancel: &CancellationToken,
    ) -> RolloutResult<BatchHealth> {
        let deadline = tokio::time::Instant::now() + self.config.health_timeout;
        let mut health = BatchHealth {
            ready: 0,
            expected: expected.len() as u32,
            failed: Vec::new(),
        };
        if expected.is_empty() {
            return Ok(health);
        }

        loop {
            let records: Vec<_> = self
                .controller
                .arena()
                .records(&def.id)?
                .into_iter()
                .filter(|r| expected.contains(&r.ordinal))
                .collect();
            let status = self.status.aggregate(def, &records, cancel).await;
            health.ready = status
                .instances
                .iter()
                .filter(|e| expected.contains(&e.ordinal))
                .filter(|e| e.state == ReportedState::Running && e.config_version == def.version)
                .count() as u32;

            if health.ready >= health.expected {
                return Ok(health);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(health);
            }
            debug!(
                definition = %def.id,
                ready = health.ready,
                expected = health.expected,
                "waiting for batch to become ready"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LifecycleError::Cancelled.into()),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}
