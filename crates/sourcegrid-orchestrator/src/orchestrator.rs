//! The orchestrator facade.
//!
//! Every mutating operation takes the identity lock before it reads the
//! stored definition and keeps it until the last instance command has been
//! recorded. Reads take no lock.
//!
//! Operations are cancelled by dropping their future: instance commands
//! already sent run to completion on their own tasks and still record their
//! outcome. Daemon shutdown cancels outstanding waits through the shutdown
//! token.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sourcegrid_dispatch::{DispatchConfig, Dispatcher, NodeRegistry, WorkerTransport};
use sourcegrid_lifecycle::{
    IdentityGuard, InstanceOutcome, InstanceReport, LifecycleConfig, LifecycleController,
};
use sourcegrid_rollout::{
    ApplyOptions, RollingConfig, RolloutReport, UpdateCoordinator, validate_update,
};
use sourcegrid_state::{
    AggregatedStatus, ConnectorDefinition, ConnectorType, DefinitionId, InstanceKey,
    InstanceStatusEntry, StateStore,
};
use sourcegrid_status::{StatusAggregator, StatusConfig};

use crate::artifacts::ArtifactStore;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::validate::validate_definition;

/// Tuning for every component the orchestrator wires together.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub dispatch: DispatchConfig,
    pub lifecycle: LifecycleConfig,
    pub status: StatusConfig,
    pub rollout: RollingConfig,
}

/// Options for [`Orchestrator::update`].
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Version the update was prepared against. Defaults to the stored one.
    pub expected_version: Option<u64>,
    /// Overrides the configured rolling batch size.
    pub batch_size: Option<u32>,
    /// Restart every instance even if the effective config is unchanged.
    pub force_restart: bool,
    /// New package to run, replacing the definition's archive.
    pub package_ref: Option<String>,
}

/// Result of [`Orchestrator::deregister`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeregisterReport {
    pub id: DefinitionId,
    /// Instance records deleted.
    pub removed: usize,
    /// Instances deleted without a confirmed stop.
    pub unconfirmed: Vec<InstanceOutcome>,
}

/// The control plane's operation surface. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    store: StateStore,
    lifecycle: LifecycleController,
    status: StatusAggregator,
    updates: UpdateCoordinator,
    artifacts: Arc<dyn ArtifactStore>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        transport: Arc<dyn WorkerTransport>,
        registry: Arc<dyn NodeRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(transport, config.dispatch);
        let lifecycle = LifecycleController::new(
            store.clone(),
            dispatcher.clone(),
            registry.clone(),
            config.lifecycle,
        )
        .with_shutdown(shutdown.clone());
        let status = StatusAggregator::new(dispatcher, registry, config.status);
        let updates = UpdateCoordinator::new(lifecycle.clone(), status.clone(), config.rollout);
        Self {
            store,
            lifecycle,
            status,
            updates,
            artifacts,
            shutdown,
        }
    }

    /// Use `shutdown` to abort outstanding waits when the daemon stops.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.lifecycle = self.lifecycle.with_shutdown(shutdown.clone());
        self.updates = UpdateCoordinator::new(
            self.lifecycle.clone(),
            self.status.clone(),
            self.updates.config().clone(),
        );
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    // ── Definitions ────────────────────────────────────────────────

    /// Register a new connector and start its instances.
    ///
    /// The definition is stored before placement runs. Instances that
    /// cannot be placed or started stay PENDING or FAILED and are retried
    /// by the reconcile loop; that does not fail the registration.
    pub async fn register(
        &self,
        id: &DefinitionId,
        mut def: ConnectorDefinition,
        package_ref: Option<&str>,
    ) -> OrchestratorResult<()> {
        check_identity(id, &def).map_err(OrchestratorError::InvalidConfig)?;
        self.resolve_package(&mut def, package_ref).await?;
        validate_definition(&def).map_err(OrchestratorError::InvalidConfig)?;

        let guard = self.lifecycle.lock(id).await;
        let stored = self.store.insert_definition(&def)?;
        info!(definition = %id, parallelism = stored.parallelism, "connector registered");

        self.converge(&stored, &guard).await;
        Ok(())
    }

    /// Apply a new definition to a registered connector.
    pub async fn update(
        &self,
        id: &DefinitionId,
        mut def: ConnectorDefinition,
        options: UpdateOptions,
    ) -> OrchestratorResult<RolloutReport> {
        check_identity(id, &def).map_err(OrchestratorError::InvalidUpdate)?;

        let guard = self.lifecycle.lock(id).await;
        let current = self.store.get_definition(id)?;
        let base = options.expected_version.unwrap_or(current.version);
        if base != current.version {
            return Err(OrchestratorError::VersionConflict {
                expected: base,
                actual: current.version,
            });
        }

        self.resolve_package(&mut def, options.package_ref.as_deref())
            .await
            .map_err(|e| match e {
                OrchestratorError::InvalidConfig(msg) => OrchestratorError::InvalidUpdate(msg),
                other => other,
            })?;
        validate_definition(&def).map_err(OrchestratorError::InvalidUpdate)?;
        validate_update(&current, &def, options.force_restart)?;

        let stored = self.store.update_definition(&def, base)?;
        info!(
            definition = %id,
            from = current.version,
            to = stored.version,
            parallelism = stored.parallelism,
            "connector updated"
        );

        let apply = ApplyOptions {
            batch_size: options.batch_size,
            force_restart: options.force_restart,
        };
        let report = self
            .updates
            .apply(&current, &stored, &guard, apply, &self.cancel_token())
            .await?;
        Ok(report)
    }

    /// Stop and remove every instance, then delete the definition.
    ///
    /// Records are removed even when their stop is not confirmed; those
    /// instances come back in [`DeregisterReport::unconfirmed`] since their
    /// worker may still be running them.
    pub async fn deregister(&self, id: &DefinitionId) -> OrchestratorResult<DeregisterReport> {
        let guard = self.lifecycle.lock(id).await;
        let def = self.store.get_definition(id)?;

        let outcomes = self
            .lifecycle
            .teardown(&def, &guard, &self.cancel_token())
            .await?;
        let removed = outcomes.len();
        let unconfirmed: Vec<InstanceOutcome> = outcomes.into_iter().filter(|o| !o.is_ok()).collect();
        for failed in &unconfirmed {
            warn!(
                definition = %id,
                ordinal = failed.ordinal,
                node = ?failed.node_id,
                error = ?failed.error,
                "stop failed during deregister; record removed anyway"
            );
        }

        self.store.delete_definition(id)?;
        info!(
            definition = %id,
            instances = removed,
            unconfirmed = unconfirmed.len(),
            "connector deregistered"
        );
        Ok(DeregisterReport {
            id: id.clone(),
            removed,
            unconfirmed,
        })
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_info(&self, id: &DefinitionId) -> OrchestratorResult<ConnectorDefinition> {
        Ok(self.store.get_definition(id)?)
    }

    /// Status of one instance, fetched from its worker.
    pub async fn get_instance_status(
        &self,
        id: &DefinitionId,
        ordinal: u32,
    ) -> OrchestratorResult<InstanceStatusEntry> {
        let def = self.store.get_definition(id)?;
        let key = InstanceKey::new(id, ordinal);
        if ordinal >= def.parallelism {
            return Err(OrchestratorError::NotFound(key.to_string()));
        }
        let record = self
            .lifecycle
            .arena()
            .get(&key)?
            .ok_or_else(|| OrchestratorError::NotFound(key.to_string()))?;
        Ok(self
            .status
            .instance_status(&def, &record, &self.cancel_token())
            .await?)
    }

    /// Merged status of every instance of a connector.
    pub async fn get_status(&self, id: &DefinitionId) -> OrchestratorResult<AggregatedStatus> {
        let def = self.store.get_definition(id)?;
        let records = self.lifecycle.arena().records(id)?;
        Ok(self
            .status
            .aggregate(&def, &records, &self.cancel_token())
            .await)
    }

    /// Names of the connectors registered in a tenant/namespace.
    pub fn list(&self, tenant: &str, namespace: &str) -> OrchestratorResult<Vec<String>> {
        self.store
            .list_definitions(tenant, namespace)
            .map(|id| id.map(|id| id.name).map_err(OrchestratorError::from))
            .collect()
    }

    /// Catalog entries that can run as a source.
    pub fn list_connector_types(&self) -> Vec<ConnectorType> {
        self.artifacts
            .connector_types()
            .into_iter()
            .filter(|t| t.source_class.is_some())
            .collect()
    }

    // ── Operator verbs ─────────────────────────────────────────────

    pub async fn start_instance(&self, id: &DefinitionId, ordinal: u32) -> OrchestratorResult<()> {
        self.instance_verb(id, ordinal, Verb::Start).await
    }

    pub async fn stop_instance(&self, id: &DefinitionId, ordinal: u32) -> OrchestratorResult<()> {
        self.instance_verb(id, ordinal, Verb::Stop).await
    }

    pub async fn restart_instance(&self, id: &DefinitionId, ordinal: u32) -> OrchestratorResult<()> {
        self.instance_verb(id, ordinal, Verb::Restart).await
    }

    /// Start every instance; failures are collected, not fatal.
    pub async fn start_all(&self, id: &DefinitionId) -> OrchestratorResult<()> {
        self.all_verb(id, Verb::Start).await
    }

    pub async fn stop_all(&self, id: &DefinitionId) -> OrchestratorResult<()> {
        self.all_verb(id, Verb::Stop).await
    }

    pub async fn restart_all(&self, id: &DefinitionId) -> OrchestratorResult<()> {
        self.all_verb(id, Verb::Restart).await
    }

    // ── Worker reports ─────────────────────────────────────────────

    /// Ingest status reports sent by a worker. Returns how many were applied.
    pub async fn observe(&self, node_id: &str, reports: &[InstanceReport]) -> OrchestratorResult<usize> {
        let mut applied = 0;
        for report in reports {
            let id = DefinitionId::new(&report.tenant, &report.namespace, &report.name);
            let guard = self.lifecycle.lock(&id).await;
            if self.lifecycle.observe(&guard, node_id, report)? {
                applied += 1;
            }
        }
        debug!(node = node_id, received = reports.len(), applied, "worker reports ingested");
        Ok(applied)
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Reconcile once, logging instead of failing.
    pub(crate) async fn converge(&self, def: &ConnectorDefinition, guard: &IdentityGuard) {
        match self.lifecycle.reconcile(def, guard, &self.cancel_token()).await {
            Ok(report) => {
                if !report.unplaced.is_empty() {
                    warn!(
                        definition = %def.id,
                        unplaced = ?report.unplaced,
                        "instances left pending: no worker capacity"
                    );
                }
                for failed in report.failures() {
                    warn!(
                        definition = %def.id,
                        ordinal = failed.ordinal,
                        error = ?failed.error,
                        "instance action failed; will retry"
                    );
                }
            }
            Err(e) => warn!(definition = %def.id, error = %e, "reconciliation failed; will retry"),
        }
    }

    async fn resolve_package(
        &self,
        def: &mut ConnectorDefinition,
        package_ref: Option<&str>,
    ) -> OrchestratorResult<()> {
        let reference = match package_ref {
            Some(pkg) => pkg.to_string(),
            None => match &def.implementation.archive {
                Some(archive) => archive.clone(),
                None => return Ok(()),
            },
        };

        let resolved = self.artifacts.resolve(&reference).await?;
        if package_ref.is_some() {
            def.implementation.archive = Some(resolved.archive);
        }
        if def.implementation.class_name.is_none() {
            if resolved.source_class.is_none() && reference.starts_with("builtin://") {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "{reference} does not provide a source"
                )));
            }
            def.implementation.class_name = resolved.source_class;
        }
        Ok(())
    }

    async fn instance_verb(&self, id: &DefinitionId, ordinal: u32, verb: Verb) -> OrchestratorResult<()> {
        let guard = self.lifecycle.lock(id).await;
        let def = self.store.get_definition(id)?;
        if ordinal >= def.parallelism {
            return Err(OrchestratorError::NotFound(InstanceKey::new(id, ordinal).to_string()));
        }

        let cancel = self.cancel_token();
        let outcome = match verb {
            Verb::Start => self.lifecycle.start_instance(&def, &guard, ordinal, &cancel).await?,
            Verb::Stop => self.lifecycle.stop_instance(&def, &guard, ordinal, &cancel).await?,
            Verb::Restart => self.lifecycle.restart_instance(&def, &guard, ordinal, &cancel).await?,
        };
        info!(definition = %id, ordinal, ?verb, ok = outcome.is_ok(), "instance command");
        match outcome.error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn all_verb(&self, id: &DefinitionId, verb: Verb) -> OrchestratorResult<()> {
        let guard = self.lifecycle.lock(id).await;
        let def = self.store.get_definition(id)?;

        let cancel = self.cancel_token();
        let outcomes: Vec<InstanceOutcome> = match verb {
            Verb::Start => self.lifecycle.start_all(&def, &guard, &cancel).await?,
            Verb::Stop => self.lifecycle.stop_all(&def, &guard, &cancel).await?,
            Verb::Restart => self.lifecycle.restart_all(&def, &guard, &cancel).await?,
        };
        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        info!(definition = %id, ?verb, instances = outcomes.len(), failed, "bulk instance command");
        if failed > 0 {
            return Err(OrchestratorError::PartialFailure(outcomes));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Start,
    Stop,
    Restart,
}

fn check_identity(id: &DefinitionId, def: &ConnectorDefinition) -> Result<(), String> {
    id.validate()?;
    if &def.id != id {
        return Err(format!(
            "definition identity {} does not match {id}",
            def.id
        ));
    }
    Ok(())
}
