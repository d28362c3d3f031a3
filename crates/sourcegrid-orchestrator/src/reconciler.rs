//! Background reconciliation.
//!
//! Each tick reconciles every stored definition. Definitions whose identity
//! lock is held (an update or operator command in progress) are skipped and
//! picked up on a later tick. Errors are logged and retried next tick.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::orchestrator::Orchestrator;

/// What one reconcile tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reconciled: usize,
    /// Definitions skipped because another operation held their lock.
    pub busy: usize,
    pub errors: usize,
}

impl Orchestrator {
    /// Reconcile every definition once.
    pub async fn reconcile_all(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        for id in self.store().list_all_definitions() {
            let id = match id {
                Ok(id) => id,
                Err(e) => {
                    error!(error = %e, "failed to list definitions");
                    summary.errors += 1;
                    break;
                }
            };

            let Some(guard) = self.lifecycle().try_lock(&id) else {
                debug!(definition = %id, "definition busy; skipping this tick");
                summary.busy += 1;
                continue;
            };
            // Re-read under the lock: the definition may have changed or gone.
            let def = match self.store().get_definition(&id) {
                Ok(def) => def,
                Err(sourcegrid_state::StateError::NotFound(_)) => continue,
                Err(e) => {
                    error!(definition = %id, error = %e, "failed to load definition");
                    summary.errors += 1;
                    continue;
                }
            };

            match self
                .lifecycle()
                .reconcile(&def, &guard, &self.cancel_token())
                .await
            {
                Ok(report) => {
                    if !report.is_quiet() {
                        info!(
                            definition = %id,
                            commands = report.outcomes.len(),
                            failures = report.failures().count(),
                            unplaced = report.unplaced.len(),
                            "reconciled"
                        );
                    }
                    summary.reconciled += 1;
                }
                Err(e) => {
                    error!(definition = %id, error = %e, "reconciliation failed");
                    summary.errors += 1;
                }
            }
        }
        summary
    }

    /// Reconcile every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_ms = interval.as_millis() as u64, "reconcile loop starting");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.reconcile_all().await;
                    debug!(?summary, "reconcile tick");
                }
                _ = shutdown.cancelled() => {
                    info!("reconcile loop shutting down");
                    break;
                }
            }
        }
    }
}
