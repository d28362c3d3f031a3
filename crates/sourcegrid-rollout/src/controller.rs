//! Rollout controller: drives the rolling update state machine.
//!
//! The controller hands out restart batches one at a time and checks a
//! health gate after each. A failed gate halts the rollout.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Current phase of a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Rollout not started.
    Pending,
    /// Restarting batch N of M.
    RollingBatch { current: u32, total: u32 },
    /// Completed successfully.
    Completed,
    /// Stopped after a batch failed its health gate.
    Halted { reason: String },
}

/// Observed health of the batch just restarted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchHealth {
    /// Instances running on the new version.
    pub ready: u32,
    /// Instances expected to be running.
    pub expected: u32,
    /// Ordinals whose restart command failed outright.
    pub failed: Vec<u32>,
}

/// A rolling restart over a fixed set of ordinals.
#[derive(Debug, Clone)]
pub struct Rollout {
    pub definition: String,
    pub phase: RolloutPhase,
    ordinals: Vec<u32>,
    batch_size: u32,
}

impl Rollout {
    pub fn new(definition: &str, ordinals: Vec<u32>, batch_size: u32) -> Self {
        Self {
            definition: definition.to_string(),
            phase: RolloutPhase::Pending,
            ordinals,
            batch_size: batch_size.max(1),
        }
    }

    /// Start the rollout. With nothing to restart it completes at once.
    pub fn start(&mut self) {
        let total = batch_count(self.ordinals.len() as u32, self.batch_size);
        if total == 0 {
            self.phase = RolloutPhase::Completed;
            debug!(definition = %self.definition, "nothing to restart");
            return;
        }
        self.phase = RolloutPhase::RollingBatch { current: 1, total };
        info!(
            definition = %self.definition,
            batches = total,
            batch_size = self.batch_size,
            "started rolling update"
        );
    }

    /// Ordinals of the batch to restart now, if the rollout is rolling.
    pub fn current_batch(&self) -> Option<&[u32]> {
        match self.phase {
            RolloutPhase::RollingBatch { current, .. } => {
                let size = self.batch_size as usize;
                let start = (current as usize - 1) * size;
                let end = (start + size).min(self.ordinals.len());
                Some(&self.ordinals[start..end])
            }
            _ => None,
        }
    }

    /// Record the health of the current batch and move on.
    pub fn advance(&mut self, health: &BatchHealth) {
        let RolloutPhase::RollingBatch { current, total } = self.phase else {
            return;
        };

        if !check_health_gate(health) {
            let reason = if health.failed.is_empty() {
                format!(
                    "health gate failed at batch {current}/{total}: {}/{} instances ready",
                    health.ready, health.expected
                )
            } else {
                format!(
                    "health gate failed at batch {current}/{total}: restart failed for ordinals {:?}",
                    health.failed
                )
            };
            warn!(definition = %self.definition, batch = current, %reason, "halting rollout");
            self.phase = RolloutPhase::Halted { reason };
            return;
        }

        if current >= total {
            self.phase = RolloutPhase::Completed;
            info!(definition = %self.definition, "rolling update completed");
        } else {
            self.phase = RolloutPhase::RollingBatch {
                current: current + 1,
                total,
            };
            debug!(
                definition = %self.definition,
                batch = current + 1,
                total,
                "advancing to next batch"
            );
        }
    }
}

/// Every expected instance ready and no restart failed.
fn check_health_gate(health: &BatchHealth) -> bool {
    health.failed.is_empty() && health.ready >= health.expected
}

/// Calculate number of batches for a rolling update.
fn batch_count(total_instances: u32, batch_size: u32) -> u32 {
    if batch_size == 0 {
        return 1;
    }
    total_instances.div_ceil(batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(n: u32) -> BatchHealth {
        BatchHealth {
            ready: n,
            expected: n,
            failed: Vec::new(),
        }
    }

    #[test]
    fn batches_cover_all_ordinals_in_order() {
        let mut rollout = Rollout::new("t1/ns1/src1", vec![0, 1, 2, 3, 4], 2);
        rollout.start();
        assert_eq!(rollout.phase, RolloutPhase::RollingBatch { current: 1, total: 3 });

        let mut seen = Vec::new();
        while let Some(batch) = rollout.current_batch() {
            seen.push(batch.to_vec());
            let n = batch.len() as u32;
            rollout.advance(&ready(n));
        }
        assert_eq!(seen, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(rollout.phase, RolloutPhase::Completed);
    }

    #[test]
    fn empty_rollout_completes_immediately() {
        let mut rollout = Rollout::new("t1/ns1/src1", Vec::new(), 3);
        rollout.start();
        assert_eq!(rollout.phase, RolloutPhase::Completed);
        assert!(rollout.current_batch().is_none());
    }

    #[test]
    fn unready_batch_halts() {
        let mut rollout = Rollout::new("t1/ns1/src1", vec![0, 1, 2], 1);
        rollout.start();
        rollout.advance(&ready(1));
        rollout.advance(&BatchHealth {
            ready: 0,
            expected: 1,
            failed: Vec::new(),
        });
        assert!(matches!(rollout.phase, RolloutPhase::Halted { .. }));
        assert!(rollout.current_batch().is_none());
    }

    #[test]
    fn failed_restart_halts_with_ordinals_in_reason() {
        let mut rollout = Rollout::new("t1/ns1/src1", vec![0, 1], 2);
        rollout.start();
        rollout.advance(&BatchHealth {
            ready: 1,
            expected: 2,
            failed: vec![1],
        });
        match &rollout.phase {
            RolloutPhase::Halted { reason } => assert!(reason.contains("[1]")),
            other => panic!("expected halt, got {other:?}"),
        }
    }

    #[test]
    fn advance_after_finish_is_noop() {
        let mut rollout = Rollout::new("t1/ns1/src1", vec![0], 1);
        rollout.start();
        rollout.advance(&ready(1));
        rollout.advance(&BatchHealth::default());
        assert_eq!(rollout.phase, RolloutPhase::Completed);
    }

    #[test]
    fn zero_batch_size_treated_as_one() {
        let mut rollout = Rollout::new("t1/ns1/src1", vec![0, 1], 0);
        rollout.start();
        assert_eq!(rollout.current_batch(), Some(&[0u32][..]));
    }

    #[test]
    fn batch_count_calculation() {
        assert_eq!(batch_count(10, 3), 4);
        assert_eq!(batch_count(10, 10), 1);
        assert_eq!(batch_count(0, 3), 0);
        assert_eq!(batch_count(5, 0), 1);
    }
}
