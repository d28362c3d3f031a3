//! Update validation and the instance diff.

use serde::Serialize;

use sourcegrid_state::{ConnectorDefinition, InstanceRecord};

use crate::error::{RolloutError, RolloutResult};

/// Reject updates that cannot be applied to `current`.
///
/// An update that changes neither the effective config nor the
/// parallelism is rejected unless `force_restart` is set.
pub fn validate_update(
    current: &ConnectorDefinition,
    proposed: &ConnectorDefinition,
    force_restart: bool,
) -> RolloutResult<()> {
    let invalid = |msg: String| Err(RolloutError::InvalidUpdate(msg));

    if proposed.id != current.id {
        return invalid(format!(
            "identity cannot change: {} -> {}",
            current.id, proposed.id
        ));
    }
    if proposed.parallelism < 1 {
        return invalid("parallelism must be at least 1".to_string());
    }
    if !proposed.resources.is_valid_request() {
        return invalid("resources must be non-negative and not all zero".to_string());
    }
    if proposed.implementation.class_name.is_none() && proposed.implementation.archive.is_none() {
        return invalid("implementation class or archive is required".to_string());
    }
    if proposed.topic.trim().is_empty() {
        return invalid("destination topic is required".to_string());
    }
    if proposed.processing_guarantees != current.processing_guarantees {
        return invalid("processing guarantees cannot be altered".to_string());
    }
    if !force_restart
        && proposed.parallelism == current.parallelism
        && proposed.config_digest() == current.config_digest()
    {
        return invalid("update contains no changes".to_string());
    }
    Ok(())
}

/// How each ordinal is affected by an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdatePlan {
    /// Ordinals that keep running; their version is adopted in place.
    pub unchanged: Vec<u32>,
    /// Ordinals to restart onto the new config, ascending.
    pub restart: Vec<u32>,
    /// Ordinals beyond the new parallelism, highest first.
    pub remove: Vec<u32>,
    /// New ordinals to create, ascending.
    pub create: Vec<u32>,
}

impl UpdatePlan {
    /// Diff the current records against the new definition.
    pub fn compute(
        records: &[InstanceRecord],
        new: &ConnectorDefinition,
        force_restart: bool,
    ) -> Self {
        let digest = new.config_digest();
        let mut plan = UpdatePlan::default();

        for record in records {
            if record.ordinal >= new.parallelism {
                plan.remove.push(record.ordinal);
            } else if force_restart || record.config_digest != digest {
                plan.restart.push(record.ordinal);
            } else {
                plan.unchanged.push(record.ordinal);
            }
        }

        let present: std::collections::BTreeSet<u32> = records.iter().map(|r| r.ordinal).collect();
        plan.create = (0..new.parallelism).filter(|o| !present.contains(o)).collect();

        plan.unchanged.sort_unstable();
        plan.restart.sort_unstable();
        plan.remove.sort_unstable_by(|a, b| b.cmp(a));
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.restart.is_empty() && self.remove.is_empty() && self.create.is_empty()
    }
}
