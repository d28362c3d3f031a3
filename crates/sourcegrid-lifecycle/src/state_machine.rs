//! Checked transitions on instance records.

use tracing::debug;

use sourcegrid_state::{FailureReason, InstanceRecord, InstanceState};

use crate::error::{LifecycleError, LifecycleResult};

/// Move `record` to `to`, rejecting moves the state machine forbids.
///
/// Moving to the current state is a no-op.
pub fn transition(record: &mut InstanceRecord, to: InstanceState) -> LifecycleResult<()> {
    if record.state == to {
        return Ok(());
    }
    if !record.state.can_transition_to(to) {
        return Err(LifecycleError::IllegalTransition {
            key: record.key(),
            from: record.state,
            to,
        });
    }
    debug!(instance = %record.key(), from = ?record.state, ?to, "instance transition");
    record.state = to;
    if to != InstanceState::Failed {
        record.failure = None;
    }
    Ok(())
}

/// Mark `record` failed with `reason`. Already-failed records keep their first reason.
pub fn fail(record: &mut InstanceRecord, reason: FailureReason) {
    if record.state != InstanceState::Failed {
        debug!(instance = %record.key(), from = ?record.state, %reason, "instance failed");
        record.state = InstanceState::Failed;
        record.failure = Some(reason);
    }
}

/// Walk `record` back to `PENDING` through whichever intermediate state the
/// machine requires.
pub fn reset_to_pending(record: &mut InstanceRecord) -> LifecycleResult<()> {
    match record.state {
        InstanceState::Pending => Ok(()),
        InstanceState::Starting | InstanceState::Running => {
            transition(record, InstanceState::Stopping)?;
            transition(record, InstanceState::Pending)
        }
        _ => transition(record, InstanceState::Pending),
    }
}
