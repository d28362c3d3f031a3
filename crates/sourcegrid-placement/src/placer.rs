//! Placement engine: assigns instance ordinals to worker nodes.
//!
//! Greedy least-loaded-first: every ordinal goes to the eligible node with
//! the fewest instances (lowest id on ties), and the node's load and free
//! capacity are updated before the next pick. The per-node counts are then
//! handed out as contiguous ordinal ranges in node-id order, so three
//! ordinals over two equal nodes `a`, `b` yield `a: {0, 1}`, `b: {2}`.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, warn};

use sourcegrid_state::NodeId;

use crate::scorer::{NodeLoad, PlacementRequirements, compare_load, is_eligible};

/// Placement failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no capacity: {required} instance(s) required, {eligible} eligible node(s)")]
    NoCapacity { required: u32, eligible: u32 },
}

pub type PlacementResult<T> = Result<T, PlacementError>;

/// Tunables for the placement engine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PlacementPolicy {
    /// Allow several ordinals of one definition on the same node when there
    /// are fewer eligible nodes than ordinals.
    pub allow_colocation: bool,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            allow_colocation: true,
        }
    }
}

/// A placement decision for a set of ordinals.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementPlan {
    /// Ordinal → node.
    pub assignments: BTreeMap<u32, NodeId>,
    /// True when some node hosts more than one ordinal of the definition.
    pub degraded: bool,
}

/// Compute an assignment for `ordinals` across `nodes`.
pub fn compute_placement(
    definition: &str,
    ordinals: &[u32],
    req: &PlacementRequirements,
    nodes: &[NodeLoad],
    policy: &PlacementPolicy,
) -> PlacementResult<PlacementPlan> {
    let required = ordinals.len() as u32;
    if required == 0 {
        return Ok(PlacementPlan {
            assignments: BTreeMap::new(),
            degraded: false,
        });
    }

    let mut candidates: Vec<NodeLoad> = nodes
        .iter()
        .filter(|n| is_eligible(n, req))
        .filter(|n| policy.allow_colocation || n.definition_instances == 0)
        .cloned()
        .collect();
    let eligible = candidates.len() as u32;

    if eligible == 0 || (eligible < required && !policy.allow_colocation) {
        warn!(definition, required, eligible, "placement failed: not enough eligible nodes");
        return Err(PlacementError::NoCapacity { required, eligible });
    }

    let mut counts: BTreeMap<NodeId, u32> = BTreeMap::new();
    for _ in 0..required {
        let best = candidates
            .iter_mut()
            .filter(|n| is_eligible(n, req))
            .filter(|n| policy.allow_colocation || n.definition_instances == 0)
            .min_by(|a, b| compare_load(a, b));

        let Some(node) = best else {
            warn!(definition, required, eligible, "placement failed: capacity exhausted");
            return Err(PlacementError::NoCapacity { required, eligible });
        };

        node.instance_count += 1;
        node.definition_instances += 1;
        node.free = node.free.saturating_sub(&req.resources);
        *counts.entry(node.node_id.clone()).or_insert(0) += 1;
    }

    let mut sorted = ordinals.to_vec();
    sorted.sort_unstable();
    let mut remaining = sorted.into_iter();
    let mut assignments = BTreeMap::new();
    for (node_id, count) in &counts {
        for ordinal in remaining.by_ref().take(*count as usize) {
            assignments.insert(ordinal, node_id.clone());
        }
        debug!(definition, node = %node_id, instances = count, "placed instances");
    }

    let degraded = candidates.iter().any(|n| n.definition_instances > 1);
    if degraded {
        warn!(
            definition,
            required,
            eligible,
            "degraded placement: multiple instances co-located on one node"
        );
    }

    Ok(PlacementPlan {
        assignments,
        degraded,
    })
}
