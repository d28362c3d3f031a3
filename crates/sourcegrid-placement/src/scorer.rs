//! Node eligibility and ranking for placement decisions.
//!
//! A node is a candidate for an instance when it is not draining and its
//! free capacity covers the instance's declared cpu/ram/disk. Candidates
//! are ranked least-loaded first (fewest instances), ties broken by the
//! lowest node id so that placement is deterministic.

use std::cmp::Ordering;

use sourcegrid_state::{NodeId, ResourceLimits};

/// Load and free capacity of a single node.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeLoad {
    pub node_id: NodeId,
    /// Instances of any definition currently assigned to the node.
    pub instance_count: u32,
    /// Instances of the definition being placed already on the node.
    pub definition_instances: u32,
    pub free: ResourceLimits,
    pub is_draining: bool,
}

/// Requirements for a placement.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlacementRequirements {
    /// Resources needed per instance.
    pub resources: ResourceLimits,
}

/// Whether a node can accept one more instance.
pub fn is_eligible(node: &NodeLoad, req: &PlacementRequirements) -> bool {
    !node.is_draining && node.free.fits(&req.resources)
}

/// Least-loaded first, then lowest node id.
pub fn compare_load(a: &NodeLoad, b: &NodeLoad) -> Ordering {
    a.instance_count
        .cmp(&b.instance_count)
        .then_with(|| a.node_id.cmp(&b.node_id))
}
