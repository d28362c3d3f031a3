//! Type conversions between state store types and placement types.
//!
//! Bridges `sourcegrid_state::{WorkerNode, InstanceRecord, ConnectorDefinition}`
//! to the placement engine's `NodeLoad` and `PlacementRequirements`.

use std::collections::HashMap;

use sourcegrid_state::{ConnectorDefinition, DefinitionId, InstanceRecord, WorkerNode};

use crate::scorer::{NodeLoad, PlacementRequirements};

/// Build node loads from the live node set and all assigned records.
///
/// `records` should cover every definition so that `instance_count`
/// reflects the node's total load; `definition` selects which records
/// count towards `definition_instances`.
pub fn node_loads(
    nodes: &[WorkerNode],
    records: &[InstanceRecord],
    definition: &DefinitionId,
) -> Vec<NodeLoad> {
    let mut total: HashMap<&str, u32> = HashMap::new();
    let mut own: HashMap<&str, u32> = HashMap::new();
    for record in records {
        let Some(node_id) = record.node_id.as_deref() else {
            continue;
        };
        *total.entry(node_id).or_insert(0) += 1;
        if &record.definition == definition {
            *own.entry(node_id).or_insert(0) += 1;
        }
    }

    nodes
        .iter()
        .map(|node| NodeLoad {
            node_id: node.id.clone(),
            instance_count: total.get(node.id.as_str()).copied().unwrap_or(0),
            definition_instances: own.get(node.id.as_str()).copied().unwrap_or(0),
            free: node.free(),
            is_draining: node.draining,
        })
        .collect()
}

/// Convert a [`ConnectorDefinition`] to [`PlacementRequirements`].
pub fn definition_to_requirements(def: &ConnectorDefinition) -> PlacementRequirements {
    PlacementRequirements {
        resources: def.resources,
    }
}
