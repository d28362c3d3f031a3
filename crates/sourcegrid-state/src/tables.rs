//! redb table definitions for the SourceGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys are ordered so that a range scan from a prefix visits every
//! child of a parent in order.

use redb::TableDefinition;

/// Connector definitions keyed by `{tenant}/{namespace}/{name}`.
pub const DEFINITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("definitions");

/// Instance records keyed by `{tenant}/{namespace}/{name}#{ordinal:010}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Worker nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
