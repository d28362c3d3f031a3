//! Domain types for the SourceGrid state store.
//!
//! These types represent the persisted state of connector definitions,
//! instance records, and worker nodes, plus the status report shapes that
//! flow back from workers. All types are serializable to/from JSON for
//! storage in redb tables.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unique identifier for a worker node in the cluster.
pub type NodeId = String;

// ── Identity ──────────────────────────────────────────────────────

/// Identity of a connector definition: `(tenant, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionId {
    pub tenant: String,
    pub namespace: String,
    pub name: String,
}

impl DefinitionId {
    pub fn new(tenant: &str, namespace: &str, name: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Build the composite key for the definitions table.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.tenant, self.namespace, self.name)
    }

    /// Key prefix shared by every definition in a tenant/namespace.
    pub fn namespace_prefix(tenant: &str, namespace: &str) -> String {
        format!("{tenant}/{namespace}/")
    }

    /// Parse a definitions-table key back into an identity.
    pub fn from_table_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(3, '/');
        let tenant = parts.next()?;
        let namespace = parts.next()?;
        let name = parts.next()?;
        Some(Self::new(tenant, namespace, name))
    }

    /// Reject empty parts and parts that are not safe as a bare URI path
    /// segment. Identity parts travel unescaped in worker command paths.
    pub fn validate(&self) -> Result<(), String> {
        for (label, part) in [
            ("tenant", &self.tenant),
            ("namespace", &self.namespace),
            ("name", &self.name),
        ] {
            if part.is_empty() {
                return Err(format!("{label} must not be empty"));
            }
            if let Some(c) = part.chars().find(|c| !is_identity_char(*c)) {
                return Err(format!("{label} '{part}' contains a reserved character {c:?}"));
            }
        }
        Ok(())
    }
}

/// Letters, digits and `-_.=:~`.
fn is_identity_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '=' | ':' | '~')
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.namespace, self.name)
    }
}

/// Identity of one instance: a definition plus an ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub definition: DefinitionId,
    pub ordinal: u32,
}

impl InstanceKey {
    pub fn new(definition: &DefinitionId, ordinal: u32) -> Self {
        Self {
            definition: definition.clone(),
            ordinal,
        }
    }

    /// Build the composite key for the instances table.
    ///
    /// The ordinal is zero-padded so a prefix scan yields ordinals in order.
    pub fn table_key(&self) -> String {
        format!("{}#{:010}", self.definition.table_key(), self.ordinal)
    }

    /// Key prefix shared by every instance of a definition.
    pub fn definition_prefix(definition: &DefinitionId) -> String {
        format!("{}#", definition.table_key())
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.definition, self.ordinal)
    }
}

// ── Definition ────────────────────────────────────────────────────

/// Declarative description of a source connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorDefinition {
    pub id: DefinitionId,
    /// What code to run.
    pub implementation: Implementation,
    /// Topic the source publishes to.
    pub topic: String,
    #[serde(default)]
    pub serde_class_name: Option<String>,
    #[serde(default)]
    pub schema_type: Option<String>,
    /// Free-form connector configuration.
    #[serde(default)]
    pub configs: BTreeMap<String, serde_json::Value>,
    /// Secret name → opaque provider descriptor.
    #[serde(default)]
    pub secrets: BTreeMap<String, serde_json::Value>,
    /// Number of instances to run.
    pub parallelism: u32,
    /// Resources requested per instance.
    pub resources: ResourceLimits,
    #[serde(default)]
    pub processing_guarantees: DeliveryGuarantee,
    #[serde(default)]
    pub runtime_flags: Option<String>,
    /// Bumped by exactly one on every successful update.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

/// Class name and/or package archive implementing a connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Implementation {
    #[serde(default)]
    pub class_name: Option<String>,
    /// Package reference (`builtin://`, `file://`, `https://`, ...).
    #[serde(default)]
    pub archive: Option<String>,
}

/// Resources per instance, or capacity/usage of a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceLimits {
    /// CPU cores (fractional).
    pub cpu: f64,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
}

impl ResourceLimits {
    pub fn new(cpu: f64, ram_bytes: u64, disk_bytes: u64) -> Self {
        Self {
            cpu,
            ram_bytes,
            disk_bytes,
        }
    }

    /// Per-instance request used when a definition does not set one.
    pub fn instance_default() -> Self {
        Self::new(1.0, 1 << 30, 10 << 30)
    }

    /// Usable as a per-instance request: finite, non-negative, and not all zero.
    pub fn is_valid_request(&self) -> bool {
        self.cpu.is_finite()
            && self.cpu >= 0.0
            && (self.cpu > 0.0 || self.ram_bytes > 0 || self.disk_bytes > 0)
    }

    pub fn saturating_add(&self, other: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu: self.cpu + other.cpu,
            ram_bytes: self.ram_bytes.saturating_add(other.ram_bytes),
            disk_bytes: self.disk_bytes.saturating_add(other.disk_bytes),
        }
    }

    /// True if `self` (a free capacity) can hold `req`.
    pub fn fits(&self, req: &ResourceLimits) -> bool {
        self.cpu >= req.cpu && self.ram_bytes >= req.ram_bytes && self.disk_bytes >= req.disk_bytes
    }

    pub fn saturating_sub(&self, other: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu: (self.cpu - other.cpu).max(0.0),
            ram_bytes: self.ram_bytes.saturating_sub(other.ram_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(other.disk_bytes),
        }
    }
}

/// Delivery-guarantee mode of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryGuarantee {
    #[default]
    AtLeastOnce,
    AtMostOnce,
    EffectivelyOnce,
}

/// The part of a definition that instances actually run with.
///
/// Identity, parallelism, version and timestamps are excluded: changing
/// them does not require restarting an instance.
#[derive(Serialize)]
struct EffectiveConfig<'a> {
    implementation: &'a Implementation,
    topic: &'a str,
    serde_class_name: &'a Option<String>,
    schema_type: &'a Option<String>,
    configs: &'a BTreeMap<String, serde_json::Value>,
    secrets: &'a BTreeMap<String, serde_json::Value>,
    resources: &'a ResourceLimits,
    processing_guarantees: DeliveryGuarantee,
    runtime_flags: &'a Option<String>,
}

impl ConnectorDefinition {
    /// A definition with default resources and empty configuration.
    pub fn new(
        id: DefinitionId,
        class_name: &str,
        archive: &str,
        topic: &str,
        parallelism: u32,
    ) -> Self {
        Self {
            id,
            implementation: Implementation {
                class_name: Some(class_name.to_string()),
                archive: Some(archive.to_string()),
            },
            topic: topic.to_string(),
            serde_class_name: None,
            schema_type: None,
            configs: BTreeMap::new(),
            secrets: BTreeMap::new(),
            parallelism,
            resources: ResourceLimits::instance_default(),
            processing_guarantees: DeliveryGuarantee::default(),
            runtime_flags: None,
            version: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Build the composite key for the definitions table.
    pub fn table_key(&self) -> String {
        self.id.table_key()
    }

    /// SHA-256 (hex) of the effective instance configuration.
    pub fn config_digest(&self) -> String {
        let effective = EffectiveConfig {
            implementation: &self.implementation,
            topic: &self.topic,
            serde_class_name: &self.serde_class_name,
            schema_type: &self.schema_type,
            configs: &self.configs,
            secrets: &self.secrets,
            resources: &self.resources,
            processing_guarantees: self.processing_guarantees,
            runtime_flags: &self.runtime_flags,
        };
        // Serializing borrowed maps and plain fields cannot fail.
        let bytes = serde_json::to_vec(&effective).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of an instance as tracked by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    /// Whether the lifecycle state machine allows `self → next`.
    ///
    /// Any state may fail. A failed or stopped instance goes back to
    /// `PENDING` before it can start again.
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (_, Failed) => *self != Failed,
            (Pending, Starting | Stopping | Stopped) => true,
            (Starting, Running | Stopping) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped | Pending) => true,
            (Stopped, Pending) => true,
            (Failed, Pending | Stopping | Stopped) => true,
            _ => false,
        }
    }

    /// A worker may be executing the instance.
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Starting | InstanceState::Running)
    }
}

/// What the operator wants an instance to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Running,
    Stopped,
}

/// Why an instance entered `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The worker did not answer within the call timeout.
    Unreachable,
    /// The worker answered but refused the command.
    CommandRejected(String),
    /// No status report within the heartbeat threshold.
    MissedHeartbeats,
    /// The owning worker left the live node set.
    NodeLost,
    /// The worker reported the instance as failed.
    Reported(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Unreachable => write!(f, "unreachable"),
            FailureReason::CommandRejected(msg) => write!(f, "command rejected: {msg}"),
            FailureReason::MissedHeartbeats => write!(f, "missed heartbeats"),
            FailureReason::NodeLost => write!(f, "node lost"),
            FailureReason::Reported(msg) => write!(f, "reported failure: {msg}"),
        }
    }
}

/// Control-plane record of one instance ordinal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub definition: DefinitionId,
    pub ordinal: u32,
    /// Worker owning this ordinal, if placed.
    pub node_id: Option<NodeId>,
    pub state: InstanceState,
    pub desired: DesiredState,
    /// Definition version the instance runs (or will run once started).
    pub config_version: u64,
    pub config_digest: String,
    pub restart_count: u32,
    /// Automatic FAILED → PENDING retries since the last success.
    pub auto_retries: u32,
    pub failure: Option<FailureReason>,
    /// Unix timestamp of the last status report.
    pub last_heartbeat: u64,
    /// Unix timestamp of the last state change.
    pub updated_at: u64,
}

impl InstanceRecord {
    /// A fresh `PENDING` record for `ordinal` of `definition`.
    pub fn pending(definition: &ConnectorDefinition, ordinal: u32, node_id: Option<NodeId>) -> Self {
        let now = epoch_secs();
        Self {
            definition: definition.id.clone(),
            ordinal,
            node_id,
            state: InstanceState::Pending,
            desired: DesiredState::Running,
            config_version: definition.version,
            config_digest: definition.config_digest(),
            restart_count: 0,
            auto_retries: 0,
            failure: None,
            last_heartbeat: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.definition, self.ordinal)
    }

    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        self.key().table_key()
    }
}

/// State as reported to operators; `Unknown` marks a missing report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedState {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Unknown,
}

impl From<InstanceState> for ReportedState {
    fn from(state: InstanceState) -> Self {
        match state {
            InstanceState::Pending => ReportedState::Pending,
            InstanceState::Starting => ReportedState::Starting,
            InstanceState::Running => ReportedState::Running,
            InstanceState::Stopping => ReportedState::Stopping,
            InstanceState::Stopped => ReportedState::Stopped,
            InstanceState::Failed => ReportedState::Failed,
        }
    }
}

/// Status of one instance as reported by its worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerInstanceStatus {
    pub running: bool,
    #[serde(default)]
    pub config_version: u64,
    #[serde(default)]
    pub num_restarts: u32,
    #[serde(default)]
    pub num_received: u64,
    #[serde(default)]
    pub num_written: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Merged status entry for one ordinal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceStatusEntry {
    pub ordinal: u32,
    pub state: ReportedState,
    pub node_id: Option<NodeId>,
    pub config_version: u64,
    pub num_restarts: u32,
    pub num_received: u64,
    pub num_written: u64,
    pub last_error: Option<String>,
    pub last_heartbeat: u64,
}

/// Merged status of every instance of a definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedStatus {
    pub definition: DefinitionId,
    pub version: u64,
    pub parallelism: u32,
    pub num_running: u32,
    pub instances: Vec<InstanceStatusEntry>,
    pub healthy: bool,
}

// ── Node ──────────────────────────────────────────────────────────

/// A worker node able to run connector instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerNode {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
    pub capacity: ResourceLimits,
    pub used: ResourceLimits,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Unix timestamp of the last heartbeat.
    pub last_heartbeat: u64,
    #[serde(default)]
    pub draining: bool,
}

impl WorkerNode {
    pub fn new(id: &str, address: &str, port: u16, capacity: ResourceLimits) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            port,
            capacity,
            used: ResourceLimits::default(),
            labels: HashMap::new(),
            last_heartbeat: epoch_secs(),
            draining: false,
        }
    }

    pub fn free(&self) -> ResourceLimits {
        self.capacity.saturating_sub(&self.used)
    }

    /// `address:port` for transport clients.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// ── Catalog ───────────────────────────────────────────────────────

/// A connector type available in the cluster's catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectorType {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Source class, when the type can run as a source.
    #[serde(default)]
    pub source_class: Option<String>,
    #[serde(default)]
    pub sink_class: Option<String>,
    #[serde(default)]
    pub archive: Option<String>,
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
