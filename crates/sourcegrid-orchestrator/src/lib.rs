//! sourcegrid-orchestrator: the operation surface of the control plane.
//!
//! [`Orchestrator`] validates requests, serializes mutations per connector
//! identity, and routes them through the update coordinator and lifecycle
//! controller. Reads go straight to the store and the status aggregator.
//! [`Orchestrator::run`] is the background reconcile loop.
//!
//! # Components
//!
//! - **`orchestrator`**: register / update / deregister, reads, operator verbs
//! - **`validate`**: definition checks applied before anything is stored
//! - **`artifacts`**: package resolution and the connector catalog
//! - **`reconciler`**: periodic reconciliation of every definition

pub mod artifacts;
pub mod error;
pub mod orchestrator;
pub mod reconciler;
pub mod validate;

pub use artifacts::{ArtifactError, ArtifactStore, ResolvedPackage, StaticCatalog};
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{DeregisterReport, Orchestrator, OrchestratorConfig, UpdateOptions};
pub use reconciler::TickSummary;
pub use validate::{SUPPORTED_SCHEMES, validate_definition};

pub use sourcegrid_lifecycle::{InstanceOutcome, InstanceReport};
pub use sourcegrid_rollout::RolloutReport;
