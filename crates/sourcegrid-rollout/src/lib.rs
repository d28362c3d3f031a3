//! sourcegrid-rollout: applying definition updates to running instances.
//!
//! An update is validated, diffed against the current instance records,
//! and then applied in order: removals, batched restarts behind a health
//! gate, then creation of new ordinals.
//!
//! # Components
//!
//! - **`plan`**: Update validation and the per-ordinal diff
//! - **`strategy`**: Rolling batch sizing
//! - **`controller`**: Rollout state machine (batches, health gate, halt)
//! - **`coordinator`**: Drives an update through the lifecycle controller

pub mod controller;
pub mod coordinator;
pub mod error;
pub mod plan;
pub mod strategy;

pub use controller::{BatchHealth, Rollout, RolloutPhase};
pub use coordinator::{ApplyOptions, RolloutReport, UpdateCoordinator};
pub use error::{RolloutError, RolloutResult};
pub use plan::{UpdatePlan, validate_update};
pub use strategy::RollingConfig;
