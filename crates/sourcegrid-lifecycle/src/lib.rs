//! sourcegrid-lifecycle: the instance state machine and reconciliation.
//!
//! # Components
//!
//! - **`state_machine`**: Checked transitions on instance records
//! - **`locks`**: Per-identity mutual exclusion for mutating operations
//! - **`arena`**: Instance records keyed by `(identity, ordinal)`
//! - **`controller`**: Reconciliation, operator verbs, update primitives
//! - **`outcome`**: Per-instance results and worker reports

pub mod arena;
pub mod controller;
pub mod error;
pub mod locks;
pub mod outcome;
pub mod state_machine;

pub use arena::InstanceArena;
pub use controller::{LifecycleConfig, LifecycleController};
pub use error::{LifecycleError, LifecycleResult};
pub use locks::{IdentityGuard, IdentityLocks};
pub use outcome::{Action, InstanceOutcome, InstanceReport, OutcomeError, ReconcileReport};
