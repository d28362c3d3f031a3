//! SourceGrid placement scheduler: least-loaded assignment of instance ordinals.
//!
//! This crate decides which worker node runs each instance ordinal of a
//! connector definition. It does not talk to workers; the lifecycle
//! controller executes the plans it produces.
//!
//! # Components
//!
//! - **`scorer`**: Node eligibility (resources, draining) and ranking
//! - **`placer`**: Greedy ordinal assignment, co-location fallback
//! - **`convert`**: Type conversions from state store types

pub mod convert;
pub mod placer;
pub mod scorer;

pub use convert::{definition_to_requirements, node_loads};
pub use placer::{PlacementError, PlacementPlan, PlacementPolicy, PlacementResult, compute_placement};
pub use scorer::{NodeLoad, PlacementRequirements, compare_load, is_eligible};
