//! sourcegrid-state: definition store and instance arena for SourceGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for connector definitions, instance records, and worker nodes.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{tenant}/{namespace}/{name}`, `{definition}#{ordinal}`)
//! keep related records adjacent so range scans find them.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{DefinitionCursor, StateStore};
pub use types::*;
