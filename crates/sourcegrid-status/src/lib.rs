//! sourcegrid-status: merged status of a connector's instances.
//!
//! The aggregator asks every placed instance's worker for its status in
//! parallel and merges the answers with the control plane's records. It is
//! a read path: it takes no identity lock and never writes a record.

pub mod aggregator;

pub use aggregator::{StatusAggregator, StatusConfig, StatusError, StatusResult};
