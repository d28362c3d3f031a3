//! sourcegrid-cluster: worker membership for SourceGrid.
//!
//! Workers join with their endpoint and capacity, send periodic heartbeats
//! with their resource usage, and leave when shutting down. A worker that
//! misses heartbeats for longer than the dead timeout drops out of the live
//! set the scheduler and dispatcher see, and is eventually reaped.
//!
//! ```text
//! Worker ── join / heartbeat / leave ──▶ MembershipManager ──▶ StateStore (nodes)
//!                                             │
//!                                             └── NodeRegistry::live_nodes()
//!                                                   ├── Lifecycle Controller
//!                                                   └── Status Aggregator
//! ```

pub mod membership;

pub use membership::{HeartbeatRequest, JoinRequest, Member, MemberStatus, MembershipManager};
