//! # Core
//!
//! ## Core Components:
//!
//! - **`topology`**: rank, role and the static sharding rule.
//! - **`event_counter`**: event/hit counts and every cadence decision.
//! - **`engine`**: the collector and worker state machines.
//! - **`driver`**: builds the right node for this rank from injected strategies.

pub mod driver;
pub mod engine;
pub mod event_counter;
pub mod topology;

pub use driver::{MonitorNode, PreparedNode, ProcessingDriver, Strategies};
pub use engine::{
    CollectorNode, CollectorState, EngineOptions, InterruptFlag, PollPolicy, RunSummary, WorkerNode,
    WorkerState,
};
pub use event_counter::{CounterIntervals, EventCounter};
pub use topology::{role_of, shard_range, NodeRole, Rank, Topology, COLLECTOR_RANK};
