//! # lib_monitor
//!
//! The parallelization and aggregation engine behind the `om_monitor` real-time
//! data-reduction monitor. A pool of processing nodes pulls detector frames from a
//! facility-specific source, reduces each frame to a small set of features, and
//! ships the result to a single collecting node. The collecting node folds every
//! result into running statistics, broadcasts them to viewers, and sends feedback
//! back into the pool.
//!
//! ## Module Map:
//!
//! - **`core`**: event counting, node-pool topology, the collector/worker state
//!   machines and the driver that wires strategies to them.
//! - **`transport`**: the backend-agnostic `Transport` contract with an in-memory
//!   process-group backend and a TCP push/pub backend.
//! - **`model`**: records, envelopes, feedback maps and the transport message.
//! - **`strategies`**: the source/processing/aggregation contracts and the
//!   collaborators shipped with the monitor.
//! - **`configs`**: the layered configuration loader.
//! - **`errors`**: the error taxonomy shared by every layer.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Event counting, topology, engine state machines and the processing driver.
pub mod core;
/// Layered configuration (defaults, JSON file, CLI/env).
pub mod configs;
/// Error taxonomy.
pub mod errors;
/// Records, envelopes and messages exchanged between nodes.
pub mod model;
/// Event source, processing and aggregation contracts plus bundled collaborators.
pub mod strategies;
/// Point-to-point and publish/subscribe messaging between ranks.
pub mod transport;

// --- Public API Re-exports ---
pub use crate::core::{
    CollectorNode, CollectorState, CounterIntervals, EngineOptions, EventCounter, InterruptFlag,
    MonitorNode, NodeRole, PollPolicy, PreparedNode, ProcessingDriver, Rank, RunSummary,
    Strategies, Topology, WorkerNode, WorkerState,
};
pub use errors::{ConfigurationError, ExtractionError, MonitorError, TransportError};
pub use model::{DataRecord, FeedbackMap, FeedbackTarget, Message, Payload, ProcessedEnvelope};
