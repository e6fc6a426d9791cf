//! # Strategy Contracts
//!
//! The engine never knows where events come from, what is extracted from them or
//! how results are reduced. Those three concerns are injected at startup as trait
//! objects and called through the contracts below.
//!
//! ## Core Components:
//!
//! - **`EventSource`**: yields the records of this node's shard, and can fetch a
//!   single record by id outside the streaming path.
//! - **`ProcessingStrategy`**: turns one record into one processed payload on a worker.
//! - **`AggregationStrategy`**: folds processed envelopes into running state on the
//!   collector and optionally answers with feedback.
//!
//! Bundled collaborators: [`file_list::FileListSource`], [`synthetic::SyntheticSource`],
//! [`testing::TestingProcessing`] and [`testing::TestingAggregation`].

use crate::core::topology::Rank;
use crate::errors::{ConfigurationError, ExtractionError};
use crate::model::{DataRecord, FeedbackMap, Payload, ProcessedEnvelope};

pub mod file_list;
pub mod synthetic;
pub mod testing;
#[cfg(feature = "socket")]
pub mod viewer;

/// Owned stream of records. A failed record is reported in place and skipped by the worker.
pub type EventStream = Box<dyn Iterator<Item = Result<DataRecord, ExtractionError>> + Send>;

/// # Event Source
pub trait EventSource: Send {
    /// Prepares the source for this node. Failures are fatal at startup.
    fn initialize(&mut self, rank: Rank, pool_size: usize) -> Result<(), ConfigurationError>;

    /// Takes the record stream for this node's shard.
    fn events(&mut self) -> EventStream;

    /// Fetches exactly one record by its opaque identifier.
    fn retrieve_event(&mut self, event_id: &str) -> Result<DataRecord, ExtractionError>;
}

/// # Processing Strategy
pub trait ProcessingStrategy: Send {
    /// Prepares per-node state. Failures are fatal at startup.
    fn initialize(&mut self, rank: Rank, pool_size: usize) -> Result<(), ConfigurationError>;

    /// Reduces one record to the payload shipped to the collector.
    ///
    /// The payload must carry every field the aggregation reads.
    fn process(&mut self, record: DataRecord) -> Result<Payload, ExtractionError>;

    /// Called once after the event stream is exhausted; may return a final payload.
    fn end_of_stream(&mut self) -> Option<Payload> {
        None
    }
}

/// # Aggregation Strategy
pub trait AggregationStrategy: Send {
    /// Prepares the collector state. Failures are fatal at startup.
    fn initialize(&mut self, rank: Rank, pool_size: usize) -> Result<(), ConfigurationError>;

    /// Folds one processed envelope in; may return feedback for the workers.
    fn collect(&mut self, envelope: ProcessedEnvelope) -> Option<FeedbackMap>;

    /// Called whenever the collector found nothing to receive.
    fn on_idle(&mut self) {}

    /// Called once after every worker finished.
    fn finalize(&mut self) -> Option<Payload> {
        None
    }
}
