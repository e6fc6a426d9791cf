//! # Error Taxonomy
//!
//! Every failure in the monitor falls into one of three families, and the family
//! decides what happens next:
//!
//! - **`ConfigurationError`**: fatal and startup-only. Raised before any loop
//!   starts; the process prints a diagnostic and exits non-zero.
//! - **`ExtractionError`**: recoverable and per-record. The worker logs it, skips
//!   the record and keeps going. It never crosses a process boundary.
//! - **`TransportError`**: fatal for the node that observes it. The node makes a
//!   best-effort attempt to notify its peers and then terminates.
//!
//! `MonitorError` is the umbrella returned by the driver and the engine.

use thiserror::Error;

use crate::core::topology::Rank;

/// Invalid or missing startup configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The pool has fewer than two nodes.
    #[error("Invalid node pool size {0}: a pool needs one collecting node and at least one processing node")]
    InvalidPoolSize(usize),

    /// The rank does not fit the pool.
    #[error("Rank {rank} is outside of the node pool (size {pool_size})")]
    InvalidRank {
        /// Offending rank.
        rank: Rank,
        /// Size of the pool it was checked against.
        pool_size: usize,
    },

    /// A parameter without a default was never set.
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// An endpoint is not a `tcp://host:port` address.
    #[error("Malformed endpoint address '{address}': {reason}")]
    MalformedEndpoint {
        /// Address as configured.
        address: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A parameter is set to a value that cannot be used.
    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Why the value was refused.
        reason: String,
    },

    /// The event source failed to initialize.
    #[error("Event source '{source_name}' cannot be used: {reason}")]
    SourceUnavailable {
        /// Source string, e.g. the list file path.
        source_name: String,
        /// Underlying failure.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("I/O error while reading configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("Configuration file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single record could not be turned into processed data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    /// A field the processing needs is absent from the record.
    #[error("Cannot interpret event data: source field '{0}' is missing")]
    MissingField(String),

    /// A field is present but unusable.
    #[error("Cannot interpret source field '{name}': {reason}")]
    InvalidField {
        /// Field name.
        name: String,
        /// Why it cannot be used.
        reason: String,
    },

    /// The source could not produce the event's data.
    #[error("Cannot retrieve event '{event_id}': {reason}")]
    Source {
        /// Identifier of the event.
        event_id: String,
        /// Underlying failure.
        reason: String,
    },
}

/// A send or receive primitive failed.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The peer went away.
    #[error("Channel to rank {0} is disconnected")]
    Disconnected(Rank),

    /// A listening socket could not be opened.
    #[error("Failed to bind {address}: {reason}")]
    Bind {
        /// Address that was tried.
        address: String,
        /// Underlying failure.
        reason: String,
    },

    /// The collecting node could not be reached.
    #[error("Failed to connect to {address}: {reason}")]
    Connect {
        /// Address that was tried.
        address: String,
        /// Last failure seen.
        reason: String,
    },

    /// Read or write on an established socket failed.
    #[error("Socket I/O error: {0}")]
    Io(String),

    /// A frame could not be serialized or parsed.
    #[error("Failed to encode or decode a message: {0}")]
    Codec(String),

    /// Destination outside the pool, or not reachable from this rank.
    #[error("Rank {0} is not part of this node pool")]
    UnknownRank(Rank),

    /// The backend's runtime or one of its tasks failed.
    #[error("Transport runtime failure: {0}")]
    Runtime(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Umbrella error for a node run.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// See [`ConfigurationError`].
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// See [`ExtractionError`].
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// The run was stopped by an interrupt.
    #[error("Run interrupted before the node pool finished")]
    Interrupted,
}

impl MonitorError {
    /// Process exit status the binary should use for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MonitorError::Configuration(_) => 2,
            MonitorError::Interrupted => 130,
            _ => 1,
        }
    }
}
