//! # Data Model
//!
//! The values that travel through the node pool:
//!
//! - **`DataRecord`**: one event as extracted on a processing node. It always
//!   carries a `timestamp` plus arbitrary named source fields.
//! - **`ProcessedEnvelope`**: the processed payload of one record together with the
//!   rank that produced it. This is the unit shipped from a worker to the collector.
//!   A payload holding the `end` key is the terminal payload of its worker.
//! - **`FeedbackMap`**: what the aggregation hands back after one envelope, keyed
//!   by destination (one rank, or every worker).
//! - **`Message`**: the transport-level frame, tagged by channel.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::topology::Rank;

/// Arbitrary key/value data. Key order is preserved as inserted by serde_json's map.
pub type Payload = Map<String, Value>;

/// Key that marks a payload as the terminal payload of a worker.
pub const END_KEY: &str = "end";
/// Key holding the event timestamp in records and processed payloads.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// # Data Record
///
/// A single event, as extracted from the event source on a processing node.
/// Produced fresh per event and consumed exactly once; ownership moves with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Event timestamp in seconds. Monotonic-ish, not guaranteed strictly increasing.
    pub timestamp: f64,
    /// Named source values extracted for this event.
    #[serde(flatten)]
    pub fields: Payload,
}

impl DataRecord {
    /// Creates a record with no source fields.
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            fields: Payload::new(),
        }
    }

    /// Builder-style insert.
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Looks up a source field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Inserts or replaces a source field.
    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    /// Merges feedback received from the collector into this record.
    ///
    /// Feedback wins over existing fields. A numeric `timestamp` entry replaces the
    /// record timestamp; a non-numeric one is ignored.
    pub fn merge_feedback(&mut self, feedback: &Payload) {
        for (key, value) in feedback {
            if key == TIMESTAMP_KEY {
                if let Some(ts) = value.as_f64() {
                    self.timestamp = ts;
                }
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Flattens the record into a payload with the timestamp first.
    pub fn into_payload(self) -> Payload {
        let mut payload = Payload::new();
        payload.insert(TIMESTAMP_KEY.to_string(), Value::from(self.timestamp));
        payload.extend(self.fields);
        payload
    }
}

/// # Processed Envelope
///
/// Processed data plus the rank of the node that processed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEnvelope {
    /// The processed payload.
    pub payload: Payload,
    /// Rank of the originating processing node.
    pub origin_rank: Rank,
}

impl ProcessedEnvelope {
    /// Wraps a processed payload.
    pub fn new(payload: Payload, origin_rank: Rank) -> Self {
        Self {
            payload,
            origin_rank,
        }
    }

    /// The terminal payload a worker sends once its events are exhausted.
    pub fn terminal(origin_rank: Rank) -> Self {
        let mut payload = Payload::new();
        payload.insert(END_KEY.to_string(), Value::Bool(true));
        Self {
            payload,
            origin_rank,
        }
    }

    /// True if this envelope announces the end of its worker's event stream.
    pub fn is_terminal(&self) -> bool {
        self.payload.contains_key(END_KEY)
    }

    /// Timestamp of the processed event, if the payload carries one.
    pub fn timestamp(&self) -> Option<f64> {
        self.payload.get(TIMESTAMP_KEY).and_then(Value::as_f64)
    }
}

/// Destination of a feedback entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackTarget {
    /// Every processing node.
    All,
    /// A single processing node.
    Rank(Rank),
}

impl fmt::Display for FeedbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackTarget::All => write!(f, "all"),
            FeedbackTarget::Rank(rank) => write!(f, "{}", rank),
        }
    }
}

/// Feedback produced by the aggregation for one envelope.
pub type FeedbackMap = BTreeMap<FeedbackTarget, Payload>;

/// Convenience constructor for a feedback map with a single entry.
pub fn feedback_for(target: FeedbackTarget, payload: Payload) -> FeedbackMap {
    let mut map = FeedbackMap::new();
    map.insert(target, payload);
    map
}

/// # Channel Tag
///
/// Separates the logical channels between two ranks. Messages on the same
/// (source, destination, tag) triple are delivered in FIFO order; nothing is
/// promised across tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    /// Collector asks a worker to stop.
    Die,
    /// Worker confirms it stopped on request.
    Dead,
    /// Processed envelopes, worker to collector.
    Data,
    /// Feedback, collector to worker.
    Feedback,
}

impl Tag {
    /// Numeric tag value, kept stable for logs and wire dumps.
    pub fn code(self) -> u16 {
        match self {
            Tag::Die => 999,
            Tag::Dead => 1000,
            Tag::Data => 1001,
            Tag::Feedback => 1002,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// # Transport Message
///
/// Everything that can travel between two ranks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Message {
    /// A processed envelope (including terminal payloads).
    Data(ProcessedEnvelope),
    /// Feedback to merge into the next record.
    Feedback(Payload),
    /// Stop request.
    Die,
    /// Stop confirmation from the given rank.
    Dead(Rank),
}

impl Message {
    /// The channel this message travels on.
    pub fn tag(&self) -> Tag {
        match self {
            Message::Data(_) => Tag::Data,
            Message::Feedback(_) => Tag::Feedback,
            Message::Die => Tag::Die,
            Message::Dead(_) => Tag::Dead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_feedback_overrides_fields_and_timestamp() {
        let mut record = DataRecord::new(1.0).with_field("x", 0).with_field("y", "keep");
        let feedback = json!({"x": 1, "timestamp": 7.5}).as_object().cloned().unwrap();
        record.merge_feedback(&feedback);

        assert_eq!(record.timestamp, 7.5);
        assert_eq!(record.get("x"), Some(&json!(1)));
        assert_eq!(record.get("y"), Some(&json!("keep")));
    }

    #[test]
    fn test_terminal_envelope_is_detected_by_end_key() {
        assert!(ProcessedEnvelope::terminal(3).is_terminal());

        let payload = DataRecord::new(2.0).into_payload();
        let envelope = ProcessedEnvelope::new(payload, 3);
        assert!(!envelope.is_terminal());
        assert_eq!(envelope.timestamp(), Some(2.0));
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::Data(ProcessedEnvelope::terminal(2));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "data");
        assert_eq!(value["body"]["origin_rank"], 2);
        assert_eq!(value["body"]["payload"]["end"], true);
        assert_eq!(msg.tag(), Tag::Data);
        assert_eq!(Message::Die.tag().code(), 999);
        assert_eq!(Tag::Feedback.to_string(), "Feedback(1002)");
    }
}
