//! # Testing Monitor
//!
//! A processing/aggregation pair that does no science: workers forward what they
//! retrieved, the collector counts events and hits, broadcasts a small snapshot on
//! the data-broadcast cadence and samples frames from workers in turn.

use log::{info, warn};
use serde_json::Value;

use super::{AggregationStrategy, ProcessingStrategy};
use crate::core::event_counter::{CounterIntervals, EventCounter};
use crate::core::topology::Rank;
use crate::errors::{ConfigurationError, ExtractionError};
use crate::model::{DataRecord, FeedbackMap, FeedbackTarget, Payload, ProcessedEnvelope, TIMESTAMP_KEY};
#[cfg(feature = "socket")]
use super::viewer::{DataBroadcaster, Responder};

/// Feedback key asking a worker to attach its next frame.
pub const FRAME_REQUEST_KEY: &str = "frame_request";
/// Processed-payload key carrying a sampled frame.
pub const DETECTOR_DATA_KEY: &str = "detector_data";
/// Viewer tag of aggregate snapshots.
pub const OMDATA_TAG: &str = "omdata";
/// Viewer tag of sampled frames.
pub const OMFRAME_TAG: &str = "omframedata";

/// # Testing Processing
///
/// Passes the record through. A `hit` field, when present, must be a boolean.
#[derive(Debug, Default)]
pub struct TestingProcessing {
    rank: Rank,
}

impl ProcessingStrategy for TestingProcessing {
    fn initialize(&mut self, rank: Rank, _pool_size: usize) -> Result<(), ConfigurationError> {
        self.rank = rank;
        info!("Processing node {} starting", rank);
        Ok(())
    }

    fn process(&mut self, record: DataRecord) -> Result<Payload, ExtractionError> {
        if let Some(hit) = record.get("hit") {
            if !hit.is_boolean() {
                return Err(ExtractionError::InvalidField {
                    name: "hit".to_string(),
                    reason: format!("expected a boolean, got {}", hit),
                });
            }
        }

        let mut payload = record.into_payload();
        let frame_requested = payload
            .remove(FRAME_REQUEST_KEY)
            .is_some_and(|v| v.as_bool().unwrap_or(false));
        if frame_requested {
            let frame = payload.get("event_id").cloned().unwrap_or(Value::Null);
            payload.insert(DETECTOR_DATA_KEY.to_string(), frame);
        }
        Ok(payload)
    }

    fn end_of_stream(&mut self) -> Option<Payload> {
        info!("Processing node {} shutting down", self.rank);
        None
    }
}

/// # Testing Aggregation
pub struct TestingAggregation {
    intervals: CounterIntervals,
    counter: Option<EventCounter>,
    latest: Payload,
    frames_received: u64,
    #[cfg(feature = "socket")]
    broadcaster: Option<DataBroadcaster>,
    #[cfg(feature = "socket")]
    responder: Option<Responder>,
}

impl TestingAggregation {
    /// Aggregation with the given cadence and no viewer sockets.
    pub fn new(intervals: CounterIntervals) -> Self {
        Self {
            intervals,
            counter: None,
            latest: Payload::new(),
            frames_received: 0,
            #[cfg(feature = "socket")]
            broadcaster: None,
            #[cfg(feature = "socket")]
            responder: None,
        }
    }

    /// Attaches the viewer broadcast and request sockets.
    #[cfg(feature = "socket")]
    pub fn with_viewers(mut self, broadcaster: Option<DataBroadcaster>, responder: Option<Responder>) -> Self {
        self.broadcaster = broadcaster;
        self.responder = responder;
        self
    }

    /// The event counter, once initialized.
    pub fn counter(&self) -> Option<&EventCounter> {
        self.counter.as_ref()
    }

    /// Last snapshot broadcast to viewers.
    pub fn latest(&self) -> &Payload {
        &self.latest
    }

    /// Sampled frames received so far.
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    #[cfg(feature = "socket")]
    fn broadcast(&self, tag: &str, data: Payload) {
        if let Some(broadcaster) = &self.broadcaster {
            if let Err(e) = broadcaster.send_data(tag, data) {
                warn!("Failed to broadcast '{}' to viewers: {}", tag, e);
            }
        }
    }

    #[cfg(not(feature = "socket"))]
    fn broadcast(&self, _tag: &str, _data: Payload) {}
}

impl AggregationStrategy for TestingAggregation {
    fn initialize(&mut self, _rank: Rank, pool_size: usize) -> Result<(), ConfigurationError> {
        self.counter = Some(EventCounter::new(self.intervals, pool_size));
        info!("Starting the monitor...");
        Ok(())
    }

    fn collect(&mut self, mut envelope: ProcessedEnvelope) -> Option<FeedbackMap> {
        let Some(counter) = self.counter.as_mut() else {
            warn!("Aggregation used before initialization, envelope dropped");
            return None;
        };

        let timestamp = envelope.timestamp().unwrap_or_default();
        let hit = envelope
            .payload
            .get("hit")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if hit {
            counter.record_hit();
        } else {
            counter.record_non_hit();
        }
        counter.report_speed();

        let mut outgoing = Vec::new();
        if counter.should_broadcast() {
            let mut snapshot = Payload::new();
            snapshot.insert(TIMESTAMP_KEY.to_string(), Value::from(timestamp));
            snapshot.insert("event_counter".to_string(), Value::from(counter.num_events()));
            snapshot.insert("num_hits".to_string(), Value::from(counter.num_hits()));
            self.latest = snapshot.clone();
            outgoing.push((OMDATA_TAG, snapshot));
        }

        let mut feedback = FeedbackMap::new();
        if counter.should_send_hit_frame() || counter.should_send_non_hit_frame() {
            let mut request = Payload::new();
            request.insert(FRAME_REQUEST_KEY.to_string(), Value::Bool(true));
            feedback.insert(FeedbackTarget::Rank(counter.next_feedback_target()), request);
        }

        if let Some(frame) = envelope.payload.remove(DETECTOR_DATA_KEY) {
            self.frames_received += 1;
            let mut data = Payload::new();
            data.insert(TIMESTAMP_KEY.to_string(), Value::from(timestamp));
            data.insert(DETECTOR_DATA_KEY.to_string(), frame);
            outgoing.push((OMFRAME_TAG, data));
        }

        for (tag, data) in outgoing {
            self.broadcast(tag, data);
        }

        let mut all = Payload::new();
        all.insert("timestamp_of_last_event".to_string(), Value::from(timestamp));
        feedback.insert(FeedbackTarget::All, all);
        Some(feedback)
    }

    #[cfg(feature = "socket")]
    fn on_idle(&mut self) {
        let Some(responder) = self.responder.as_mut() else {
            return;
        };
        while let Some(request) = responder.get_request() {
            if let Err(e) = responder.send_data(request.client, &self.latest) {
                warn!("Failed to answer viewer {}: {}", request.client, e);
            }
        }
    }

    fn finalize(&mut self) -> Option<Payload> {
        let (num_events, num_hits) = self
            .counter
            .as_ref()
            .map_or((0, 0), |c| (c.num_events(), c.num_hits()));
        info!("Processing finished. OM has processed {} events in total.", num_events);
        if let Some(counter) = &self.counter {
            info!(
                "Counting started at {}, {} sampled frames received",
                counter.start_timestamp().to_rfc3339(),
                self.frames_received
            );
        }

        let mut summary = Payload::new();
        summary.insert("num_events".to_string(), Value::from(num_events));
        summary.insert("num_hits".to_string(), Value::from(num_hits));
        summary.insert("num_frames".to_string(), Value::from(self.frames_received));
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(timestamp: f64, hit: bool) -> ProcessedEnvelope {
        let payload = DataRecord::new(timestamp).with_field("hit", hit).into_payload();
        ProcessedEnvelope::new(payload, 1)
    }

    #[test]
    fn test_processing_rejects_non_boolean_hit() {
        let mut processing = TestingProcessing::default();
        let err = processing
            .process(DataRecord::new(1.0).with_field("hit", "yes"))
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidField { ref name, .. } if name == "hit"));
    }

    #[test]
    fn test_processing_attaches_frame_on_request() {
        let mut processing = TestingProcessing::default();
        let payload = processing
            .process(
                DataRecord::new(1.0)
                    .with_field("event_id", "1-0")
                    .with_field(FRAME_REQUEST_KEY, true),
            )
            .unwrap();
        assert_eq!(payload.get(DETECTOR_DATA_KEY), Some(&json!("1-0")));
        assert!(!payload.contains_key(FRAME_REQUEST_KEY));
    }

    #[test]
    fn test_aggregation_counts_and_samples_round_robin() {
        let mut aggregation = TestingAggregation::new(CounterIntervals {
            data_broadcast: Some(2),
            hit_frame_sending: Some(1),
            ..Default::default()
        });
        aggregation.initialize(0, 3).unwrap();

        let first = aggregation.collect(envelope(1.0, true)).unwrap();
        assert!(first.contains_key(&FeedbackTarget::Rank(1)));
        assert_eq!(first[&FeedbackTarget::All]["timestamp_of_last_event"], json!(1.0));

        let mut sampled = envelope(2.0, false);
        sampled.payload.insert(DETECTOR_DATA_KEY.to_string(), json!("1-0"));
        let second = aggregation.collect(sampled).unwrap();
        assert!(second.contains_key(&FeedbackTarget::Rank(2)));
        assert_eq!(aggregation.latest()["event_counter"], json!(2));
        assert_eq!(aggregation.frames_received(), 1);

        let summary = aggregation.finalize().unwrap();
        assert_eq!(summary["num_events"], json!(2));
        assert_eq!(summary["num_hits"], json!(1));
        assert_eq!(summary["num_frames"], json!(1));
    }
}
