//! Synthetic event source: a fixed number of generated records per worker.

use chrono::Utc;

use super::{EventSource, EventStream};
use crate::core::topology::Rank;
use crate::errors::{ConfigurationError, ExtractionError};
use crate::model::DataRecord;

/// Spacing between two generated timestamps, in seconds.
const EVENT_SPACING: f64 = 0.01;

/// # Synthetic Source
///
/// Every worker yields `count` records with ids `"<rank>-<n>"`, increasing
/// timestamps and a `hit` flag that alternates starting with `true`.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    count: u64,
    rank: Rank,
    start: Option<f64>,
}

impl SyntheticSource {
    /// `count` records per worker, timestamped from the moment of initialization.
    pub fn new(count: u64) -> Self {
        Self {
            count,
            rank: 0,
            start: None,
        }
    }

    /// Fixes the first timestamp instead of using the wall clock.
    pub fn starting_at(mut self, timestamp: f64) -> Self {
        self.start = Some(timestamp);
        self
    }

    fn record(rank: Rank, n: u64, start: f64) -> DataRecord {
        DataRecord::new(start + n as f64 * EVENT_SPACING)
            .with_field("event_id", format!("{}-{}", rank, n))
            .with_field("hit", n % 2 == 0)
    }
}

impl EventSource for SyntheticSource {
    fn initialize(&mut self, rank: Rank, _pool_size: usize) -> Result<(), ConfigurationError> {
        self.rank = rank;
        if self.start.is_none() {
            self.start = Some(Utc::now().timestamp_millis() as f64 / 1000.0);
        }
        Ok(())
    }

    fn events(&mut self) -> EventStream {
        let (rank, start) = (self.rank, self.start.unwrap_or_default());
        Box::new((0..self.count).map(move |n| Ok(Self::record(rank, n, start))))
    }

    fn retrieve_event(&mut self, event_id: &str) -> Result<DataRecord, ExtractionError> {
        let invalid = |reason: &str| ExtractionError::Source {
            event_id: event_id.to_string(),
            reason: reason.to_string(),
        };
        let (rank, n) = event_id
            .split_once('-')
            .ok_or_else(|| invalid("expected '<rank>-<index>'"))?;
        let rank: Rank = rank.parse().map_err(|_| invalid("rank is not a number"))?;
        let n: u64 = n.parse().map_err(|_| invalid("index is not a number"))?;
        if n >= self.count {
            return Err(invalid("index beyond the configured event count"));
        }
        Ok(Self::record(rank, n, self.start.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generates_count_records_per_worker() {
        let mut source = SyntheticSource::new(3).starting_at(100.0);
        source.initialize(2, 4).unwrap();
        let records: Vec<DataRecord> = source.events().map(Result::unwrap).collect();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].get("event_id"), Some(&json!("2-0")));
        assert_eq!(records[1].get("hit"), Some(&json!(false)));
        assert!(records[2].timestamp > records[0].timestamp);
    }

    #[test]
    fn test_retrieve_single_event() {
        let mut source = SyntheticSource::new(5).starting_at(0.0);
        let record = source.retrieve_event("1-4").unwrap();
        assert_eq!(record.get("event_id"), Some(&json!("1-4")));
        assert!(source.retrieve_event("1-5").is_err());
        assert!(source.retrieve_event("garbage").is_err());
    }
}
