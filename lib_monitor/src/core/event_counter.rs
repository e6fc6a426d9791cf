//! # Event Counter
//!
//! Pure bookkeeping for the collecting node. It counts processed events and hits,
//! and answers the cadence questions the aggregation asks after every envelope:
//! is it time to broadcast, to sample a frame, to report speed, and which worker
//! supplies the next sampled frame.
//!
//! All cadence decisions are modulo checks on the cumulative event count. An
//! interval that is unset or zero disables the matching decision.

use std::time::Instant;

use chrono::{DateTime, Utc};
use log::info;

use crate::core::topology::Rank;

/// Cadence intervals, all optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterIntervals {
    /// Events between two speed reports.
    pub speed_report: Option<u64>,
    /// Events between two data broadcasts.
    pub data_broadcast: Option<u64>,
    /// Events between two sampled hit frames.
    pub hit_frame_sending: Option<u64>,
    /// Events between two sampled non-hit frames.
    pub non_hit_frame_sending: Option<u64>,
}

/// # Event Counter
///
/// Lives for the whole run on the collector and is only touched from its
/// single collecting loop.
#[derive(Debug)]
pub struct EventCounter {
    intervals: CounterIntervals,
    num_events: u64,
    num_hits: u64,
    start_timestamp: DateTime<Utc>,
    old_time: Instant,
    pool_size: usize,
    next_rank: Rank,
}

impl EventCounter {
    /// Starts counting now.
    ///
    /// `pool_size` includes the collector. Zero intervals are normalized to `None`.
    pub fn new(intervals: CounterIntervals, pool_size: usize) -> Self {
        Self {
            intervals: CounterIntervals {
                speed_report: normalize(intervals.speed_report),
                data_broadcast: normalize(intervals.data_broadcast),
                hit_frame_sending: normalize(intervals.hit_frame_sending),
                non_hit_frame_sending: normalize(intervals.non_hit_frame_sending),
            },
            num_events: 0,
            num_hits: 0,
            start_timestamp: Utc::now(),
            old_time: Instant::now(),
            pool_size,
            next_rank: 1,
        }
    }

    /// Counts one event classified as a hit.
    pub fn record_hit(&mut self) {
        self.num_events += 1;
        self.num_hits += 1;
    }

    /// Counts one event classified as a non-hit.
    pub fn record_non_hit(&mut self) {
        self.num_events += 1;
    }

    /// Events counted so far.
    pub fn num_events(&self) -> u64 {
        self.num_events
    }

    /// Hits counted so far.
    pub fn num_hits(&self) -> u64 {
        self.num_hits
    }

    /// Wall-clock time at which counting started.
    pub fn start_timestamp(&self) -> DateTime<Utc> {
        self.start_timestamp
    }

    /// The normalized intervals in use.
    pub fn intervals(&self) -> CounterIntervals {
        self.intervals
    }

    /// True when the event count is a positive multiple of the broadcast interval.
    pub fn should_broadcast(&self) -> bool {
        self.fires(self.intervals.data_broadcast)
    }

    /// Sampling cadence for hit frames.
    ///
    /// Count based: the classification of the current event is not consulted.
    pub fn should_send_hit_frame(&self) -> bool {
        self.fires(self.intervals.hit_frame_sending)
    }

    /// Sampling cadence for non-hit frames. Count based, like the hit cadence.
    pub fn should_send_non_hit_frame(&self) -> bool {
        self.fires(self.intervals.non_hit_frame_sending)
    }

    /// Next worker to request a sample frame from, cycling over `1..pool_size`.
    pub fn next_feedback_target(&mut self) -> Rank {
        let rank = self.next_rank;
        self.next_rank = if rank + 1 >= self.pool_size { 1 } else { rank + 1 };
        rank
    }

    /// Logs processing speed when the speed-report cadence fires.
    ///
    /// Returns the measured rate in Hz when a report was emitted.
    pub fn report_speed(&mut self) -> Option<f64> {
        let interval = self.intervals.speed_report?;
        if !self.fires(Some(interval)) {
            return None;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.old_time).as_secs_f64();
        // Two reports inside the clock resolution would otherwise divide by zero.
        let rate = interval as f64 / elapsed.max(f64::EPSILON);
        info!(
            "Processed: {} in {:.2} seconds ({:.3} Hz)",
            self.num_events, elapsed, rate
        );
        self.old_time = now;
        Some(rate)
    }

    fn fires(&self, interval: Option<u64>) -> bool {
        match interval {
            Some(k) => self.num_events > 0 && self.num_events % k == 0,
            None => false,
        }
    }
}

fn normalize(interval: Option<u64>) -> Option<u64> {
    interval.filter(|k| *k > 0)
}
