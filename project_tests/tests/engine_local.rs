//! # Node Pool Integration Tests (process-group backend)
//!
//! Whole pools wired through `LocalGroup`, driven either one iteration at a time on
//! the test thread or end to end with one thread per rank.

use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{json, Value};

use lib_monitor::core::CollectorState;
use lib_monitor::model::feedback_for;
use lib_monitor::strategies::synthetic::SyntheticSource;
use lib_monitor::strategies::testing::{TestingAggregation, TestingProcessing};
use lib_monitor::strategies::{AggregationStrategy, EventSource, EventStream, ProcessingStrategy};
use lib_monitor::transport::{LocalGroup, LocalTransport, FEEDBACK_HIGH_WATER_MARK};
use lib_monitor::{
    CollectorNode, ConfigurationError, CounterIntervals, DataRecord, EngineOptions, ExtractionError,
    FeedbackMap, FeedbackTarget, MonitorNode, Payload, ProcessedEnvelope, ProcessingDriver, Rank,
    RunSummary, Strategies, Topology, WorkerNode, WorkerState,
};

// --- Collaborators ---

/// Keeps every payload it sees and answers the first envelope with `feedback`.
#[derive(Default)]
struct Recording {
    seen: Arc<Mutex<Vec<Payload>>>,
    feedback: Option<FeedbackMap>,
}

impl AggregationStrategy for Recording {
    fn initialize(&mut self, _: Rank, _: usize) -> Result<(), ConfigurationError> {
        Ok(())
    }

    fn collect(&mut self, envelope: ProcessedEnvelope) -> Option<FeedbackMap> {
        self.seen.lock().unwrap().push(envelope.payload);
        self.feedback.take()
    }
}

/// Records every payload, then hands it to the testing aggregation.
struct Tapped {
    inner: TestingAggregation,
    seen: Arc<Mutex<Vec<Payload>>>,
}

impl AggregationStrategy for Tapped {
    fn initialize(&mut self, rank: Rank, pool_size: usize) -> Result<(), ConfigurationError> {
        self.inner.initialize(rank, pool_size)
    }

    fn collect(&mut self, envelope: ProcessedEnvelope) -> Option<FeedbackMap> {
        self.seen.lock().unwrap().push(envelope.payload.clone());
        self.inner.collect(envelope)
    }

    fn finalize(&mut self) -> Option<Payload> {
        self.inner.finalize()
    }
}

/// Running count, sum and maximum of an integer `value` field.
#[derive(Default)]
struct Summing {
    count: u64,
    sum: i64,
    max: Option<i64>,
}

impl AggregationStrategy for Summing {
    fn initialize(&mut self, _: Rank, _: usize) -> Result<(), ConfigurationError> {
        Ok(())
    }

    fn collect(&mut self, envelope: ProcessedEnvelope) -> Option<FeedbackMap> {
        let value = envelope.payload.get("value").and_then(Value::as_i64).unwrap_or(0);
        self.count += 1;
        self.sum += value;
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        None
    }

    fn finalize(&mut self) -> Option<Payload> {
        json!({"count": self.count, "sum": self.sum, "max": self.max})
            .as_object()
            .cloned()
    }
}

/// Yields a fixed list of records.
struct FixedSource(Vec<DataRecord>);

impl EventSource for FixedSource {
    fn initialize(&mut self, _: Rank, _: usize) -> Result<(), ConfigurationError> {
        Ok(())
    }

    fn events(&mut self) -> EventStream {
        Box::new(std::mem::take(&mut self.0).into_iter().map(Ok))
    }

    fn retrieve_event(&mut self, event_id: &str) -> Result<DataRecord, ExtractionError> {
        Err(ExtractionError::Source {
            event_id: event_id.to_string(),
            reason: "not retrievable".to_string(),
        })
    }
}

fn testing_processing() -> Box<dyn ProcessingStrategy> {
    Box::new(TestingProcessing::default())
}

fn stepped_pool(
    size: usize,
    aggregation: Box<dyn AggregationStrategy>,
) -> (CollectorNode<LocalTransport>, Vec<WorkerNode<LocalTransport>>) {
    stepped_pool_with(size, aggregation, EngineOptions::default())
}

fn stepped_pool_with(
    size: usize,
    aggregation: Box<dyn AggregationStrategy>,
    options: EngineOptions,
) -> (CollectorNode<LocalTransport>, Vec<WorkerNode<LocalTransport>>) {
    let mut transports = LocalGroup::create(size).unwrap().into_iter();
    let collector = CollectorNode::new(
        Topology::new(0, size).unwrap(),
        transports.next().unwrap(),
        aggregation,
        options,
    )
    .unwrap();
    let workers = transports
        .enumerate()
        .map(|(i, t)| WorkerNode::new(Topology::new(i + 1, size).unwrap(), t, testing_processing()).unwrap())
        .collect();
    (collector, workers)
}

/// Runs a pool built by the driver, one thread per worker, and returns the collector's summary.
fn run_threaded(size: usize, mut strategies_for: impl FnMut(Rank) -> Strategies) -> (RunSummary, Vec<RunSummary>) {
    let mut nodes: Vec<MonitorNode<LocalTransport>> = LocalGroup::create(size)
        .unwrap()
        .into_iter()
        .enumerate()
        .map(|(rank, transport)| {
            ProcessingDriver::initialize(
                Topology::new(rank, size).unwrap(),
                transport,
                strategies_for(rank),
                EngineOptions::default(),
            )
            .unwrap()
        })
        .collect();

    let collector = nodes.remove(0);
    let handles: Vec<_> = nodes
        .into_iter()
        .map(|node| thread::spawn(move || node.run().unwrap()))
        .collect();
    let summary = collector.run().unwrap();
    let workers = handles.into_iter().map(|h| h.join().unwrap()).collect();
    (summary, workers)
}

fn record(timestamp: f64) -> DataRecord {
    DataRecord::new(timestamp)
}

// --- Termination ---

#[test]
fn test_collector_drains_exactly_after_the_last_terminal_in_any_order() {
    let orders = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    for order in orders {
        let (mut collector, mut workers) = stepped_pool(4, Box::new(Summing::default()));
        assert_eq!(collector.poll().unwrap(), CollectorState::CollectingLoop);

        for worker in workers.iter_mut() {
            worker.step(Ok(record(1.0))).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(collector.poll().unwrap(), CollectorState::CollectingLoop);
        }
        assert_eq!(collector.collected(), 3);

        for (position, &index) in order.iter().enumerate() {
            workers[index].finish().unwrap();
            let state = collector.poll().unwrap();
            if position == 2 {
                assert_eq!(state, CollectorState::Draining, "order {:?}", order);
            } else {
                assert_eq!(state, CollectorState::CollectingLoop, "order {:?}", order);
            }
        }

        assert_eq!(collector.poll().unwrap(), CollectorState::Terminated);
        assert_eq!(collector.summary().finished_workers, vec![1, 2, 3]);
    }
}

#[test]
fn test_collector_waits_forever_for_a_silent_worker() {
    let (mut collector, mut workers) = stepped_pool(3, Box::new(Summing::default()));
    workers[0].step(Ok(record(1.0))).unwrap();
    workers[0].finish().unwrap();

    for _ in 0..50 {
        collector.poll().unwrap();
    }
    assert_eq!(collector.state(), CollectorState::CollectingLoop);
    assert_eq!(collector.summary().finished_workers, vec![1]);
}

// --- Aggregation ---

#[test]
fn test_final_aggregate_does_not_depend_on_arrival_order() {
    let values: Vec<i64> = vec![4, -2, 9, 0, 7, 3];
    let mut permutations = vec![values.clone()];
    let mut reversed = values.clone();
    reversed.reverse();
    permutations.push(reversed);
    for shift in 1..values.len() {
        let mut rotated = values.clone();
        rotated.rotate_left(shift);
        permutations.push(rotated);
    }

    let finals: Vec<Payload> = permutations
        .into_iter()
        .map(|perm| {
            let (collector, mut workers) = stepped_pool(2, Box::new(Summing::default()));
            let worker = &mut workers[0];
            for value in perm {
                worker.step(Ok(record(1.0).with_field("value", value))).unwrap();
            }
            worker.finish().unwrap();
            collector.run().unwrap().final_payload.unwrap()
        })
        .collect();

    assert_eq!(finals[0]["count"], json!(6));
    assert_eq!(finals[0]["sum"], json!(21));
    assert_eq!(finals[0]["max"], json!(9));
    assert!(finals.iter().all(|f| *f == finals[0]));
}

#[test]
fn test_failed_record_never_reaches_the_collector() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let aggregation = Recording {
        seen: Arc::clone(&seen),
        feedback: None,
    };
    let (collector, mut workers) = stepped_pool(2, Box::new(aggregation));

    let worker = &mut workers[0];
    for n in 1..=5 {
        let hit: Value = if n == 3 { json!("maybe") } else { json!(false) };
        let state = worker
            .step(Ok(record(n as f64).with_field("n", n).with_field("hit", hit)))
            .unwrap();
        assert_eq!(state, WorkerState::ProducingLoop);
    }
    worker.finish().unwrap();
    assert_eq!(worker.summary().events, 4);
    assert_eq!(worker.summary().skipped, 1);

    let summary = collector.run().unwrap();
    assert_eq!(summary.events, 4);
    assert_eq!(summary.finished_workers, vec![1]);

    let numbers: Vec<Value> = seen.lock().unwrap().iter().map(|p| p["n"].clone()).collect();
    assert_eq!(numbers, vec![json!(1), json!(2), json!(4), json!(5)]);
}

#[test]
fn test_source_errors_are_skipped_in_place() {
    let (collector, mut workers) = stepped_pool(2, Box::new(Summing::default()));
    let worker = &mut workers[0];
    worker.step(Ok(record(1.0))).unwrap();
    worker
        .step(Err(ExtractionError::MissingField("frame".to_string())))
        .unwrap();
    worker.step(Ok(record(2.0))).unwrap();
    worker.finish().unwrap();

    assert_eq!(worker.summary().skipped, 1);
    assert_eq!(collector.run().unwrap().final_payload.unwrap()["count"], json!(2));
}

#[test]
fn test_two_workers_one_record_each() {
    let (summary, workers) = run_threaded(3, |rank| Strategies {
        source: Box::new(FixedSource(vec![record(rank as f64)])),
        processing: testing_processing(),
        aggregation: Box::new(TestingAggregation::new(CounterIntervals::default())),
    });

    let final_payload = summary.final_payload.unwrap();
    assert_eq!(final_payload["num_events"], json!(2));
    assert_eq!(final_payload["num_hits"], json!(0));
    assert_eq!(summary.events, 2);
    assert_eq!(summary.finished_workers, vec![1, 2]);
    assert!(!summary.interrupted);
    assert!(workers.iter().all(|w| w.events == 1));
}

// --- Feedback ---

#[test]
fn test_all_feedback_is_merged_into_every_next_record() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let aggregation = Recording {
        seen: Arc::clone(&seen),
        feedback: Some(feedback_for(
            FeedbackTarget::All,
            json!({"x": 1}).as_object().cloned().unwrap(),
        )),
    };
    let (mut collector, mut workers) = stepped_pool(3, Box::new(aggregation));
    collector.poll().unwrap();

    workers[0].step(Ok(record(1.0).with_field("n", 1))).unwrap();
    collector.poll().unwrap();

    workers[0].step(Ok(record(2.0).with_field("n", 2))).unwrap();
    workers[1].step(Ok(record(3.0).with_field("n", 3))).unwrap();
    collector.poll().unwrap();
    collector.poll().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen[0].get("x").is_none());
    for payload in &seen[1..] {
        assert_eq!(payload["x"], json!(1), "payload {:?}", payload);
    }
}

#[test]
fn test_frame_requests_go_to_workers_in_turn() {
    let intervals = CounterIntervals {
        hit_frame_sending: Some(2),
        ..Default::default()
    };
    let (summary, workers) = run_threaded(4, |_| Strategies {
        source: Box::new(SyntheticSource::new(40)),
        processing: testing_processing(),
        aggregation: Box::new(TestingAggregation::new(intervals)),
    });

    let final_payload = summary.final_payload.unwrap();
    assert_eq!(final_payload["num_events"], json!(120));
    assert_eq!(final_payload["num_hits"], json!(60));
    assert_eq!(summary.finished_workers, vec![1, 2, 3]);
    assert_eq!(workers.iter().map(|w| w.events).sum::<u64>(), 120);
}

#[test]
fn test_merged_feedback_stays_recent_under_a_feedback_storm() {
    const POOL_SIZE: usize = 5;
    const ROUNDS: usize = 500;
    let workers_in_pool = POOL_SIZE - 1;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut aggregation = Tapped {
        inner: TestingAggregation::new(CounterIntervals::default()),
        seen: Arc::clone(&seen),
    };
    aggregation.initialize(0, POOL_SIZE).unwrap();
    let (mut collector, mut workers) = stepped_pool(POOL_SIZE, Box::new(aggregation));
    collector.poll().unwrap();

    // Every envelope answers with an "all" feedback, so each worker receives one
    // feedback per pool member for every record it sends.
    for round in 0..ROUNDS {
        for (i, worker) in workers.iter_mut().enumerate() {
            worker.step(Ok(record((round * workers_in_pool + i) as f64))).unwrap();
        }
        for _ in 0..workers_in_pool {
            collector.poll().unwrap();
        }
    }
    assert_eq!(collector.collected(), (ROUNDS * workers_in_pool) as u64);

    let bound = (FEEDBACK_HIGH_WATER_MARK + 2 * workers_in_pool) as f64;
    let seen = seen.lock().unwrap();
    let mut merged = 0;
    for payload in seen.iter() {
        let Some(last) = payload.get("timestamp_of_last_event").and_then(Value::as_f64) else {
            continue;
        };
        merged += 1;
        let age = payload["timestamp"].as_f64().unwrap() - last;
        assert!(age <= bound, "feedback {} events old in {:?}", age, payload);
    }
    assert!(merged > ROUNDS * workers_in_pool / 2);
}

// --- Shutdown ---

#[test]
fn test_interrupt_stops_every_worker_and_skips_finalize() {
    let options = EngineOptions::default();
    let interrupt = options.interrupt.clone();
    let (mut collector, mut workers) = stepped_pool_with(3, Box::new(Summing::default()), options);

    collector.poll().unwrap();
    workers[1].step(Ok(record(1.0))).unwrap();
    workers[1].finish().unwrap();
    workers[0].step(Ok(record(2.0))).unwrap();

    interrupt.raise();
    assert_eq!(collector.poll().unwrap(), CollectorState::ShuttingDown);

    assert_eq!(workers[0].step(Ok(record(3.0))).unwrap(), WorkerState::Terminated);
    assert!(workers[0].summary().interrupted);

    let mut polls = 0;
    while collector.poll().unwrap() != CollectorState::Terminated {
        polls += 1;
        assert!(polls < 20, "collector did not terminate");
    }

    let summary = collector.summary();
    assert!(summary.interrupted);
    assert_eq!(summary.dead_workers, vec![1]);
    assert_eq!(summary.finished_workers, vec![2]);
    assert_eq!(summary.discarded, 2);
    assert!(summary.final_payload.is_none());
}
