//! # Parallelization Engine
//!
//! The two state machines that drive a node pool:
//!
//! ```text
//! Collector: Init -> CollectingLoop -> Draining -> Terminated
//!                         |
//!                         +-> ShuttingDown -> Terminated      (interrupt)
//!
//! Worker:    Init -> ProducingLoop -> Finalizing -> Terminated
//!                         |
//!                         +-> Terminated                      (die request)
//! ```
//!
//! Both loops are synchronous and poll the transport without ever blocking on a
//! receive. The only blocking call is resolving the previous send of a
//! [`SendSlot`], which bounds every channel to a single outstanding send.
//!
//! `CollectorNode::poll` and `WorkerNode::step` run exactly one iteration, so a
//! whole pool can be interleaved deterministically on one thread.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::core::topology::{NodeRole, Rank, Topology, COLLECTOR_RANK};
use crate::errors::{ExtractionError, MonitorError, TransportError};
use crate::model::{DataRecord, FeedbackMap, FeedbackTarget, Message, Payload, ProcessedEnvelope, Tag};
use crate::strategies::{AggregationStrategy, EventStream, ProcessingStrategy};
use crate::transport::{Received, SendSlot, Source, Topic, Transport};

/// Out-of-band shutdown request, shared between a signal handler and the collector loop.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// A lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Safe to call from any thread, any number of times.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once shutdown was requested.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What an idle loop iteration does before polling again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollPolicy {
    /// `None` spins; `Some(d)` sleeps `d` after an iteration that found nothing.
    pub idle_sleep: Option<Duration>,
}

impl PollPolicy {
    /// Pure busy-poll.
    pub fn spin() -> Self {
        Self { idle_sleep: None }
    }

    /// Sleep `micros` microseconds when idle; `0` spins.
    pub fn from_micros(micros: u64) -> Self {
        Self {
            idle_sleep: (micros > 0).then(|| Duration::from_micros(micros)),
        }
    }

    fn idle(&self) {
        match self.idle_sleep {
            Some(pause) => std::thread::sleep(pause),
            None => std::hint::spin_loop(),
        }
    }
}

/// Shared knobs of both loops.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Idle behavior of the collector loop.
    pub poll: PollPolicy,
    /// Shutdown request checked once per collector iteration.
    pub interrupt: InterruptFlag,
}

/// # Run Summary
///
/// What a node did during its run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Role of the node.
    pub role: NodeRole,
    /// Rank of the node.
    pub rank: Rank,
    /// Envelopes aggregated (collector) or processed envelopes sent (worker).
    pub events: u64,
    /// Records skipped after an extraction error (worker only).
    pub skipped: u64,
    /// Data envelopes received and dropped during shutdown (collector only).
    pub discarded: u64,
    /// Workers that sent their terminal payload (collector only).
    pub finished_workers: Vec<Rank>,
    /// Workers that confirmed a stop request (collector only).
    pub dead_workers: Vec<Rank>,
    /// Result of the aggregation's end-of-run hook (collector only).
    pub final_payload: Option<Payload>,
    /// True if the run ended through the shutdown path instead of exhaustion.
    pub interrupted: bool,
}

impl RunSummary {
    fn new(role: NodeRole, rank: Rank) -> Self {
        Self {
            role,
            rank,
            events: 0,
            skipped: 0,
            discarded: 0,
            finished_workers: Vec::new(),
            dead_workers: Vec::new(),
            final_payload: None,
            interrupted: false,
        }
    }
}

/// Collector lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    /// Built, not polled yet.
    Init,
    /// Receiving envelopes and running the aggregation.
    CollectingLoop,
    /// Every worker finished; the end-of-run hook runs next.
    Draining,
    /// Shutdown requested; waiting for every worker to finish or confirm death.
    ShuttingDown,
    /// Done.
    Terminated,
}

/// # Collector Node
///
/// Rank 0. Receives processed envelopes from any worker, feeds them to the
/// aggregation and fans feedback back out.
pub struct CollectorNode<T: Transport> {
    topology: Topology,
    transport: T,
    aggregation: Box<dyn AggregationStrategy>,
    options: EngineOptions,
    state: CollectorState,
    feedback_slot: SendSlot,
    finished: BTreeSet<Rank>,
    dead: BTreeSet<Rank>,
    die_resent: BTreeSet<Rank>,
    collected: u64,
    discarded: u64,
    final_payload: Option<Payload>,
    interrupted: bool,
}

impl<T: Transport> CollectorNode<T> {
    /// Builds the collector. `topology` must be rank 0.
    pub fn new(
        topology: Topology,
        transport: T,
        aggregation: Box<dyn AggregationStrategy>,
        options: EngineOptions,
    ) -> Result<Self, MonitorError> {
        if topology.role() != NodeRole::Collector {
            return Err(TransportError::UnknownRank(topology.rank()).into());
        }
        Ok(Self {
            topology,
            transport,
            aggregation,
            options,
            state: CollectorState::Init,
            feedback_slot: SendSlot::new(),
            finished: BTreeSet::new(),
            dead: BTreeSet::new(),
            die_resent: BTreeSet::new(),
            collected: 0,
            discarded: 0,
            final_payload: None,
            interrupted: false,
        })
    }

    /// Current state.
    pub fn state(&self) -> CollectorState {
        self.state
    }

    /// Non-terminal envelopes aggregated so far.
    pub fn collected(&self) -> u64 {
        self.collected
    }

    /// Ranks that sent their terminal payload so far.
    pub fn finished_workers(&self) -> impl Iterator<Item = Rank> + '_ {
        self.finished.iter().copied()
    }

    /// Runs until `Terminated`.
    ///
    /// On a transport failure the collector makes one best-effort attempt to stop
    /// the workers and returns the error.
    pub fn run(mut self) -> Result<RunSummary, MonitorError> {
        loop {
            match self.poll() {
                Ok(CollectorState::Terminated) => return Ok(self.summary()),
                Ok(_) => {}
                Err(e) => {
                    error!("Collecting node failed: {}", e);
                    if self.transport.publish(Topic::All, Message::Die).is_err() {
                        debug!("Could not notify processing nodes of the failure");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Runs one loop iteration and returns the state reached.
    pub fn poll(&mut self) -> Result<CollectorState, MonitorError> {
        match self.state {
            CollectorState::Init => {
                info!(
                    "Collecting node started, waiting for {} processing nodes",
                    self.topology.num_workers()
                );
                self.state = CollectorState::CollectingLoop;
            }
            CollectorState::CollectingLoop => self.collect_once()?,
            CollectorState::Draining => {
                self.feedback_slot.wait_send_complete()?;
                self.final_payload = self.aggregation.finalize();
                info!("Collecting node finished after {} events", self.collected);
                self.state = CollectorState::Terminated;
            }
            CollectorState::ShuttingDown => self.shutdown_once()?,
            CollectorState::Terminated => {}
        }
        Ok(self.state)
    }

    /// Snapshot of the run so far.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            events: self.collected,
            discarded: self.discarded,
            finished_workers: self.finished.iter().copied().collect(),
            dead_workers: self.dead.iter().copied().collect(),
            final_payload: self.final_payload.clone(),
            interrupted: self.interrupted,
            ..RunSummary::new(NodeRole::Collector, self.topology.rank())
        }
    }

    fn collect_once(&mut self) -> Result<(), MonitorError> {
        if self.options.interrupt.is_raised() {
            return self.begin_shutdown();
        }

        match self.transport.try_receive(Source::Any, Tag::Data)? {
            Some(Received {
                message: Message::Data(envelope),
                ..
            }) => self.handle_envelope(envelope)?,
            Some(other) => warn!(
                "Ignoring unexpected {} message from rank {}",
                other.message.tag(),
                other.source
            ),
            None => {
                self.aggregation.on_idle();
                self.options.poll.idle();
            }
        }
        Ok(())
    }

    fn handle_envelope(&mut self, envelope: ProcessedEnvelope) -> Result<(), MonitorError> {
        if envelope.is_terminal() {
            let rank = envelope.origin_rank;
            if !self.finished.insert(rank) {
                warn!("Processing node {} announced the end of its events twice", rank);
                return Ok(());
            }
            info!("Processing node {} has finished its events", rank);
            if self.finished.len() == self.topology.num_workers() {
                info!("All processing nodes have finished");
                self.state = CollectorState::Draining;
            }
            return Ok(());
        }

        trace!("Envelope from rank {}", envelope.origin_rank);
        self.collected += 1;
        if let Some(feedback) = self.aggregation.collect(envelope) {
            self.dispatch_feedback(feedback)?;
        }
        Ok(())
    }

    fn dispatch_feedback(&mut self, feedback: FeedbackMap) -> Result<(), MonitorError> {
        for (target, payload) in feedback {
            match target {
                FeedbackTarget::All => {
                    let transport = &mut self.transport;
                    self.feedback_slot
                        .issue(|| transport.publish(Topic::All, Message::Feedback(payload)))?;
                }
                FeedbackTarget::Rank(rank) => {
                    if rank == COLLECTOR_RANK || rank >= self.topology.pool_size() {
                        warn!("Dropping feedback for rank {} outside of the processing pool", rank);
                        continue;
                    }
                    if self.finished.contains(&rank) {
                        debug!("Dropping feedback for finished processing node {}", rank);
                        continue;
                    }
                    let transport = &mut self.transport;
                    self.feedback_slot
                        .issue(|| transport.publish(Topic::Rank(rank), Message::Feedback(payload)))?;
                }
            }
        }
        Ok(())
    }

    fn begin_shutdown(&mut self) -> Result<(), MonitorError> {
        info!("Shutdown requested, asking processing nodes to stop");
        self.interrupted = true;
        let transport = &mut self.transport;
        self.feedback_slot
            .issue(|| transport.publish(Topic::All, Message::Die))?;
        self.state = CollectorState::ShuttingDown;
        Ok(())
    }

    fn outstanding_workers(&self) -> usize {
        self.topology
            .worker_ranks()
            .filter(|r| !self.finished.contains(r) && !self.dead.contains(r))
            .count()
    }

    fn shutdown_once(&mut self) -> Result<(), MonitorError> {
        if self.outstanding_workers() == 0 {
            // Every rank is accounted for, so whatever is still queued can only be discarded.
            while let Some(received) = self.transport.try_receive(Source::Any, Tag::Data)? {
                if let Message::Data(envelope) = received.message {
                    self.discard(envelope, false)?;
                }
            }
            self.feedback_slot.wait_send_complete()?;
            info!(
                "All processing nodes stopped ({} finished, {} on request, {} envelopes discarded)",
                self.finished.len(),
                self.dead.len(),
                self.discarded
            );
            self.state = CollectorState::Terminated;
            return Ok(());
        }

        let mut progressed = false;
        if let Some(received) = self.transport.try_receive(Source::Any, Tag::Dead)? {
            progressed = true;
            if let Message::Dead(rank) = received.message {
                info!("Processing node {} confirmed shutdown", rank);
                self.dead.insert(rank);
            }
        }

        // In-flight data still has to be taken off the transport.
        if let Some(received) = self.transport.try_receive(Source::Any, Tag::Data)? {
            progressed = true;
            if let Message::Data(envelope) = received.message {
                self.discard(envelope, true)?;
            }
        }

        if !progressed {
            self.options.poll.idle();
        }
        Ok(())
    }

    /// Drops an envelope that arrived after the stop request. A terminal one still
    /// marks its rank finished.
    fn discard(&mut self, envelope: ProcessedEnvelope, resend_die: bool) -> Result<(), MonitorError> {
        let rank = envelope.origin_rank;
        if envelope.is_terminal() {
            self.finished.insert(rank);
            return Ok(());
        }
        self.discarded += 1;
        // The broadcast may have been missed by a late subscriber.
        if resend_die && !self.dead.contains(&rank) && self.die_resent.insert(rank) {
            let transport = &mut self.transport;
            self.feedback_slot
                .issue(|| transport.publish(Topic::Rank(rank), Message::Die))?;
        }
        Ok(())
    }
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Built, no record handled yet.
    Init,
    /// Processing records and sending envelopes.
    ProducingLoop,
    /// Events exhausted; sending the final and terminal payloads.
    Finalizing,
    /// Done, either after finalizing or on a stop request.
    Terminated,
}

/// # Worker Node
///
/// Ranks 1..pool_size. Processes its share of events and ships every result to the
/// collector, merging any feedback that arrived in the meantime.
pub struct WorkerNode<T: Transport> {
    topology: Topology,
    transport: T,
    processing: Box<dyn ProcessingStrategy>,
    state: WorkerState,
    data_slot: SendSlot,
    sent: u64,
    skipped: u64,
    stopped_on_request: bool,
}

impl<T: Transport> WorkerNode<T> {
    /// Builds the worker and subscribes it to the `all` and per-rank feedback topics.
    pub fn new(
        topology: Topology,
        mut transport: T,
        processing: Box<dyn ProcessingStrategy>,
    ) -> Result<Self, MonitorError> {
        if topology.role() != NodeRole::Worker {
            return Err(TransportError::UnknownRank(topology.rank()).into());
        }
        transport.subscribe(&Topic::All.as_prefix())?;
        transport.subscribe(&Topic::Rank(topology.rank()).as_prefix())?;
        Ok(Self {
            topology,
            transport,
            processing,
            state: WorkerState::Init,
            data_slot: SendSlot::new(),
            sent: 0,
            skipped: 0,
            stopped_on_request: false,
        })
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Processed envelopes sent so far, excluding the final and terminal payloads.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Drives the worker over its whole event stream, then finalizes.
    ///
    /// A transport failure is reported to the collector on a best-effort basis
    /// before the error is returned.
    pub fn run(mut self, events: EventStream) -> Result<RunSummary, MonitorError> {
        let result = self.produce(events);
        if let Err(e) = result {
            error!("Processing node {} failed: {}", self.topology.rank(), e);
            if self.transport.send(COLLECTOR_RANK, Message::Dead(self.topology.rank())).is_err() {
                debug!("Could not notify the collecting node of the failure");
            }
            return Err(e);
        }
        Ok(self.summary())
    }

    fn produce(&mut self, events: EventStream) -> Result<(), MonitorError> {
        for record in events {
            if self.step(record)? == WorkerState::Terminated {
                return Ok(());
            }
        }
        self.finish()
    }

    /// Handles one record yielded by the event source.
    pub fn step(&mut self, record: Result<DataRecord, ExtractionError>) -> Result<WorkerState, MonitorError> {
        match self.state {
            WorkerState::Init => {
                debug!("Processing node {} started", self.topology.rank());
                self.state = WorkerState::ProducingLoop;
            }
            WorkerState::ProducingLoop => {}
            WorkerState::Finalizing | WorkerState::Terminated => return Ok(self.state),
        }

        if self
            .transport
            .try_receive(Source::Rank(COLLECTOR_RANK), Tag::Die)?
            .is_some()
        {
            self.confirm_death()?;
            return Ok(self.state);
        }

        let mut record = match record {
            Ok(record) => record,
            Err(e) => return Ok(self.skip(e)),
        };

        if let Some(Received {
            message: Message::Feedback(feedback),
            ..
        }) = self
            .transport
            .try_receive(Source::Rank(COLLECTOR_RANK), Tag::Feedback)?
        {
            record.merge_feedback(&feedback);
        }

        let payload = match self.processing.process(record) {
            Ok(payload) => payload,
            Err(e) => return Ok(self.skip(e)),
        };
        self.send_envelope(ProcessedEnvelope::new(payload, self.topology.rank()))?;
        self.sent += 1;
        Ok(self.state)
    }

    /// Sends the end-of-stream payload, if any, then the terminal payload.
    ///
    /// Does nothing on a worker that already stopped on request.
    pub fn finish(&mut self) -> Result<(), MonitorError> {
        if self.state == WorkerState::Terminated {
            return Ok(());
        }
        self.state = WorkerState::Finalizing;
        let rank = self.topology.rank();

        if let Some(payload) = self.processing.end_of_stream() {
            self.send_envelope(ProcessedEnvelope::new(payload, rank))?;
        }
        self.send_envelope(ProcessedEnvelope::terminal(rank))?;
        self.data_slot.wait_send_complete()?;

        info!(
            "Processing node {} finished: {} events sent, {} skipped",
            rank, self.sent, self.skipped
        );
        self.state = WorkerState::Terminated;
        Ok(())
    }

    /// Snapshot of the run so far.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            events: self.sent,
            skipped: self.skipped,
            interrupted: self.stopped_on_request,
            ..RunSummary::new(NodeRole::Worker, self.topology.rank())
        }
    }

    fn skip(&mut self, error: ExtractionError) -> WorkerState {
        warn!("Processing node {} skipped an event: {}", self.topology.rank(), error);
        self.skipped += 1;
        self.state
    }

    fn send_envelope(&mut self, envelope: ProcessedEnvelope) -> Result<(), MonitorError> {
        let transport = &mut self.transport;
        self.data_slot
            .issue(|| transport.send(COLLECTOR_RANK, Message::Data(envelope)))?;
        Ok(())
    }

    fn confirm_death(&mut self) -> Result<(), MonitorError> {
        let rank = self.topology.rank();
        info!("Processing node {} stopping on request", rank);
        let transport = &mut self.transport;
        self.data_slot
            .issue(|| transport.send(COLLECTOR_RANK, Message::Dead(rank)))?;
        self.data_slot.wait_send_complete()?;
        self.stopped_on_request = true;
        self.state = WorkerState::Terminated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConfigurationError;
    use crate::model::feedback_for;
    use crate::transport::{LocalGroup, LocalTransport};
    use serde_json::json;

    struct Passthrough;

    impl ProcessingStrategy for Passthrough {
        fn initialize(&mut self, _: Rank, _: usize) -> Result<(), ConfigurationError> {
            Ok(())
        }

        fn process(&mut self, record: DataRecord) -> Result<Payload, ExtractionError> {
            Ok(record.into_payload())
        }
    }

    #[derive(Default)]
    struct Counting {
        seen: Vec<Payload>,
        feedback: Option<FeedbackMap>,
    }

    impl AggregationStrategy for Counting {
        fn initialize(&mut self, _: Rank, _: usize) -> Result<(), ConfigurationError> {
            Ok(())
        }

        fn collect(&mut self, envelope: ProcessedEnvelope) -> Option<FeedbackMap> {
            self.seen.push(envelope.payload);
            self.feedback.take()
        }

        fn finalize(&mut self) -> Option<Payload> {
            json!({"num_events": self.seen.len()}).as_object().cloned()
        }
    }

    fn pool(size: usize, aggregation: Counting) -> (CollectorNode<LocalTransport>, Vec<WorkerNode<LocalTransport>>) {
        let mut transports = LocalGroup::create(size).unwrap().into_iter();
        let collector = CollectorNode::new(
            Topology::new(0, size).unwrap(),
            transports.next().unwrap(),
            Box::new(aggregation),
            EngineOptions::default(),
        )
        .unwrap();
        let workers = transports
            .enumerate()
            .map(|(i, t)| WorkerNode::new(Topology::new(i + 1, size).unwrap(), t, Box::new(Passthrough)).unwrap())
            .collect();
        (collector, workers)
    }

    #[test]
    fn test_collector_drains_only_after_every_terminal_payload() {
        let (mut collector, mut workers) = pool(3, Counting::default());
        assert_eq!(collector.poll().unwrap(), CollectorState::CollectingLoop);

        workers[1].finish().unwrap();
        collector.poll().unwrap();
        assert_eq!(collector.state(), CollectorState::CollectingLoop);

        workers[0].step(Ok(DataRecord::new(1.0))).unwrap();
        workers[0].finish().unwrap();
        collector.poll().unwrap();
        assert_eq!(collector.collected(), 1);
        assert_eq!(collector.poll().unwrap(), CollectorState::Draining);
        assert_eq!(collector.poll().unwrap(), CollectorState::Terminated);

        let summary = collector.summary();
        assert_eq!(summary.finished_workers, vec![1, 2]);
        assert_eq!(summary.final_payload.unwrap()["num_events"], json!(1));
    }

    #[test]
    fn test_rank_feedback_reaches_only_its_target() {
        let aggregation = Counting {
            feedback: Some(feedback_for(
                FeedbackTarget::Rank(2),
                json!({"x": 5}).as_object().cloned().unwrap(),
            )),
            ..Default::default()
        };
        let (mut collector, mut workers) = pool(3, aggregation);
        collector.poll().unwrap();

        workers[0].step(Ok(DataRecord::new(1.0))).unwrap();
        collector.poll().unwrap();

        workers[0].step(Ok(DataRecord::new(2.0))).unwrap();
        workers[1].step(Ok(DataRecord::new(3.0))).unwrap();
        collector.poll().unwrap();
        collector.poll().unwrap();

        let summary = collector.summary();
        assert_eq!(summary.events, 3);
        assert_eq!(workers[0].sent(), 2);
        assert_eq!(workers[1].sent(), 1);
    }

    #[test]
    fn test_finish_is_a_noop_after_stop_request() {
        let (mut collector, mut workers) = pool(2, Counting::default());
        collector.poll().unwrap();

        let flag = collector.options.interrupt.clone();
        flag.raise();
        assert_eq!(collector.poll().unwrap(), CollectorState::ShuttingDown);

        assert_eq!(workers[0].step(Ok(DataRecord::new(1.0))).unwrap(), WorkerState::Terminated);
        workers[0].finish().unwrap();
        assert_eq!(workers[0].sent(), 0);
        assert!(workers[0].summary().interrupted);

        collector.poll().unwrap();
        assert_eq!(collector.poll().unwrap(), CollectorState::Terminated);
        assert_eq!(collector.summary().dead_workers, vec![1]);
        assert!(collector.summary().final_payload.is_none());
    }

    #[test]
    fn test_shutdown_discards_everything_still_queued() {
        let (mut collector, mut workers) = pool(2, Counting::default());
        collector.poll().unwrap();

        workers[0].step(Ok(DataRecord::new(1.0))).unwrap();
        workers[0].step(Ok(DataRecord::new(2.0))).unwrap();
        workers[0].step(Ok(DataRecord::new(3.0))).unwrap();
        collector.options.interrupt.raise();
        assert_eq!(collector.poll().unwrap(), CollectorState::ShuttingDown);

        assert_eq!(workers[0].step(Ok(DataRecord::new(4.0))).unwrap(), WorkerState::Terminated);

        // One dead and one envelope, then the other two once no rank is outstanding.
        collector.poll().unwrap();
        assert_eq!(collector.poll().unwrap(), CollectorState::Terminated);

        let summary = collector.summary();
        assert_eq!(summary.events, 0);
        assert_eq!(summary.discarded, 3);
        assert_eq!(summary.dead_workers, vec![1]);
        assert!(collector.transport.try_receive(Source::Any, Tag::Data).unwrap().is_none());
    }

    #[test]
    fn test_poll_policy_from_micros() {
        assert_eq!(PollPolicy::from_micros(0), PollPolicy::spin());
        assert_eq!(
            PollPolicy::from_micros(250).idle_sleep,
            Some(Duration::from_micros(250))
        );
    }
}
