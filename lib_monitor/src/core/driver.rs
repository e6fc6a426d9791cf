//! # Processing Driver
//!
//! Wires the strategies chosen at startup to the engine for this node's role.
//! There is no lookup by name anywhere: the caller hands in concrete strategy
//! objects and the driver only decides which of them this rank needs.

use log::info;

use crate::core::engine::{CollectorNode, EngineOptions, RunSummary, WorkerNode};
use crate::core::topology::{NodeRole, Topology};
use crate::errors::{ConfigurationError, MonitorError};
use crate::strategies::{AggregationStrategy, EventSource, EventStream, ProcessingStrategy};
use crate::transport::Transport;

/// The strategy objects of one monitor run.
pub struct Strategies {
    /// Event source, used on workers.
    pub source: Box<dyn EventSource>,
    /// Processing strategy, used on workers.
    pub processing: Box<dyn ProcessingStrategy>,
    /// Aggregation strategy, used on the collector.
    pub aggregation: Box<dyn AggregationStrategy>,
}

/// A node ready to run.
pub enum MonitorNode<T: Transport> {
    /// Rank 0.
    Collector(CollectorNode<T>),
    /// Any other rank, with its event stream.
    Worker {
        /// The worker state machine.
        node: WorkerNode<T>,
        /// Records of this worker's shard.
        events: EventStream,
    },
}

impl<T: Transport> MonitorNode<T> {
    /// Role of this node.
    pub fn role(&self) -> NodeRole {
        match self {
            MonitorNode::Collector(_) => NodeRole::Collector,
            MonitorNode::Worker { .. } => NodeRole::Worker,
        }
    }

    /// Runs the node to completion.
    pub fn run(self) -> Result<RunSummary, MonitorError> {
        match self {
            MonitorNode::Collector(node) => node.run(),
            MonitorNode::Worker { node, events } => node.run(events),
        }
    }
}

/// Strategies of one rank, initialized and waiting for a transport.
pub struct PreparedNode {
    topology: Topology,
    strategies: PreparedStrategies,
}

enum PreparedStrategies {
    Collector(Box<dyn AggregationStrategy>),
    Worker {
        processing: Box<dyn ProcessingStrategy>,
        events: EventStream,
    },
}

impl PreparedNode {
    /// Topology the strategies were initialized for.
    pub fn topology(&self) -> Topology {
        self.topology
    }
}

/// # Processing Driver
pub struct ProcessingDriver;

impl ProcessingDriver {
    /// Initializes the strategies this rank needs and builds its node.
    ///
    /// Strategy initialization failures are configuration errors: nothing has been
    /// sent yet and the process should exit.
    pub fn initialize<T: Transport>(
        topology: Topology,
        transport: T,
        strategies: Strategies,
        options: EngineOptions,
    ) -> Result<MonitorNode<T>, MonitorError> {
        let prepared = Self::prepare(topology, strategies)?;
        Self::assemble(prepared, transport, options)
    }

    /// Initializes the strategies this rank needs, without touching any transport.
    ///
    /// Callers that open network connections do this first so that a bad source
    /// or strategy setting fails before any peer sees this rank.
    pub fn prepare(topology: Topology, strategies: Strategies) -> Result<PreparedNode, MonitorError> {
        let rank = topology.rank();
        let pool_size = topology.pool_size();

        let strategies = match topology.role() {
            NodeRole::Collector => {
                let Strategies { mut aggregation, .. } = strategies;
                aggregation.initialize(rank, pool_size)?;
                info!("Collecting node initialized (pool size {})", pool_size);
                PreparedStrategies::Collector(aggregation)
            }
            NodeRole::Worker => {
                let Strategies {
                    mut source,
                    mut processing,
                    ..
                } = strategies;
                source.initialize(rank, pool_size)?;
                processing.initialize(rank, pool_size)?;
                info!("Processing node {} initialized", rank);
                PreparedStrategies::Worker {
                    processing,
                    events: source.events(),
                }
            }
        };
        Ok(PreparedNode { topology, strategies })
    }

    /// Binds prepared strategies to `transport` and builds the node.
    pub fn assemble<T: Transport>(
        prepared: PreparedNode,
        transport: T,
        options: EngineOptions,
    ) -> Result<MonitorNode<T>, MonitorError> {
        let PreparedNode { topology, strategies } = prepared;
        if transport.rank() != topology.rank() || transport.pool_size() != topology.pool_size() {
            return Err(ConfigurationError::InvalidParameter {
                name: "rank".to_string(),
                reason: format!(
                    "transport is rank {} of {}, node is rank {} of {}",
                    transport.rank(),
                    transport.pool_size(),
                    topology.rank(),
                    topology.pool_size()
                ),
            }
            .into());
        }

        match strategies {
            PreparedStrategies::Collector(aggregation) => Ok(MonitorNode::Collector(CollectorNode::new(
                topology,
                transport,
                aggregation,
                options,
            )?)),
            PreparedStrategies::Worker { processing, events } => Ok(MonitorNode::Worker {
                node: WorkerNode::new(topology, transport, processing)?,
                events,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_counter::CounterIntervals;
    use crate::strategies::file_list::FileListSource;
    use crate::strategies::synthetic::SyntheticSource;
    use crate::strategies::testing::{TestingAggregation, TestingProcessing};
    use crate::transport::LocalGroup;

    fn strategies() -> Strategies {
        Strategies {
            source: Box::new(SyntheticSource::new(2)),
            processing: Box::new(TestingProcessing::default()),
            aggregation: Box::new(TestingAggregation::new(CounterIntervals::default())),
        }
    }

    #[test]
    fn test_role_selects_node_kind() {
        let mut group = LocalGroup::create(2).unwrap();
        let worker_transport = group.pop().unwrap();
        let collector_transport = group.pop().unwrap();

        let collector = ProcessingDriver::initialize(
            Topology::new(0, 2).unwrap(),
            collector_transport,
            strategies(),
            EngineOptions::default(),
        )
        .unwrap();
        assert_eq!(collector.role(), NodeRole::Collector);

        let worker = ProcessingDriver::initialize(
            Topology::new(1, 2).unwrap(),
            worker_transport,
            strategies(),
            EngineOptions::default(),
        )
        .unwrap();
        assert_eq!(worker.role(), NodeRole::Worker);
    }

    #[test]
    fn test_mismatched_transport_is_rejected() {
        let mut group = LocalGroup::create(3).unwrap();
        let result = ProcessingDriver::initialize(
            Topology::new(1, 3).unwrap(),
            group.remove(2),
            strategies(),
            EngineOptions::default(),
        );
        assert!(matches!(
            result,
            Err(MonitorError::Configuration(ConfigurationError::InvalidParameter { .. }))
        ));
    }

    #[test]
    fn test_bad_source_fails_before_a_transport_exists() {
        let dir = tempfile::tempdir().unwrap();
        let strategies = Strategies {
            source: Box::new(FileListSource::new(dir.path().join("missing.lst"))),
            ..strategies()
        };
        let result = ProcessingDriver::prepare(Topology::new(1, 2).unwrap(), strategies);
        assert!(matches!(
            result,
            Err(MonitorError::Configuration(ConfigurationError::SourceUnavailable { .. }))
        ));
    }

    #[test]
    fn test_prepared_collector_skips_the_source() {
        let strategies = Strategies {
            source: Box::new(FileListSource::new("/nonexistent/events.lst")),
            ..strategies()
        };
        let prepared = ProcessingDriver::prepare(Topology::new(0, 2).unwrap(), strategies).unwrap();
        assert_eq!(prepared.topology().role(), NodeRole::Collector);

        let mut group = LocalGroup::create(2).unwrap();
        let node = ProcessingDriver::assemble(prepared, group.remove(0), EngineOptions::default()).unwrap();
        assert_eq!(node.role(), NodeRole::Collector);
    }
}
