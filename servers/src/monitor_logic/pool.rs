//! Building and running the nodes of this process.

use std::process::{Child, Command};
use std::thread;

use anyhow::{anyhow, Context, Result};

use lib_monitor::configs::{MonitorConfig, MonitorSettings, SourceSpec};
use lib_monitor::strategies::file_list::FileListSource;
use lib_monitor::strategies::synthetic::SyntheticSource;
use lib_monitor::strategies::testing::{TestingAggregation, TestingProcessing};
use lib_monitor::strategies::viewer::{DataBroadcaster, Responder};
use lib_monitor::strategies::EventSource;
use lib_monitor::transport::{LocalGroup, SocketEndpoints, SocketTransport};
use lib_monitor::{
    EngineOptions, MonitorError, PreparedNode, ProcessingDriver, Rank, RunSummary, Strategies, Topology,
};

/// Event source selected by the settings.
pub fn build_source(settings: &MonitorSettings) -> Box<dyn EventSource> {
    match &settings.source {
        SourceSpec::Files(list) => Box::new(FileListSource::new(list)),
        SourceSpec::Synthetic(count) => Box::new(SyntheticSource::new(*count)),
    }
}

/// Strategy set for `rank`. Only the collecting node binds the viewer sockets.
pub fn build_strategies(settings: &MonitorSettings, rank: Rank) -> Result<Strategies, MonitorError> {
    let mut aggregation = TestingAggregation::new(settings.intervals);
    if rank == 0 {
        let broadcaster = settings
            .data_broadcast_url
            .as_ref()
            .map(DataBroadcaster::bind)
            .transpose()?;
        let responder = settings
            .responding_url
            .as_ref()
            .map(Responder::bind)
            .transpose()?;
        aggregation = aggregation.with_viewers(broadcaster, responder);
    }

    Ok(Strategies {
        source: build_source(settings),
        processing: Box::new(TestingProcessing::default()),
        aggregation: Box::new(aggregation),
    })
}

/// Initializes the strategies of `rank`. Touches no transport.
fn prepare(settings: &MonitorSettings, rank: Rank) -> Result<PreparedNode, MonitorError> {
    let topology = Topology::new(rank, settings.topology.pool_size())?;
    ProcessingDriver::prepare(topology, build_strategies(settings, rank)?)
}

/// Fails with the configuration error a spawned processing node would hit at startup.
fn check_worker_sources(settings: &MonitorSettings) -> Result<(), MonitorError> {
    for rank in 1..settings.topology.pool_size() {
        let topology = Topology::new(rank, settings.topology.pool_size())?;
        build_source(settings).initialize(topology.rank(), topology.pool_size())?;
    }
    Ok(())
}

/// Runs the whole pool inside this process, one thread per processing node.
///
/// Every rank's strategies are initialized before any node starts. Returns the
/// collecting node's summary.
pub fn run_local_pool(settings: &MonitorSettings, options: &EngineOptions) -> Result<RunSummary> {
    let pool_size = settings.topology.pool_size();
    let mut prepared = Vec::with_capacity(pool_size);
    for rank in (0..pool_size).rev() {
        prepared.push(prepare(settings, rank)?);
    }
    prepared.reverse();

    let mut nodes = prepared
        .into_iter()
        .zip(LocalGroup::create(pool_size)?)
        .map(|(node, transport)| ProcessingDriver::assemble(node, transport, options.clone()));
    let collector = nodes
        .next()
        .ok_or_else(|| anyhow!("local group has no collecting node"))??;

    let mut handles = Vec::new();
    for node in nodes {
        let node = node?;
        let rank = handles.len() + 1;
        let handle = thread::Builder::new()
            .name(format!("om-worker-{}", rank))
            .spawn(move || node.run())
            .with_context(|| format!("failed to start processing node {}", rank))?;
        handles.push((rank, handle));
    }

    let summary = collector.run();

    for (rank, handle) in handles {
        match handle.join() {
            Ok(Ok(worker)) => log::debug!(
                "Processing node {} done: {} sent, {} skipped",
                rank,
                worker.events,
                worker.skipped
            ),
            Ok(Err(e)) => log::error!("Processing node {} failed: {}", rank, e),
            Err(_) => log::error!("Processing node {} panicked", rank),
        }
    }

    Ok(summary?)
}

/// Runs this rank as its own process over TCP, optionally starting the other ranks.
///
/// Configuration problems surface before this rank opens or connects any socket.
pub fn run_socket_node(config: &MonitorConfig, settings: &MonitorSettings, options: &EngineOptions) -> Result<RunSummary> {
    let endpoints = SocketEndpoints {
        data: settings.data_endpoint.clone(),
        feedback: settings.feedback_endpoint.clone(),
    };
    let rank = settings.topology.rank();
    let pool_size = settings.topology.pool_size();

    if rank == 0 {
        if settings.spawn_workers {
            check_worker_sources(settings)?;
        }
        let prepared = prepare(settings, rank)?;
        let transport = SocketTransport::collector(pool_size, &endpoints)?;
        let children = if settings.spawn_workers {
            spawn_workers(config, pool_size)?
        } else {
            Vec::new()
        };
        let summary = ProcessingDriver::assemble(prepared, transport, options.clone()).and_then(|node| node.run());
        reap(children);
        Ok(summary?)
    } else {
        let prepared = prepare(settings, rank)?;
        let transport = SocketTransport::worker(rank, pool_size, &endpoints)?;
        Ok(ProcessingDriver::assemble(prepared, transport, options.clone())?.run()?)
    }
}

/// Starts ranks `1..pool_size` as child processes of this executable.
fn spawn_workers(config: &MonitorConfig, pool_size: usize) -> Result<Vec<(Rank, Child)>> {
    let exe = std::env::current_exe().context("cannot locate the monitor executable")?;
    let mut children = Vec::new();
    for rank in 1..pool_size {
        let child_config = MonitorConfig {
            rank: Some(rank),
            spawn_workers: Some(false),
            ..config.clone()
        };
        let child = Command::new(&exe)
            .args(child_config.to_args())
            .spawn()
            .with_context(|| format!("failed to spawn processing node {}", rank))?;
        log::info!("Spawned processing node {} (pid {})", rank, child.id());
        children.push((rank, child));
    }
    Ok(children)
}

fn reap(children: Vec<(Rank, Child)>) {
    for (rank, mut child) in children {
        match child.wait() {
            Ok(status) if status.success() => log::debug!("Processing node {} exited", rank),
            Ok(status) => log::warn!("Processing node {} exited with {}", rank, status),
            Err(e) => log::error!("Failed to wait for processing node {}: {}", rank, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_monitor::ConfigurationError;
    use std::io::ErrorKind;
    use std::net::TcpListener;

    fn files_config(dir: &std::path::Path, listener: &TcpListener, rank: usize) -> MonitorConfig {
        let port = listener.local_addr().unwrap().port();
        MonitorConfig {
            node_pool_size: Some(2),
            rank: Some(rank),
            transport: Some("socket".to_string()),
            data_endpoint: Some(format!("tcp://127.0.0.1:{}", port)),
            feedback_endpoint: Some(format!("tcp://127.0.0.1:{}", port + 1)),
            source_kind: Some("files".to_string()),
            source: Some(dir.join("missing.lst").display().to_string()),
            log_dir: Some(dir.to_path_buf()),
            ..MonitorConfig::defaults()
        }
    }

    fn is_source_error(e: &anyhow::Error) -> bool {
        matches!(
            e.downcast_ref::<MonitorError>(),
            Some(MonitorError::Configuration(ConfigurationError::SourceUnavailable { .. }))
        )
    }

    #[test]
    fn test_worker_with_bad_source_never_connects() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let config = files_config(dir.path(), &listener, 1);
        let settings = config.validate().unwrap();

        let err = run_socket_node(&config, &settings, &EngineOptions::default()).unwrap_err();
        assert!(is_source_error(&err), "unexpected error: {:#}", err);
        assert_eq!(listener.accept().unwrap_err().kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_collector_checks_worker_sources_before_binding() {
        let dir = tempfile::tempdir().unwrap();
        // Holding the data port makes any bind attempt fail with a transport error.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = MonitorConfig {
            spawn_workers: Some(true),
            ..files_config(dir.path(), &listener, 0)
        };
        let settings = config.validate().unwrap();

        let err = run_socket_node(&config, &settings, &EngineOptions::default()).unwrap_err();
        assert!(is_source_error(&err), "unexpected error: {:#}", err);
    }
}
