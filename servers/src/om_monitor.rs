//! # om_monitor
//!
//! Entry point of the real-time data-reduction monitor. One invocation runs one
//! rank of the node pool over the socket transport, or the whole pool in-process
//! over the local transport.
//!
//! ## Exit Status:
//!
//! - `0`: every processing node finished and the collecting node finalized.
//! - `2`: the configuration was rejected before anything ran.
//! - `130`: the run was interrupted and the pool was shut down.
//! - `1`: any other failure.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::process::ExitCode;

use anyhow::Result;

use lib_monitor::configs::{load_config, TransportKind};
use lib_monitor::{ConfigurationError, EngineOptions, InterruptFlag, MonitorError, NodeRole};

mod monitor_logic;
use monitor_logic::{logger, pool, signals};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(monitor_error) = e.downcast_ref::<MonitorError>() {
                report(&e, monitor_error.exit_code())
            } else if e.downcast_ref::<ConfigurationError>().is_some() {
                report(&e, 2)
            } else {
                report(&e, 1)
            }
        }
    }
}

fn report(e: &anyhow::Error, code: u8) -> ExitCode {
    match code {
        // Configuration problems may happen before the logger exists.
        2 => eprintln!("om_monitor: {:#}", e),
        130 => log::warn!("{:#}", e),
        _ => log::error!("{:#}", e),
    }
    ExitCode::from(code)
}

fn run() -> Result<()> {
    // --- Phase 1: Configuration ---
    let config = load_config()?;
    let settings = config.validate()?;
    let rank = settings.topology.rank();

    // --- Phase 2: Logging ---
    let log_path = logger::setup_logging(&settings.log_dir, settings.log_level, rank)?;
    log::info!(
        "Rank {} of {} starting ({:?} transport), logging to {}",
        rank,
        settings.topology.pool_size(),
        settings.transport,
        log_path.display()
    );

    // --- Phase 3: Single-event retrieval ---
    if let Some(event_id) = &settings.retrieve_event {
        let mut source = pool::build_source(&settings);
        source.initialize(rank, settings.topology.pool_size())?;
        let record = source.retrieve_event(event_id)?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    // --- Phase 4: Signals ---
    let interrupt = InterruptFlag::new();
    let role = match settings.transport {
        TransportKind::Local => NodeRole::Collector,
        TransportKind::Socket => settings.topology.role(),
    };
    signals::install(interrupt.clone(), role)?;
    let options = EngineOptions {
        poll: settings.poll,
        interrupt,
    };

    // --- Phase 5: Run ---
    let summary = match settings.transport {
        TransportKind::Local => pool::run_local_pool(&settings, &options)?,
        TransportKind::Socket => pool::run_socket_node(&config, &settings, &options)?,
    };

    // --- Phase 6: Report ---
    match summary.role {
        NodeRole::Collector => {
            log::info!(
                "Collected {} events from {} processing nodes ({} discarded during shutdown)",
                summary.events,
                summary.finished_workers.len(),
                summary.discarded
            );
            if let Some(final_payload) = &summary.final_payload {
                log::info!("Final result: {}", serde_json::Value::Object(final_payload.clone()));
            }
            if summary.interrupted {
                return Err(MonitorError::Interrupted.into());
            }
        }
        NodeRole::Worker => log::info!(
            "Processing node {} sent {} events, skipped {}",
            rank,
            summary.events,
            summary.skipped
        ),
    }

    log::info!("Shutdown complete.");
    Ok(())
}
