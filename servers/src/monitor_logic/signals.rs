use std::thread;

use tokio::signal;

use lib_monitor::{InterruptFlag, NodeRole};

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => log::info!("SIGTERM received, initiating shutdown."),
    }
}

/// Watches for shutdown signals on a background thread.
///
/// On the collecting node a signal raises `flag`, which starts the orderly
/// shutdown of the pool. Processing nodes only stop when the collecting node tells
/// them to, so there the signal is logged and otherwise ignored.
pub fn install(flag: InterruptFlag, role: NodeRole) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("om-signals".to_string())
        .spawn(move || {
            runtime.block_on(async {
                loop {
                    shutdown_signal().await;
                    match role {
                        NodeRole::Collector => flag.raise(),
                        NodeRole::Worker => {
                            log::info!("Processing node waits for the collecting node to stop it.")
                        }
                    }
                }
            })
        })?;
    Ok(())
}
