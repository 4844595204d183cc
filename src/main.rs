//! linecap: a concurrent line-transformation server
//!
//! Every client line gets exactly one transformed line back, on the same
//! connection, in order. Features:
//! - Thread-per-connection, unbounded by default (optional cap)
//! - Uppercase, lowercase, or echo transforms with an explicit UTF-8 policy
//! - Detach, drain, or abort shutdown on Ctrl-C / SIGTERM
//! - Configuration via CLI arguments or TOML file

use linecap::{Config, Server, ShutdownHandle};
use std::thread;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        transform = ?config.transform,
        encoding = ?config.encoding,
        shutdown = ?config.shutdown,
        max_connections = ?config.max_connections,
        "Starting linecap server"
    );

    let mut server = Server::from_config(config);
    server.bind()?;
    spawn_signal_listener(server.shutdown_handle())?;

    server.serve()?;

    let stats = server.stats();
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        completed = stats.completed,
        failed = stats.failed,
        lines = stats.lines,
        "Final stats"
    );
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM on a helper thread, then request shutdown.
fn spawn_signal_listener(handle: ShutdownHandle) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if runtime.block_on(wait_for_signal()) {
                info!("Shutdown signal received");
                handle.shutdown();
            }
        })?;
    Ok(())
}

async fn wait_for_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => log_signal_result(result),
                    _ = terminate.recv() => true,
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, only Ctrl-C will stop the server");
                log_signal_result(tokio::signal::ctrl_c().await)
            }
        }
    }

    #[cfg(not(unix))]
    {
        log_signal_result(tokio::signal::ctrl_c().await)
    }
}

fn log_signal_result(result: std::io::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            false
        }
    }
}
