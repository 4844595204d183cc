//! linecap-load: synthetic traffic for a linecap server
//!
//! Spawns simulated users that mix short and long line exchanges, then
//! prints latency, throughput, and failure counts. Ctrl-C stops the run
//! early and still prints the report.

use clap::Parser;
use linecap::load::{self, LoadArgs, LoadConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = LoadArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = LoadConfig::try_from(args)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, finishing in-flight requests");
                let _ = stop_tx.send(true);
            }
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });

    let report = load::run_until(config, stop_rx).await?;
    println!("{report}");

    if report.total_requests() > 0 && report.total_failures() == report.total_requests() {
        return Err("every request failed".into());
    }
    Ok(())
}
