//! Simulator binary: load the catalogue, boot, run until Ctrl+C.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pal_common::config::SimConfig;
use pal_sim::Simulator;

#[derive(Debug, Parser)]
#[command(name = "pal_sim", about = "Power & Light ICS simulator")]
struct Args {
    /// Path to the simulation catalogue (TOML).
    config: PathBuf,

    /// Override the catalogue's port offset (unprivileged port remapping).
    #[arg(long)]
    port_offset: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut cfg = SimConfig::load(&args.config)?;
    if let Some(offset) = args.port_offset {
        cfg.port_offset = offset;
    }

    let mut sim = Simulator::boot(cfg).await?;
    info!("simulator running, Ctrl+C to stop");

    tokio::select! {
        _ = sim.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for shutdown signal");
            } else {
                info!("shutdown signal received");
            }
        }
    }

    sim.shutdown().await;

    let summary = sim.summary();
    info!(
        devices = summary.devices_total,
        online = summary.devices_online,
        sim_time = summary.sim_time,
        cycles = summary.cycles,
        "final state"
    );
    Ok(())
}
