//! Driver binary - lifecycle-managed lidar node
//!
//! Usage:
//!   cargo run --bin lidar_driver -- --config config.toml
//!   cargo run --bin lidar_driver -- --hostname 10.5.5.87 --autostart
//!
//! The node starts Unconfigured and is driven by commands on the REP
//! socket (see `lidar_ctl`), unless `--autostart` is given.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use lidar_driver::common::cli::DriverArgs;
use lidar_driver::common::{run_command_task, setup_shutdown, LifecycleState};
use lidar_driver::config::Config;
use lidar_driver::driver::LidarDriver;
use lidar_driver::publisher::OutputTarget;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (logging)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lidar_driver=info".parse()?))
        .init();

    let args = DriverArgs::parse();

    let config_path = &args.common.config_file;
    let mut config = if Path::new(config_path).exists() {
        info!(config_file = %config_path, "Loaded configuration");
        Config::load(config_path)?
    } else {
        info!(config_file = %config_path, "Config file not found, using defaults");
        Config::default()
    };

    // CLI overrides
    if let Some(hostname) = args.hostname {
        config.sensor.hostname = Some(hostname);
    }
    if let Some(bind) = args.udp_bind {
        config.sensor.udp_bind = bind;
    }
    if let Some(addr) = args.command_address {
        config.channels.command = addr;
    }
    config.validate()?;

    let source = config.sensor.packet_source(&config.format);
    let provider = config.sensor.metadata_provider()?;
    let driver_config = config.driver_config(OutputTarget::Zmq(config.channels.outputs.clone()));
    let driver = Arc::new(LidarDriver::new(driver_config, source, provider));

    let (shutdown_tx, mut shutdown_rx) = setup_shutdown();

    let cmd_handle = tokio::spawn(run_command_task(
        config.channels.command.clone(),
        Arc::clone(&driver),
        shutdown_tx.subscribe(),
    ));

    if args.autostart {
        info!("Autostart: configuring and activating");
        if let Err(e) = driver.configure().await {
            warn!(error = %e, "Autostart configure failed");
        } else if let Err(e) = driver.activate().await {
            warn!(error = %e, "Autostart activate failed");
        }
    }

    println!(
        "Driver running. commands on {}, state {}",
        config.channels.command,
        driver.state()
    );
    println!("Press Ctrl+C to stop.");

    let mut state_rx = driver.subscribe();
    let mut status_ticker = interval(Duration::from_secs(10));
    let mut prev = driver.counters();
    let mut prev_at = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,

            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() == LifecycleState::Finalized {
                    info!("Driver finalized, exiting");
                    let _ = shutdown_tx.send(());
                    break;
                }
            }

            _ = status_ticker.tick() => {
                let now = driver.counters();
                let rate = now.rate_from(&prev, prev_at.elapsed().as_secs_f64());
                if driver.state() == LifecycleState::Active {
                    info!(
                        packets = now.packets,
                        frames = now.frames,
                        incomplete = now.incomplete_frames,
                        packet_rate = %format!("{:.1}", rate.packet_rate),
                        frame_rate = %format!("{:.2}", rate.frame_rate),
                        throughput = %rate.format_bytes_rate(),
                        "Status"
                    );
                }
                prev = now;
                prev_at = Instant::now();
            }
        }
    }

    driver.shutdown().await?;
    let _ = cmd_handle.await;

    println!("Driver stopped.");
    Ok(())
}
