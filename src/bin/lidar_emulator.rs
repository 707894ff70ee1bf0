//! Emulator binary - streams synthetic lidar packets over UDP
//!
//! Usage:
//!   cargo run --bin lidar_emulator                              # Use defaults
//!   cargo run --bin lidar_emulator -- --config config.toml      # [emulator] section
//!   cargo run --bin lidar_emulator -- --target 10.0.0.2:7502

use std::path::Path;

use clap::Parser;
use lidar_driver::common::cli::EmulatorArgs;
use lidar_driver::common::setup_shutdown;
use lidar_driver::config::Config;
use lidar_driver::emulator::{Emulator, EmulatorConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (logging)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lidar_driver=info".parse()?))
        .init();

    let args = EmulatorArgs::parse();

    let config_path = &args.common.config_file;
    let mut emulator_config = if Path::new(config_path).exists() {
        info!(config_file = %config_path, "Loaded configuration");
        Config::load(config_path)?.emulator
    } else {
        EmulatorConfig::default()
    };

    if let Some(target) = args.target {
        emulator_config.target = target;
    }
    if let Some(bind) = args.metadata_bind {
        emulator_config.metadata_bind = bind;
    }

    let mut emulator = Emulator::new(emulator_config.clone())?;

    println!(
        "Emulator running. serial={}, streaming to {}, metadata on {}",
        emulator.metadata().serial,
        emulator_config.target,
        emulator_config.metadata_bind
    );
    println!("Press Ctrl+C to stop.");

    let (_shutdown_tx, shutdown_rx) = setup_shutdown();
    emulator.run(shutdown_rx).await?;

    println!("Emulator stopped.");
    Ok(())
}
