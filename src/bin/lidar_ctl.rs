//! Controller CLI - sends commands to a running lidar driver
//!
//! Usage:
//!   cargo run --bin lidar_ctl -- -c Configure
//!   cargo run --bin lidar_ctl -- -c Activate
//!   cargo run --bin lidar_ctl -- -c GetMetadata
//!   cargo run --bin lidar_ctl -- -a tcp://10.0.0.3:5560 -c Error --reason "maintenance"

use std::time::Duration;

use anyhow::{anyhow, Context as _};
use clap::Parser;
use lidar_driver::common::cli::ControllerArgs;
use lidar_driver::common::{Command, CommandResponse};
use tmq::{request_reply, Context};

const COMMANDS: &str = "Configure, Activate, Deactivate, Cleanup, Error, ClearError, \
                        Shutdown, Reset, GetMetadata, GetStatus";

fn print_response(response: &CommandResponse) {
    println!();
    println!("Response:");
    println!("  Success: {}", response.success);
    println!("  State:   {}", response.state);
    println!("  Message: {}", response.message);

    if let Some(meta) = &response.metadata {
        println!("  Sensor:");
        println!("    Serial:    {}", meta.serial);
        println!("    Firmware:  {}", meta.firmware);
        println!("    Mode:      {}", meta.lidar_mode);
        println!("    Timestamp: {:?}", meta.timestamp_mode);
        println!(
            "    Geometry:  {} beams x {} columns ({} per packet)",
            meta.beam_count(),
            meta.columns_per_revolution,
            meta.columns_per_packet
        );
    }

    if let Some(c) = &response.counters {
        println!("  Counters:");
        println!("    Packets:   {} ({} bytes)", c.packets, c.bytes);
        println!(
            "    Frames:    {} ({} incomplete, {} missing columns)",
            c.frames, c.incomplete_frames, c.missing_columns
        );
        println!("    IMU:       {}", c.imu_samples);
        println!(
            "    Anomalies: {} short, {} malformed, {} unknown, {} dropped columns, {} ts regressions",
            c.too_short, c.malformed, c.unknown_packets, c.dropped_columns, c.timestamp_regressions
        );
        println!("    Duplicate columns: {}", c.duplicate_columns);
        println!("    Timeouts:  {}", c.timeouts);
        println!("    Publish errors: {}", c.publish_errors);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ControllerArgs::parse();

    let command = Command::from_name(&args.command, args.reason.clone())
        .ok_or_else(|| anyhow!("Unknown command '{}'. Use one of: {}", args.command, COMMANDS))?;

    println!("Sending {} to {}", command, args.address);

    // Create REQ socket and connect
    let context = Context::new();
    let requester = request_reply::request(&context).connect(&args.address)?;

    let cmd_bytes = command.to_json()?;
    let msg: tmq::Multipart = vec![tmq::Message::from(cmd_bytes.as_slice())].into();

    let exchange = async {
        let responder = requester.send(msg).await?;
        let (response_msg, _) = responder.recv().await?;
        Ok::<_, tmq::TmqError>(response_msg)
    };
    let mut response_msg = tokio::time::timeout(Duration::from_secs(args.timeout), exchange)
        .await
        .map_err(|_| anyhow!("No reply from {} within {}s", args.address, args.timeout))??;

    let frame = response_msg
        .pop_front()
        .ok_or_else(|| anyhow!("Empty response received"))?;
    let response = CommandResponse::from_json(&frame).context("Malformed response")?;
    print_response(&response);

    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}
