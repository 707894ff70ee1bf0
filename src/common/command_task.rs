//! Command task for ZMQ REP socket handling
//!
//! Binds a REP socket, decodes JSON [`Command`]s, runs them against the
//! driver and replies with a JSON [`CommandResponse`]. Commands are handled
//! one at a time; the driver's own lock serializes them against the
//! processing tick.

use std::sync::Arc;

use tmq::{request_reply, Context};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::command::{Command, CommandResponse};
use crate::driver::LidarDriver;

/// Serve controller commands until shutdown
///
/// # Arguments
/// * `command_address` - ZMQ address to bind (e.g., "tcp://*:5560")
/// * `driver` - Driver the commands are applied to
/// * `shutdown` - Broadcast receiver for shutdown signals
pub async fn run_command_task(
    command_address: String,
    driver: Arc<LidarDriver>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let context = Context::new();

    let receiver = match request_reply::reply(&context).bind(&command_address) {
        Ok(r) => r,
        Err(e) => {
            warn!(
                error = %e,
                address = %command_address,
                "Failed to bind command socket"
            );
            return;
        }
    };

    info!(address = %command_address, "Command task started");

    let mut current_receiver = receiver;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("Command task received shutdown signal");
                break;
            }

            recv_result = current_receiver.recv() => {
                match recv_result {
                    Ok((mut multipart, sender)) => {
                        let response = match multipart.pop_front() {
                            Some(frame) => dispatch(&driver, &frame).await,
                            None => CommandResponse::error(driver.state(), "Empty message"),
                        };

                        let resp_bytes = match response.to_json() {
                            Ok(b) => b,
                            Err(e) => {
                                warn!(error = %e, "Failed to serialize response");
                                break;
                            }
                        };

                        let resp_msg: tmq::Multipart =
                            vec![tmq::Message::from(resp_bytes.as_slice())].into();

                        match sender.send(resp_msg).await {
                            Ok(next_receiver) => {
                                current_receiver = next_receiver;
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to send response");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Command receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("Command task stopped");
}

/// Decode one request frame and run it
pub async fn dispatch(driver: &LidarDriver, frame: &[u8]) -> CommandResponse {
    match Command::from_json(frame) {
        Ok(cmd) => {
            info!(command = %cmd, "Received command");
            let response = driver.handle_command(cmd).await;
            if !response.success {
                warn!(state = %response.state, message = %response.message, "Command failed");
            }
            response
        }
        Err(e) => {
            warn!(error = %e, "Invalid command");
            CommandResponse::error(driver.state(), format!("Invalid command: {}", e))
        }
    }
}
