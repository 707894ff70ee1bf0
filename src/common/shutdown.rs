//! Ctrl+C shutdown handling for the driver binaries

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shutdown channel sender
pub type ShutdownSender = broadcast::Sender<()>;

/// Shutdown channel receiver
pub type ShutdownReceiver = broadcast::Receiver<()>;

/// Setup shutdown handling with Ctrl+C signal
///
/// Creates a broadcast channel and spawns a task that sends on Ctrl+C.
/// The sender is returned so callers can trigger shutdown themselves
/// (e.g. when the driver reaches Finalized through a Shutdown command).
///
/// # Example
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = setup_shutdown();
/// node.run(shutdown_tx, shutdown_rx).await?;
/// ```
pub fn setup_shutdown() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = broadcast::channel::<()>(1);

    let tx_clone = tx.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, initiating shutdown"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
        let _ = tx_clone.send(());
    });

    (tx, rx)
}
