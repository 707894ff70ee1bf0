//! Common types shared across the driver
//!
//! Lifecycle states and controller commands, the shared lifecycle state,
//! error types, counters and the command/shutdown plumbing used by the
//! binaries.

pub mod cli;

pub mod command;
pub use command::{Command, CommandResponse, LifecycleState, Transition};

pub mod state;
pub use state::LifecycleSharedState;

pub mod error;
pub use error::{DriverError, DriverResult};

pub mod metrics;
pub use metrics::{CounterSnapshot, DriverCounters, RateSnapshot};

pub mod shutdown;
pub use shutdown::{setup_shutdown, ShutdownReceiver, ShutdownSender};

// ZMQ REP socket handling
pub mod command_task;
pub use command_task::run_command_task;

/// Wall-clock time as nanoseconds since the Unix epoch
pub fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_advances() {
        let a = now_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = now_ns();
        assert!(b > a);
        // Sanity: after 2020-01-01
        assert!(a > 1_577_836_800_000_000_000);
    }
}
