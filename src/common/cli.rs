//! CLI argument parsing for the driver binaries
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Common arguments shared via composition, not inheritance
//! - Each binary has its own Args struct that embeds CommonArgs

use clap::Parser;

/// Common arguments shared across all binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "config.toml")]
    pub config_file: String,
}

/// Arguments for the driver
#[derive(Parser, Debug, Clone)]
pub struct DriverArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Override sensor hostname or IP
    #[arg(long, env = "LIDAR_HOSTNAME")]
    pub hostname: Option<String>,

    /// Override UDP bind address (e.g., 0.0.0.0:7502)
    #[arg(long = "udp-bind")]
    pub udp_bind: Option<String>,

    /// Override command socket address (e.g., tcp://*:5560)
    #[arg(short = 'c', long = "command")]
    pub command_address: Option<String>,

    /// Configure and activate immediately instead of waiting for commands
    #[arg(long)]
    pub autostart: bool,
}

/// Arguments for the sensor emulator
#[derive(Parser, Debug, Clone)]
pub struct EmulatorArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Override UDP destination (e.g., 127.0.0.1:7502)
    #[arg(short = 't', long = "target")]
    pub target: Option<String>,

    /// Override metadata TCP bind address
    #[arg(long = "metadata-bind")]
    pub metadata_bind: Option<String>,
}

/// Arguments for Controller (CLI control client)
#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Driver command address (e.g., tcp://localhost:5560)
    #[arg(short, long, default_value = "tcp://localhost:5560")]
    pub address: String,

    /// Command to send (e.g., Configure, Activate, Reset, GetMetadata)
    #[arg(short, long)]
    pub command: String,

    /// Reason (for the Error command)
    #[arg(long)]
    pub reason: Option<String>,

    /// Seconds to wait for a reply
    #[arg(long, default_value = "5")]
    pub timeout: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_args_default() {
        let args = CommonArgs::try_parse_from(["test"]).unwrap();
        assert_eq!(args.config_file, "config.toml");
    }

    #[test]
    fn test_common_args_long_config() {
        let args = CommonArgs::try_parse_from(["test", "--config", "os1.toml"]).unwrap();
        assert_eq!(args.config_file, "os1.toml");
    }

    #[test]
    fn test_driver_args_default() {
        let args = DriverArgs::try_parse_from(["test"]).unwrap();
        assert_eq!(args.common.config_file, "config.toml");
        assert_eq!(args.udp_bind, None);
        assert_eq!(args.command_address, None);
        assert!(!args.autostart);
    }

    #[test]
    fn test_driver_args_full() {
        let args = DriverArgs::try_parse_from([
            "test",
            "-f",
            "os1.toml",
            "--hostname",
            "10.5.5.87",
            "--udp-bind",
            "0.0.0.0:7600",
            "-c",
            "tcp://*:6000",
            "--autostart",
        ])
        .unwrap();
        assert_eq!(args.common.config_file, "os1.toml");
        assert_eq!(args.hostname.as_deref(), Some("10.5.5.87"));
        assert_eq!(args.udp_bind.as_deref(), Some("0.0.0.0:7600"));
        assert_eq!(args.command_address.as_deref(), Some("tcp://*:6000"));
        assert!(args.autostart);
    }

    #[test]
    fn test_emulator_args() {
        let args = EmulatorArgs::try_parse_from(["test", "-t", "127.0.0.1:7502"]).unwrap();
        assert_eq!(args.target.as_deref(), Some("127.0.0.1:7502"));
        assert_eq!(args.metadata_bind, None);
    }

    #[test]
    fn test_controller_args() {
        let args = ControllerArgs::try_parse_from(["test", "-c", "GetStatus"]).unwrap();
        assert_eq!(args.address, "tcp://localhost:5560");
        assert_eq!(args.command, "GetStatus");
        assert_eq!(args.reason, None);
        assert_eq!(args.timeout, 5);
    }

    #[test]
    fn test_controller_args_error_reason() {
        let args = ControllerArgs::try_parse_from([
            "test",
            "-a",
            "tcp://10.0.0.3:5560",
            "-c",
            "Error",
            "--reason",
            "maintenance",
        ])
        .unwrap();
        assert_eq!(args.address, "tcp://10.0.0.3:5560");
        assert_eq!(args.reason.as_deref(), Some("maintenance"));
    }
}
