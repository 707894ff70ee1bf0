//! Configuration module for the lidar driver
//!
//! Everything is loaded from one TOML file. Every section is optional and
//! falls back to defaults suitable for a sensor on the local network.
//!
//! # Example
//! ```ignore
//! let config = Config::load("config.toml")?;
//! config.validate()?;
//! let source = config.sensor.packet_source(&config.format);
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::driver::DriverConfig;
use crate::emulator::EmulatorConfig;
use crate::publisher::{OutputChannels, OutputTarget};
use crate::sensor::{
    FileMetadata, MetadataProvider, PacketFormat, PacketSource, RetryPolicy, TcpMetadataClient,
    UdpSource,
};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub format: PacketFormat,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Reject values the driver cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.format.columns_per_packet == 0 || self.format.pixels_per_column == 0 {
            return Err(ConfigError::Invalid(
                "format.columns_per_packet and format.pixels_per_column must be > 0".to_string(),
            ));
        }
        if self.processing.tick_interval_ms == 0 || self.processing.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "processing intervals must be > 0".to_string(),
            ));
        }
        if self.processing.max_packets_per_tick == 0 {
            return Err(ConfigError::Invalid(
                "processing.max_packets_per_tick must be > 0".to_string(),
            ));
        }
        if self.retry.connect_attempts == 0 || self.retry.metadata_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry attempts must be > 0".to_string(),
            ));
        }
        if self.sensor.hostname.is_none() && self.sensor.metadata_file.is_none() {
            return Err(ConfigError::Invalid(
                "either sensor.hostname or sensor.metadata_file is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Driver settings with the given output target
    pub fn driver_config(&self, output: OutputTarget) -> DriverConfig {
        DriverConfig {
            format: self.format.clone(),
            tick_interval: Duration::from_millis(self.processing.tick_interval_ms),
            poll_timeout: Duration::from_millis(self.processing.poll_timeout_ms),
            max_packets_per_tick: self.processing.max_packets_per_tick,
            connect_retry: self.retry.connect_policy(),
            metadata_retry: self.retry.metadata_policy(),
            output,
        }
    }
}

// =============================================================================
// Sensor
// =============================================================================

/// Sensor endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// Sensor address; used for the metadata port and to filter datagrams
    #[serde(default)]
    pub hostname: Option<String>,

    /// Local UDP bind address for lidar and IMU datagrams
    #[serde(default = "default_udp_bind")]
    pub udp_bind: String,

    /// Sensor TCP configuration port
    #[serde(default = "default_metadata_port")]
    pub metadata_port: u16,

    /// Read metadata from a JSON file instead of the sensor (replay)
    #[serde(default)]
    pub metadata_file: Option<PathBuf>,
}

fn default_udp_bind() -> String {
    "0.0.0.0:7502".to_string()
}

fn default_metadata_port() -> u16 {
    7501
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            udp_bind: default_udp_bind(),
            metadata_port: default_metadata_port(),
            metadata_file: None,
        }
    }
}

impl SensorConfig {
    /// Metadata provider: the file when configured, otherwise the sensor
    pub fn metadata_provider(&self) -> Result<Arc<dyn MetadataProvider>, ConfigError> {
        if let Some(path) = &self.metadata_file {
            return Ok(Arc::new(FileMetadata::new(path)));
        }
        match &self.hostname {
            Some(host) => Ok(Arc::new(TcpMetadataClient::new(format!(
                "{}:{}",
                host, self.metadata_port
            )))),
            None => Err(ConfigError::Invalid(
                "no metadata source configured".to_string(),
            )),
        }
    }

    /// UDP packet source
    ///
    /// Datagrams are filtered on the sensor address only when `hostname`
    /// is a literal IP address.
    pub fn packet_source(&self, format: &PacketFormat) -> Box<dyn PacketSource> {
        let source = UdpSource::new(&self.udp_bind, format.clone());
        match self.hostname.as_deref().and_then(|h| h.parse::<IpAddr>().ok()) {
            Some(ip) => Box::new(source.with_sensor_host(ip)),
            None => Box::new(source),
        }
    }
}

// =============================================================================
// Processing
// =============================================================================

/// Processing tick settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Period of the processing tick
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Bound on one receive call
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Packets drained per tick at most
    #[serde(default = "default_max_packets_per_tick")]
    pub max_packets_per_tick: usize,
}

fn default_tick_interval_ms() -> u64 {
    5
}

fn default_poll_timeout_ms() -> u64 {
    10
}

fn default_max_packets_per_tick() -> usize {
    512
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_packets_per_tick: default_max_packets_per_tick(),
        }
    }
}

/// Retry settings for connecting and fetching metadata
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_metadata_attempts")]
    pub metadata_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Bound on one metadata request
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_metadata_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_metadata_timeout_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            metadata_attempts: default_metadata_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
        }
    }
}

impl RetryConfig {
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            timeout: Duration::from_millis(self.metadata_timeout_ms),
        }
    }

    pub fn metadata_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.metadata_attempts,
            ..self.connect_policy()
        }
    }
}

// =============================================================================
// Channels
// =============================================================================

/// Command and output channel addresses
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// ZMQ REP bind address for commands
    #[serde(default = "default_command_address")]
    pub command: String,

    #[serde(flatten)]
    pub outputs: OutputChannels,
}

fn default_command_address() -> String {
    "tcp://*:5560".to_string()
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            command: default_command_address(),
            outputs: OutputChannels::default(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
[sensor]
hostname = "192.168.1.20"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.sensor.hostname.as_deref(), Some("192.168.1.20"));
        assert_eq!(config.sensor.udp_bind, "0.0.0.0:7502");
        assert_eq!(config.format, PacketFormat::default());
        assert_eq!(config.processing.max_packets_per_tick, 512);
        assert_eq!(config.channels.command, "tcp://*:5560");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[sensor]
hostname = "os1-992005000123.local"
udp_bind = "0.0.0.0:7600"
metadata_port = 7601

[format]
columns_per_packet = 16
pixels_per_column = 32

[processing]
tick_interval_ms = 2
poll_timeout_ms = 4
max_packets_per_tick = 128

[retry]
connect_attempts = 4
metadata_attempts = 6
initial_backoff_ms = 50
max_backoff_ms = 400
metadata_timeout_ms = 250

[channels]
command = "tcp://*:6000"
points = { name = "os1/points", address = "tcp://*:6001" }
imu = { name = "os1/imu", address = "tcp://*:6005" }
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.sensor.metadata_port, 7601);
        assert_eq!(config.format.pixels_per_column, 32);
        assert_eq!(config.processing.tick_interval_ms, 2);
        assert_eq!(config.channels.command, "tcp://*:6000");
        assert_eq!(config.channels.outputs.points.name, "os1/points");
        assert_eq!(config.channels.outputs.imu.address, "tcp://*:6005");
        assert_eq!(config.channels.outputs.noise_image.name, "noise_image");

        let metadata = config.retry.metadata_policy();
        assert_eq!(metadata.attempts, 6);
        assert_eq!(metadata.initial_backoff, Duration::from_millis(50));
        assert_eq!(config.retry.connect_policy().attempts, 4);

        let driver = config.driver_config(OutputTarget::Zmq(config.channels.outputs.clone()));
        assert_eq!(driver.poll_timeout, Duration::from_millis(4));
        assert_eq!(driver.max_packets_per_tick, 128);
    }

    #[test]
    fn validate_requires_metadata_source() {
        let config = Config::from_toml("").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(config.sensor.metadata_provider().is_err());
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let toml = r#"
[sensor]
metadata_file = "meta.json"

[processing]
poll_timeout_ms = 0
"#;
        let config = Config::from_toml(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn metadata_file_takes_precedence() {
        let toml = r#"
[sensor]
hostname = "10.0.0.2"
metadata_file = "replay/meta.json"
"#;
        let config = Config::from_toml(toml).unwrap();
        let provider = config.sensor.metadata_provider().unwrap();
        assert_eq!(provider.describe(), "file://replay/meta.json");
    }

    #[test]
    fn tcp_provider_uses_metadata_port() {
        let toml = r#"
[sensor]
hostname = "10.0.0.2"
"#;
        let config = Config::from_toml(toml).unwrap();
        let provider = config.sensor.metadata_provider().unwrap();
        assert_eq!(provider.describe(), "tcp://10.0.0.2:7501");

        let source = config.sensor.packet_source(&config.format);
        assert_eq!(source.describe(), "udp://0.0.0.0:7502");
    }

    #[test]
    fn unknown_file_is_io_error() {
        let result = Config::load("/nonexistent/lidar.toml");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }
}
