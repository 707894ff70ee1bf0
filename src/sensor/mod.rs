//! Sensor-facing side of the driver
//!
//! - `format`: datagram layout and classification
//! - `source`: packet sources (UDP, replay)
//! - `metadata`: calibration fetch and cache

pub mod format;
pub mod metadata;
pub mod source;

use std::time::Duration;

pub use format::{encode_imu_packet, encode_lidar_packet, PacketFormat};
pub use metadata::{
    CachedMetadata, FileMetadata, MetadataError, MetadataProvider, MetadataStore, SensorMetadata,
    StaticMetadata, TcpMetadataClient, TimestampMode,
};
pub use source::{PacketSource, ReplaySource, ReplayStats, SourceError, UdpSource};

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on a single attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            timeout: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}
