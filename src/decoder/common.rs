//! Common types for decoder module

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Packet classification assigned by the source on receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    /// Lidar measurement columns
    Lidar,
    /// Inertial sample
    Imu,
    /// Unknown or invalid data
    Unknown,
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketType::Lidar => write!(f, "lidar"),
            PacketType::Imu => write!(f, "imu"),
            PacketType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Raw datagram from the sensor
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data: Bytes,
    /// Host receive time (Unix nanoseconds)
    pub received_at_ns: u64,
    pub packet_type: PacketType,
}

impl RawPacket {
    pub fn new(data: impl Into<Bytes>, received_at_ns: u64, packet_type: PacketType) -> Self {
        Self {
            data: data.into(),
            received_at_ns,
            packet_type,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One beam measurement inside a column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelSample {
    /// Range in millimetres (0 = no return)
    pub range_mm: u32,
    /// Signal photons, published as intensity
    pub signal: u16,
    pub reflectivity: u16,
    /// Ambient / noise photons
    pub noise: u16,
    pub valid: bool,
}

/// One azimuth column of a revolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedColumn {
    /// Acquisition timestamp from the sensor clock
    pub timestamp_ns: u64,
    /// Column position within the revolution
    pub measurement_id: u16,
    /// Revolution counter (wraps at u16::MAX)
    pub frame_id: u16,
    pub encoder_count: u32,
    /// Column status word was valid
    pub valid: bool,
    /// One sample per beam, ordered by beam index
    pub pixels: Vec<PixelSample>,
}

/// Inertial sample in sensor units (g, deg/s)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub sys_timestamp_ns: u64,
    pub accel_timestamp_ns: u64,
    pub gyro_timestamp_ns: u64,
    /// Linear acceleration in g
    pub acceleration: [f32; 3],
    /// Angular velocity in degrees per second
    pub angular_velocity: [f32; 3],
}

/// Decoded packet payload
#[derive(Debug, Clone, PartialEq)]
pub enum PacketContent {
    Lidar {
        columns: Vec<DecodedColumn>,
        /// Columns whose timestamp went backwards relative to the previous one
        timestamp_regressions: u32,
    },
    Imu(ImuSample),
}
