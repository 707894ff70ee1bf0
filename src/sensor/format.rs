//! Packet format description
//!
//! The byte layout of sensor datagrams is a per-model contract. The layout
//! handled here is parameterised by [`PacketFormat`] (columns per packet,
//! pixels per column), supplied at configuration time.
//!
//! # Lidar packet (little endian)
//! ```text
//! ┌──────────────────────────── packet header (8 B) ─────────────────────────┐
//! │ packet_type:u16 (=1) │ columns:u16 │ pixels_per_column:u16 │ reserved:u16 │
//! └──────────────────────────────────────────────────────────────────────────┘
//! repeated `columns` times:
//! ┌──────────────────────────── column header (16 B) ────────────────────────┐
//! │ timestamp_ns:u64 │ measurement_id:u16 │ frame_id:u16 │ encoder_count:u32 │
//! ├──────────────────────────── pixel block (12 B) × N ──────────────────────┤
//! │ range:u32 (low 20 bits, mm) │ reflectivity:u16 │ signal:u16 │ noise:u16 │ reserved:u16 │
//! ├──────────────────────────── status (4 B) ────────────────────────────────┤
//! │ 0xFFFF_FFFF valid, 0 invalid                                              │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # IMU packet (48 B)
//! ```text
//! sys_ts:u64 │ accel_ts:u64 │ gyro_ts:u64 │ accel xyz:f32×3 (g) │ gyro xyz:f32×3 (deg/s)
//! ```

use bytes::BufMut;
use serde::Deserialize;

use crate::decoder::{DecodedColumn, ImuSample, PacketType};

pub const LIDAR_PACKET_TYPE: u16 = 0x0001;
pub const PACKET_HEADER_LEN: usize = 8;
pub const COLUMN_HEADER_LEN: usize = 16;
pub const PIXEL_BLOCK_LEN: usize = 12;
pub const COLUMN_STATUS_LEN: usize = 4;
pub const COLUMN_STATUS_VALID: u32 = 0xFFFF_FFFF;
pub const COLUMN_STATUS_INVALID: u32 = 0;
pub const RANGE_MASK: u32 = 0x000F_FFFF;
pub const IMU_PACKET_LEN: usize = 48;

/// Configuration-time packet layout parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PacketFormat {
    /// Columns carried by one lidar packet
    #[serde(default = "default_columns_per_packet")]
    pub columns_per_packet: u16,
    /// Beams per column; must equal the sensor's beam count
    #[serde(default = "default_pixels_per_column")]
    pub pixels_per_column: u16,
    /// Receive buffer size in bytes
    #[serde(default = "default_max_packet_len")]
    pub max_packet_len: usize,
}

fn default_columns_per_packet() -> u16 {
    16
}

fn default_pixels_per_column() -> u16 {
    64
}

fn default_max_packet_len() -> usize {
    65_536
}

impl Default for PacketFormat {
    fn default() -> Self {
        Self {
            columns_per_packet: default_columns_per_packet(),
            pixels_per_column: default_pixels_per_column(),
            max_packet_len: default_max_packet_len(),
        }
    }
}

impl PacketFormat {
    pub fn new(columns_per_packet: u16, pixels_per_column: u16) -> Self {
        Self {
            columns_per_packet,
            pixels_per_column,
            ..Default::default()
        }
    }

    /// Length of one column for `beams` pixels
    pub fn column_len(beams: usize) -> usize {
        COLUMN_HEADER_LEN + beams * PIXEL_BLOCK_LEN + COLUMN_STATUS_LEN
    }

    /// Length of a full lidar packet for `beams` pixels per column
    pub fn lidar_packet_len(&self, beams: usize) -> usize {
        PACKET_HEADER_LEN + self.columns_per_packet as usize * Self::column_len(beams)
    }

    /// Classify a datagram by size and header
    pub fn classify(&self, data: &[u8]) -> PacketType {
        if data.len() == IMU_PACKET_LEN {
            PacketType::Imu
        } else if data.len() >= 2 && u16::from_le_bytes([data[0], data[1]]) == LIDAR_PACKET_TYPE {
            PacketType::Lidar
        } else {
            PacketType::Unknown
        }
    }
}

/// Encode lidar columns into one packet
///
/// The pixel count is taken from the first column; every column is written
/// with that many pixel blocks (missing pixels are zero-filled).
pub fn encode_lidar_packet(columns: &[DecodedColumn]) -> Vec<u8> {
    let beams = columns.first().map(|c| c.pixels.len()).unwrap_or(0);
    let mut buf =
        Vec::with_capacity(PACKET_HEADER_LEN + columns.len() * PacketFormat::column_len(beams));

    buf.put_u16_le(LIDAR_PACKET_TYPE);
    buf.put_u16_le(columns.len() as u16);
    buf.put_u16_le(beams as u16);
    buf.put_u16_le(0);

    for column in columns {
        buf.put_u64_le(column.timestamp_ns);
        buf.put_u16_le(column.measurement_id);
        buf.put_u16_le(column.frame_id);
        buf.put_u32_le(column.encoder_count);
        for i in 0..beams {
            let px = column.pixels.get(i).copied().unwrap_or_default();
            buf.put_u32_le(px.range_mm & RANGE_MASK);
            buf.put_u16_le(px.reflectivity);
            buf.put_u16_le(px.signal);
            buf.put_u16_le(px.noise);
            buf.put_u16_le(0);
        }
        buf.put_u32_le(if column.valid {
            COLUMN_STATUS_VALID
        } else {
            COLUMN_STATUS_INVALID
        });
    }

    buf
}

/// Encode one IMU sample
pub fn encode_imu_packet(sample: &ImuSample) -> Vec<u8> {
    let mut buf = Vec::with_capacity(IMU_PACKET_LEN);
    buf.put_u64_le(sample.sys_timestamp_ns);
    buf.put_u64_le(sample.accel_timestamp_ns);
    buf.put_u64_le(sample.gyro_timestamp_ns);
    for v in sample.acceleration {
        buf.put_f32_le(v);
    }
    for v in sample.angular_velocity {
        buf.put_f32_le(v);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::PixelSample;

    fn column(measurement_id: u16, beams: usize) -> DecodedColumn {
        DecodedColumn {
            timestamp_ns: 1_000,
            measurement_id,
            frame_id: 7,
            encoder_count: 0,
            valid: true,
            pixels: vec![PixelSample::default(); beams],
        }
    }

    #[test]
    fn packet_lengths() {
        let format = PacketFormat::new(16, 64);
        assert_eq!(PacketFormat::column_len(64), 16 + 64 * 12 + 4);
        assert_eq!(format.lidar_packet_len(64), 8 + 16 * 788);
    }

    #[test]
    fn encoded_lidar_packet_has_declared_length() {
        let format = PacketFormat::new(4, 32);
        let columns: Vec<_> = (0..4).map(|i| column(i, 32)).collect();
        let bytes = encode_lidar_packet(&columns);

        assert_eq!(bytes.len(), format.lidar_packet_len(32));
        assert_eq!(format.classify(&bytes), PacketType::Lidar);
    }

    #[test]
    fn classify_by_size_and_header() {
        let format = PacketFormat::default();
        assert_eq!(
            format.classify(&encode_imu_packet(&ImuSample::default())),
            PacketType::Imu
        );
        assert_eq!(format.classify(&[0x02, 0x00, 0x00]), PacketType::Unknown);
        assert_eq!(format.classify(&[]), PacketType::Unknown);
    }

    #[test]
    fn defaults_from_empty_toml() {
        let format: PacketFormat = toml::from_str("").unwrap();
        assert_eq!(format, PacketFormat::default());
    }
}
