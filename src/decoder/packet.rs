//! Lidar / IMU packet decoder
//!
//! Validates one raw datagram against the packet format and the fetched
//! metadata and parses it into columns or an IMU sample. Decoding holds no
//! state between packets.

use thiserror::Error;

use super::common::{DecodedColumn, ImuSample, PacketContent, PacketType, PixelSample, RawPacket};
use crate::sensor::format::{
    PacketFormat, COLUMN_HEADER_LEN, COLUMN_STATUS_INVALID, COLUMN_STATUS_VALID, IMU_PACKET_LEN,
    PACKET_HEADER_LEN, PIXEL_BLOCK_LEN, RANGE_MASK,
};
use crate::sensor::SensorMetadata;

/// Packet-level decode failures
///
/// A failure rejects the whole packet. The driver counts it and moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("malformed column: {0}")]
    MalformedColumn(String),

    #[error("unknown packet type (header 0x{0:04x})")]
    UnknownPacketType(u16),
}

/// Packet decoder
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    format: PacketFormat,
}

impl PacketDecoder {
    pub fn new(format: PacketFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &PacketFormat {
        &self.format
    }

    /// Decode one datagram
    pub fn decode(
        &self,
        raw: &RawPacket,
        meta: &SensorMetadata,
    ) -> Result<PacketContent, DecodeError> {
        match raw.packet_type {
            PacketType::Lidar => self.decode_lidar(&raw.data, meta),
            PacketType::Imu => decode_imu(&raw.data),
            PacketType::Unknown => Err(DecodeError::UnknownPacketType(read_u16(&raw.data, 0))),
        }
    }

    fn decode_lidar(&self, data: &[u8], meta: &SensorMetadata) -> Result<PacketContent, DecodeError> {
        let beams = meta.beam_count();
        let expected = self.format.lidar_packet_len(beams);
        if data.len() < expected {
            return Err(DecodeError::TooShort {
                expected,
                actual: data.len(),
            });
        }

        let declared_columns = read_u16(data, 2) as usize;
        let declared_pixels = read_u16(data, 4) as usize;
        if declared_pixels != beams {
            return Err(DecodeError::MalformedColumn(format!(
                "{declared_pixels} pixels per column, sensor has {beams} beams"
            )));
        }
        if declared_columns != self.format.columns_per_packet as usize {
            return Err(DecodeError::MalformedColumn(format!(
                "{declared_columns} columns in packet, format expects {}",
                self.format.columns_per_packet
            )));
        }

        let column_len = PacketFormat::column_len(beams);
        let mut columns = Vec::with_capacity(declared_columns);
        let mut regressions = 0;
        let mut last_ts: Option<u64> = None;

        for index in 0..declared_columns {
            let column = decode_column(&data[PACKET_HEADER_LEN + index * column_len..], beams)
                .map_err(|reason| DecodeError::MalformedColumn(format!("column {index}: {reason}")))?;

            if let Some(prev) = last_ts {
                if column.timestamp_ns < prev {
                    regressions += 1;
                }
            }
            last_ts = Some(column.timestamp_ns);
            columns.push(column);
        }

        Ok(PacketContent::Lidar {
            columns,
            timestamp_regressions: regressions,
        })
    }
}

/// Parse one column; `data` starts at the column header
fn decode_column(data: &[u8], beams: usize) -> Result<DecodedColumn, String> {
    let status_offset = COLUMN_HEADER_LEN + beams * PIXEL_BLOCK_LEN;
    let status = read_u32(data, status_offset);
    let valid = match status {
        COLUMN_STATUS_VALID => true,
        COLUMN_STATUS_INVALID => false,
        other => return Err(format!("bad status word 0x{other:08x}")),
    };

    let pixels = (0..beams)
        .map(|i| {
            let offset = COLUMN_HEADER_LEN + i * PIXEL_BLOCK_LEN;
            let range_mm = read_u32(data, offset) & RANGE_MASK;
            PixelSample {
                range_mm,
                reflectivity: read_u16(data, offset + 4),
                signal: read_u16(data, offset + 6),
                noise: read_u16(data, offset + 8),
                valid: valid && range_mm != 0,
            }
        })
        .collect();

    Ok(DecodedColumn {
        timestamp_ns: read_u64(data, 0),
        measurement_id: read_u16(data, 8),
        frame_id: read_u16(data, 10),
        encoder_count: read_u32(data, 12),
        valid,
        pixels,
    })
}

fn decode_imu(data: &[u8]) -> Result<PacketContent, DecodeError> {
    if data.len() < IMU_PACKET_LEN {
        return Err(DecodeError::TooShort {
            expected: IMU_PACKET_LEN,
            actual: data.len(),
        });
    }

    Ok(PacketContent::Imu(ImuSample {
        sys_timestamp_ns: read_u64(data, 0),
        accel_timestamp_ns: read_u64(data, 8),
        gyro_timestamp_ns: read_u64(data, 16),
        acceleration: [read_f32(data, 24), read_f32(data, 28), read_f32(data, 32)],
        angular_velocity: [read_f32(data, 36), read_f32(data, 40), read_f32(data, 44)],
    }))
}

// Readers below assume the caller has checked the length. Out-of-range
// reads yield zero rather than panicking.

#[inline]
fn read_u16(data: &[u8], offset: usize) -> u16 {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .unwrap_or(0)
}

#[inline]
fn read_u32(data: &[u8], offset: usize) -> u32 {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

#[inline]
fn read_u64(data: &[u8], offset: usize) -> u64 {
    data.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

#[inline]
fn read_f32(data: &[u8], offset: usize) -> f32 {
    f32::from_bits(read_u32(data, offset))
}
