//! Decoder module for lidar sensor datagrams
//!
//! Converts raw UDP payloads into decoded columns and IMU samples.

pub mod common;
pub mod packet;

pub use common::{
    DecodedColumn, ImuSample, PacketContent, PacketType, PixelSample, RawPacket,
};
pub use packet::{DecodeError, PacketDecoder};
