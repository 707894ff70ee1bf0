//! Sensor emulator - generates a synthetic lidar packet stream for testing
//!
//! Emulates a spinning sensor inside a rectangular room:
//! - UDP: lidar packets at the rotation rate, plus IMU packets
//! - TCP: a metadata endpoint answering `get_metadata` with one JSON line
//!
//! Architecture:
//! - Main task: paces and sends packets until shutdown
//! - Metadata task: accepts connections and replies with the metadata

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::common::now_ns;
use crate::decoder::{DecodedColumn, ImuSample, PixelSample};
use crate::sensor::metadata::METADATA_REQUEST;
use crate::sensor::{encode_imu_packet, encode_lidar_packet, SensorMetadata, TimestampMode};

/// Encoder ticks per revolution
const ENCODER_TICKS_PER_REV: u32 = 90_112;

/// Azimuth offsets (degrees) of the four beam columns of the staggered layout
const AZIMUTH_PATTERN: [f64; 4] = [4.2, 1.4, -1.4, -4.2];

/// Room half-extents (mm)
const ROOM_HALF_X_MM: f64 = 10_000.0;
const ROOM_HALF_Y_MM: f64 = 6_000.0;

/// Emulator configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// UDP destination of the packet stream (the driver's bind address)
    pub target: String,
    /// TCP bind address of the metadata endpoint
    pub metadata_bind: String,
    pub serial: String,
    pub columns_per_revolution: u32,
    pub columns_per_packet: u16,
    pub beams: u16,
    /// Revolutions per second
    pub rotation_hz: f64,
    /// IMU samples per second (0 = disabled)
    pub imu_rate_hz: f64,
    /// Fraction of lidar packets silently dropped
    pub drop_ratio: f64,
    /// Standard deviation of range noise (mm)
    pub range_noise_mm: f64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            target: "127.0.0.1:7502".to_string(),
            metadata_bind: "127.0.0.1:7501".to_string(),
            serial: "992000000001".to_string(),
            columns_per_revolution: 1024,
            columns_per_packet: 16,
            beams: 64,
            rotation_hz: 10.0,
            imu_rate_hz: 100.0,
            drop_ratio: 0.0,
            range_noise_mm: 15.0,
        }
    }
}

impl EmulatorConfig {
    pub fn validate(&self) -> Result<(), EmulatorError> {
        if self.beams == 0 || self.columns_per_packet == 0 {
            return Err(EmulatorError::Config(
                "beams and columns_per_packet must be > 0".to_string(),
            ));
        }
        if self.columns_per_revolution == 0 || self.columns_per_revolution > u16::MAX as u32 + 1 {
            return Err(EmulatorError::Config(format!(
                "columns_per_revolution out of range: {}",
                self.columns_per_revolution
            )));
        }
        if self.rotation_hz <= 0.0 || self.imu_rate_hz < 0.0 {
            return Err(EmulatorError::Config(
                "rotation_hz must be > 0 and imu_rate_hz >= 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.drop_ratio) {
            return Err(EmulatorError::Config(format!(
                "drop_ratio must be within [0, 1], got {}",
                self.drop_ratio
            )));
        }
        if self.range_noise_mm < 0.0 {
            return Err(EmulatorError::Config("range_noise_mm must be >= 0".to_string()));
        }
        Ok(())
    }

    /// Interval between lidar packets
    pub fn packet_interval(&self) -> Duration {
        let packets_per_sec = self.rotation_hz * self.columns_per_revolution as f64
            / self.columns_per_packet as f64;
        Duration::from_secs_f64(1.0 / packets_per_sec)
    }

    fn column_period_ns(&self) -> u64 {
        (1e9 / (self.rotation_hz * self.columns_per_revolution as f64)) as u64
    }
}

/// Emulator errors
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid emulator configuration: {0}")]
    Config(String),
}

/// Metadata describing the emulated sensor
///
/// Altitudes are spread evenly over ±16.6°, azimuths follow the four-column
/// stagger and the destagger shift of each row is its azimuth offset
/// expressed in columns.
pub fn synthetic_metadata(config: &EmulatorConfig) -> SensorMetadata {
    let n = config.beams as usize;
    let width = config.columns_per_revolution as f64;

    let beam_altitude_angles = (0..n)
        .map(|i| {
            if n == 1 {
                0.0
            } else {
                16.6 - 33.2 * i as f64 / (n - 1) as f64
            }
        })
        .collect();
    let beam_azimuth_angles: Vec<f64> = (0..n).map(|i| AZIMUTH_PATTERN[i % 4]).collect();
    let pixel_shift_by_row = beam_azimuth_angles
        .iter()
        .map(|az| (az * width / 360.0).round() as i32)
        .collect();

    SensorMetadata {
        serial: config.serial.clone(),
        firmware: format!("emulator-{}", env!("CARGO_PKG_VERSION")),
        lidar_mode: format!("{}x{}", config.columns_per_revolution, config.rotation_hz.round()),
        timestamp_mode: TimestampMode::TimeFromInternalOsc,
        columns_per_revolution: config.columns_per_revolution,
        columns_per_packet: config.columns_per_packet,
        beam_altitude_angles,
        beam_azimuth_angles,
        pixel_shift_by_row,
        lidar_origin_to_beam_origin_mm: 15.806,
    }
}

/// Produces encoded sensor datagrams
///
/// Deterministic for a given seed and start time.
pub struct PacketGenerator {
    config: EmulatorConfig,
    metadata: SensorMetadata,
    rng: StdRng,
    noise: Normal<f64>,
    start_ns: u64,
    /// Columns emitted since start
    column_counter: u64,
    imu_counter: u64,
}

impl PacketGenerator {
    pub fn new(config: EmulatorConfig, seed: u64, start_ns: u64) -> Result<Self, EmulatorError> {
        config.validate()?;
        let noise = Normal::new(0.0, config.range_noise_mm)
            .map_err(|e| EmulatorError::Config(format!("range noise: {}", e)))?;
        Ok(Self {
            metadata: synthetic_metadata(&config),
            config,
            rng: StdRng::seed_from_u64(seed),
            noise,
            start_ns,
            column_counter: 0,
            imu_counter: 0,
        })
    }

    pub fn metadata(&self) -> &SensorMetadata {
        &self.metadata
    }

    /// Frame id of the next column to be generated
    pub fn frame_id(&self) -> u16 {
        (self.column_counter / self.config.columns_per_revolution as u64) as u16
    }

    /// Generate the next lidar packet
    ///
    /// Returns `None` when the packet is dropped; its columns are consumed
    /// either way, like a datagram lost on the wire.
    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        let columns: Vec<DecodedColumn> = (0..self.config.columns_per_packet)
            .map(|_| self.next_column())
            .collect();

        if self.config.drop_ratio > 0.0 && self.rng.gen_bool(self.config.drop_ratio) {
            return None;
        }
        Some(encode_lidar_packet(&columns))
    }

    /// Generate the next IMU packet (sensor at rest, level)
    pub fn next_imu_packet(&mut self) -> Vec<u8> {
        let period_ns = if self.config.imu_rate_hz > 0.0 {
            (1e9 / self.config.imu_rate_hz) as u64
        } else {
            0
        };
        let ts = self.start_ns + self.imu_counter * period_ns;
        self.imu_counter += 1;

        let jitter = |rng: &mut StdRng| rng.gen_range(-0.002f32..0.002);
        let sample = ImuSample {
            sys_timestamp_ns: ts,
            accel_timestamp_ns: ts,
            gyro_timestamp_ns: ts,
            acceleration: [jitter(&mut self.rng), jitter(&mut self.rng), 1.0 + jitter(&mut self.rng)],
            angular_velocity: [
                jitter(&mut self.rng),
                jitter(&mut self.rng),
                jitter(&mut self.rng),
            ],
        };
        encode_imu_packet(&sample)
    }

    fn next_column(&mut self) -> DecodedColumn {
        let width = self.config.columns_per_revolution as u64;
        let measurement_id = (self.column_counter % width) as u16;
        let frame_id = (self.column_counter / width) as u16;
        let timestamp_ns = self.start_ns + self.column_counter * self.config.column_period_ns();
        self.column_counter += 1;

        let encoder_count =
            (measurement_id as u64 * ENCODER_TICKS_PER_REV as u64 / width) as u32;
        let heading = 2.0 * std::f64::consts::PI * measurement_id as f64 / width as f64;

        let pixels = (0..self.metadata.beam_count())
            .map(|beam| self.pixel(beam, heading))
            .collect();

        DecodedColumn {
            timestamp_ns,
            measurement_id,
            frame_id,
            encoder_count,
            valid: true,
            pixels,
        }
    }

    fn pixel(&mut self, beam: usize, heading: f64) -> PixelSample {
        let azimuth = heading - self.metadata.beam_azimuth_angles[beam].to_radians();
        let altitude = self.metadata.beam_altitude_angles[beam].to_radians();

        // Distance to the nearest wall along the horizontal direction
        let (sin, cos) = azimuth.sin_cos();
        let to_x = if cos.abs() > 1e-9 { ROOM_HALF_X_MM / cos.abs() } else { f64::MAX };
        let to_y = if sin.abs() > 1e-9 { ROOM_HALF_Y_MM / sin.abs() } else { f64::MAX };
        let horizontal = to_x.min(to_y);
        let range = horizontal / altitude.cos().max(0.05) + self.noise.sample(&mut self.rng);
        let range_mm = range.clamp(0.0, 0x000F_FFFF as f64) as u32;

        let signal = (4000.0 * 1_000_000.0 / (range * range).max(1_000_000.0)) as u16;
        PixelSample {
            range_mm,
            signal: signal.max(1),
            reflectivity: 40 + (beam % 8) as u16 * 10,
            noise: self.rng.gen_range(0..32),
            valid: true,
        }
    }
}

/// Answer metadata requests until shutdown
///
/// Each connection sends one request line and receives one JSON line.
pub async fn serve_metadata(
    listener: TcpListener,
    metadata: Arc<SensorMetadata>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!(address = %addr, "Metadata endpoint listening");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let metadata = Arc::clone(&metadata);
                    tokio::spawn(async move {
                        if let Err(e) = answer_metadata(stream, &metadata).await {
                            warn!(peer = %peer, error = %e, "Metadata request failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Metadata accept failed");
                }
            }
        }
    }

    info!("Metadata endpoint stopped");
}

async fn answer_metadata(stream: TcpStream, metadata: &SensorMetadata) -> Result<(), EmulatorError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    if line.trim_end() != METADATA_REQUEST.trim_end() {
        write_half.write_all(b"error: unknown request\n").await?;
        return Ok(());
    }

    let mut reply = metadata.to_json()?;
    reply.push('\n');
    write_half.write_all(reply.as_bytes()).await?;
    debug!(bytes = reply.len(), "Metadata served");
    Ok(())
}

/// Emulated sensor
pub struct Emulator {
    config: EmulatorConfig,
    generator: PacketGenerator,
    packets_sent: u64,
    packets_dropped: u64,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Result<Self, EmulatorError> {
        let generator = PacketGenerator::new(config.clone(), rand::random(), now_ns())?;
        Ok(Self {
            config,
            generator,
            packets_sent: 0,
            packets_dropped: 0,
        })
    }

    pub fn metadata(&self) -> &SensorMetadata {
        self.generator.metadata()
    }

    /// Serve metadata and stream packets until shutdown
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), EmulatorError> {
        let listener = TcpListener::bind(&self.config.metadata_bind).await?;
        let metadata = Arc::new(self.generator.metadata().clone());
        let meta_handle = tokio::spawn(serve_metadata(listener, metadata, shutdown.resubscribe()));

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.config.target).await?;

        let mut packet_ticker = interval(self.config.packet_interval());
        packet_ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let use_imu = self.config.imu_rate_hz > 0.0;
        let mut imu_ticker = interval(Duration::from_secs_f64(
            1.0 / self.config.imu_rate_hz.max(1.0),
        ));
        let mut report_ticker = interval(Duration::from_secs(5));

        info!(
            target = %self.config.target,
            mode = %self.generator.metadata().lidar_mode,
            beams = self.config.beams,
            packet_interval_us = self.config.packet_interval().as_micros() as u64,
            "Emulator streaming"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Emulator received shutdown signal");
                    break;
                }

                _ = packet_ticker.tick() => {
                    match self.generator.next_packet() {
                        Some(packet) => {
                            // Nobody listening is not an error for a sensor
                            if let Err(e) = socket.send(&packet).await {
                                debug!(error = %e, "Lidar packet not delivered");
                            }
                            self.packets_sent += 1;
                        }
                        None => self.packets_dropped += 1,
                    }
                }

                _ = imu_ticker.tick(), if use_imu => {
                    let packet = self.generator.next_imu_packet();
                    if let Err(e) = socket.send(&packet).await {
                        debug!(error = %e, "IMU packet not delivered");
                    }
                }

                _ = report_ticker.tick() => {
                    info!(
                        frame_id = self.generator.frame_id(),
                        sent = self.packets_sent,
                        dropped = self.packets_dropped,
                        "Emulator progress"
                    );
                }
            }
        }

        let _ = meta_handle.await;
        info!(sent = self.packets_sent, dropped = self.packets_dropped, "Emulator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{PacketContent, PacketDecoder, PacketType, RawPacket};
    use crate::sensor::{MetadataProvider, PacketFormat, TcpMetadataClient};

    fn small_config() -> EmulatorConfig {
        EmulatorConfig {
            columns_per_revolution: 64,
            columns_per_packet: 16,
            beams: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_synthetic_metadata_is_valid() {
        let meta = synthetic_metadata(&EmulatorConfig::default());
        meta.validate().unwrap();
        assert_eq!(meta.beam_count(), 64);
        assert_eq!(meta.lidar_mode, "1024x10");
        assert_eq!(&meta.pixel_shift_by_row[..4], &[12, 4, -4, -12]);
        assert!((meta.beam_altitude_angles[0] - 16.6).abs() < 1e-9);
        assert!((meta.beam_altitude_angles[63] + 16.6).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EmulatorConfig {
            drop_ratio: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EmulatorError::Config(_))));

        let config = EmulatorConfig {
            beams: 0,
            ..Default::default()
        };
        assert!(PacketGenerator::new(config, 0, 0).is_err());
    }

    #[test]
    fn test_packet_interval() {
        // 1024 columns x 10 Hz / 16 columns per packet = 640 packets/s
        let interval = EmulatorConfig::default().packet_interval();
        assert_eq!(interval.as_nanos(), 1_562_500);
    }

    #[test]
    fn test_generated_packets_decode() {
        let config = small_config();
        let mut gen = PacketGenerator::new(config, 7, 1_000_000).unwrap();
        let meta = gen.metadata().clone();
        let decoder = PacketDecoder::new(PacketFormat::new(16, 8));

        let mut seen = Vec::new();
        for _ in 0..5 {
            let data = gen.next_packet().unwrap();
            let raw = RawPacket::new(data, 0, PacketType::Lidar);
            match decoder.decode(&raw, &meta).unwrap() {
                PacketContent::Lidar {
                    columns,
                    timestamp_regressions,
                } => {
                    assert_eq!(timestamp_regressions, 0);
                    assert!(columns.iter().all(|c| c.valid));
                    seen.extend(columns.iter().map(|c| (c.frame_id, c.measurement_id)));
                }
                other => panic!("expected lidar content, got {:?}", other),
            }
        }

        assert_eq!(seen[0], (0, 0));
        assert_eq!(seen[63], (0, 63));
        // Fifth packet starts the next revolution
        assert_eq!(seen[64], (1, 0));
        assert_eq!(gen.frame_id(), 1);
    }

    #[test]
    fn test_ranges_are_plausible() {
        let config = EmulatorConfig {
            range_noise_mm: 0.0,
            ..small_config()
        };
        let mut gen = PacketGenerator::new(config, 1, 0).unwrap();
        let column = gen.next_column();
        // Facing +x, the near wall is 10 m away; beams tilt away from level
        for px in &column.pixels {
            assert!(px.range_mm >= 10_000);
            assert!(px.range_mm < 12_000);
            assert!(px.signal > 0);
        }
    }

    #[test]
    fn test_drop_ratio_one_drops_everything() {
        let config = EmulatorConfig {
            drop_ratio: 1.0,
            ..small_config()
        };
        let mut gen = PacketGenerator::new(config, 3, 0).unwrap();
        assert!((0..8).all(|_| gen.next_packet().is_none()));
        // Dropped columns still advance the rotation
        assert_eq!(gen.frame_id(), 2);
    }

    #[test]
    fn test_imu_packet_shape() {
        let mut gen = PacketGenerator::new(small_config(), 0, 5_000).unwrap();
        let data = gen.next_imu_packet();
        assert_eq!(PacketFormat::default().classify(&data), PacketType::Imu);
    }

    #[tokio::test]
    async fn test_metadata_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let meta = Arc::new(synthetic_metadata(&small_config()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(serve_metadata(listener, Arc::clone(&meta), shutdown_rx));

        let client = TcpMetadataClient::new(addr.to_string());
        let fetched = client.fetch_once(Duration::from_secs(2)).await.unwrap();
        assert_eq!(fetched, *meta);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
