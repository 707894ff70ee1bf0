//! Product converter
//!
//! Turns an assembled revolution into an organised point cloud and three
//! destaggered images (range, intensity, noise), and an IMU sample into an
//! IMU message in SI units.
//!
//! Every product has the full W × N shape regardless of how many columns
//! arrived. Samples that are missing or invalid are written as zeros.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::assembler::AssembledFrame;
use crate::decoder::ImuSample;
use crate::sensor::{SensorMetadata, TimestampMode};

/// Standard gravity (m/s² per g)
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// One point of the organised cloud
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Metres
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub intensity: u16,
    pub reflectivity: u16,
    pub noise: u16,
    /// Beam index
    pub ring: u16,
    pub range_mm: u32,
    /// Column time relative to the frame timestamp (ns)
    pub t_ns: u32,
}

/// Organised point cloud, row-major (beam, column), unshifted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub frame_id: u16,
    pub timestamp_ns: u64,
    /// Columns per revolution
    pub width: u32,
    /// Beams
    pub height: u32,
    pub missing_columns: u32,
    pub points: Vec<Point>,
}

impl PointCloud {
    pub fn point(&self, beam: usize, column: usize) -> Option<&Point> {
        self.points.get(beam * self.width as usize + column)
    }
}

/// Row-major image with one row per beam
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image<T> {
    pub frame_id: u16,
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub missing_columns: u32,
    pub data: Vec<T>,
}

impl<T: Copy> Image<T> {
    pub fn pixel(&self, row: usize, column: usize) -> Option<T> {
        self.row(row)?.get(column).copied()
    }

    /// One image row, or `None` past the last beam
    pub fn row(&self, row: usize) -> Option<&[T]> {
        let w = self.width as usize;
        self.data.get(row * w..(row + 1) * w)
    }
}

/// Everything produced from one revolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Products {
    pub point_cloud: PointCloud,
    /// Range in millimetres
    pub range_image: Image<u32>,
    /// Signal photons
    pub intensity_image: Image<u16>,
    pub noise_image: Image<u16>,
}

impl Products {
    pub fn frame_id(&self) -> u16 {
        self.point_cloud.frame_id
    }

    pub fn missing_columns(&self) -> u32 {
        self.point_cloud.missing_columns
    }
}

/// IMU sample in SI units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuMessage {
    pub timestamp_ns: u64,
    /// m/s²
    pub linear_acceleration: [f64; 3],
    /// rad/s
    pub angular_velocity: [f64; 3],
}

/// Circularly shift one row right by `shift` (negative shifts left)
pub fn shift_row<T>(row: &mut [T], shift: i32) {
    if row.is_empty() {
        return;
    }
    let by = (shift as i64).rem_euclid(row.len() as i64) as usize;
    row.rotate_right(by);
}

/// Apply the per-row shift table to a row-major image
pub fn destagger<T>(data: &mut [T], width: usize, shifts: &[i32]) {
    if width == 0 {
        return;
    }
    for (row, shift) in data.chunks_mut(width).zip(shifts) {
        shift_row(row, *shift);
    }
}

/// Header fields shared by the three images of one frame
#[derive(Debug, Clone, Copy)]
struct ImageShape {
    frame_id: u16,
    timestamp_ns: u64,
    width: u32,
    height: u32,
    missing_columns: u32,
}

impl ImageShape {
    fn image<T>(&self, data: Vec<T>) -> Image<T> {
        Image {
            frame_id: self.frame_id,
            timestamp_ns: self.timestamp_ns,
            width: self.width,
            height: self.height,
            missing_columns: self.missing_columns,
            data,
        }
    }
}

/// Trigonometry derived from metadata, rebuilt when the metadata changes
#[derive(Debug)]
struct Geometry {
    width: usize,
    altitude_deg: Vec<f64>,
    azimuth_deg: Vec<f64>,
    beam_offset_m: f64,
    /// cos/sin of the encoder angle of each column
    column_cos: Vec<f64>,
    column_sin: Vec<f64>,
    /// cos/sin of each beam's altitude and azimuth offset
    alt_cos: Vec<f64>,
    alt_sin: Vec<f64>,
    az_cos: Vec<f64>,
    az_sin: Vec<f64>,
}

impl Geometry {
    fn new(meta: &SensorMetadata) -> Self {
        let width = meta.width();
        let column_angle =
            |c: usize| 2.0 * std::f64::consts::PI * c as f64 / width.max(1) as f64;

        Self {
            width,
            altitude_deg: meta.beam_altitude_angles.clone(),
            azimuth_deg: meta.beam_azimuth_angles.clone(),
            beam_offset_m: meta.lidar_origin_to_beam_origin_mm / 1000.0,
            column_cos: (0..width).map(|c| column_angle(c).cos()).collect(),
            column_sin: (0..width).map(|c| column_angle(c).sin()).collect(),
            alt_cos: meta.beam_altitude_angles.iter().map(|a| a.to_radians().cos()).collect(),
            alt_sin: meta.beam_altitude_angles.iter().map(|a| a.to_radians().sin()).collect(),
            az_cos: meta.beam_azimuth_angles.iter().map(|a| a.to_radians().cos()).collect(),
            az_sin: meta.beam_azimuth_angles.iter().map(|a| a.to_radians().sin()).collect(),
        }
    }

    fn matches(&self, meta: &SensorMetadata) -> bool {
        self.width == meta.width()
            && self.altitude_deg == meta.beam_altitude_angles
            && self.azimuth_deg == meta.beam_azimuth_angles
            && self.beam_offset_m == meta.lidar_origin_to_beam_origin_mm / 1000.0
    }

    /// Cartesian position of beam `i` at column `c` for range `r` (metres)
    #[inline]
    fn project(&self, i: usize, c: usize, r: f64) -> [f64; 3] {
        let n = self.beam_offset_m;
        let (cos_c, sin_c) = (self.column_cos[c], self.column_sin[c]);
        // Azimuth = column angle + beam offset
        let cos_az = cos_c * self.az_cos[i] - sin_c * self.az_sin[i];
        let sin_az = sin_c * self.az_cos[i] + cos_c * self.az_sin[i];
        let d = r - n;
        [
            d * self.alt_cos[i] * cos_az + n * cos_c,
            d * self.alt_cos[i] * sin_az + n * sin_c,
            d * self.alt_sin[i],
        ]
    }
}

/// Frame and IMU product converter
#[derive(Debug, Default)]
pub struct ProductConverter {
    geometry: Option<Geometry>,
}

impl ProductConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert one revolution
    pub fn convert(&mut self, frame: &AssembledFrame, meta: &SensorMetadata) -> Products {
        if !self.geometry.as_ref().is_some_and(|g| g.matches(meta)) {
            trace!(width = meta.width(), beams = meta.beam_count(), "Rebuilding geometry tables");
            self.geometry = None;
        }
        let geometry = self.geometry.get_or_insert_with(|| Geometry::new(meta));

        let width = meta.width();
        let beams = meta.beam_count();
        let missing = frame.missing_columns() as u32;

        let timestamp_ns = match meta.timestamp_mode {
            TimestampMode::TimeFromHost => frame.received_at_ns,
            _ => frame
                .columns
                .iter()
                .flatten()
                .find(|c| c.valid)
                .map(|c| c.timestamp_ns)
                .unwrap_or(frame.received_at_ns),
        };

        let mut points = vec![Point::default(); width * beams];
        let mut range = vec![0u32; width * beams];
        let mut intensity = vec![0u16; width * beams];
        let mut noise = vec![0u16; width * beams];

        for (c, slot) in frame.columns.iter().enumerate().take(width) {
            let Some(column) = slot else { continue };
            if !column.valid {
                continue;
            }
            let t_ns = column.timestamp_ns.saturating_sub(timestamp_ns).min(u32::MAX as u64) as u32;

            for (i, px) in column.pixels.iter().enumerate().take(beams) {
                if !px.valid || px.range_mm == 0 {
                    continue;
                }
                let idx = i * width + c;
                let [x, y, z] = geometry.project(i, c, px.range_mm as f64 / 1000.0);
                points[idx] = Point {
                    x: x as f32,
                    y: y as f32,
                    z: z as f32,
                    intensity: px.signal,
                    reflectivity: px.reflectivity,
                    noise: px.noise,
                    ring: i as u16,
                    range_mm: px.range_mm,
                    t_ns,
                };
                range[idx] = px.range_mm;
                intensity[idx] = px.signal;
                noise[idx] = px.noise;
            }
        }

        // Identical shift for all three images
        destagger(&mut range, width, &meta.pixel_shift_by_row);
        destagger(&mut intensity, width, &meta.pixel_shift_by_row);
        destagger(&mut noise, width, &meta.pixel_shift_by_row);

        let shape = ImageShape {
            frame_id: frame.frame_id,
            timestamp_ns,
            width: width as u32,
            height: beams as u32,
            missing_columns: missing,
        };

        Products {
            point_cloud: PointCloud {
                frame_id: frame.frame_id,
                timestamp_ns,
                width: width as u32,
                height: beams as u32,
                missing_columns: missing,
                points,
            },
            range_image: shape.image(range),
            intensity_image: shape.image(intensity),
            noise_image: shape.image(noise),
        }
    }

    /// Convert one IMU sample to SI units
    pub fn convert_imu(
        &self,
        sample: &ImuSample,
        received_at_ns: u64,
        meta: &SensorMetadata,
    ) -> ImuMessage {
        let timestamp_ns = match meta.timestamp_mode {
            TimestampMode::TimeFromHost => received_at_ns,
            _ => sample.accel_timestamp_ns,
        };
        ImuMessage {
            timestamp_ns,
            linear_acceleration: sample.acceleration.map(|a| a as f64 * STANDARD_GRAVITY),
            angular_velocity: sample.angular_velocity.map(|w| (w as f64).to_radians()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodedColumn, PixelSample};
    use crate::sensor::metadata::tests::sample_metadata;

    const EPS: f32 = 1e-4;

    fn pixel(range_mm: u32, value: u16) -> PixelSample {
        PixelSample {
            range_mm,
            signal: value,
            reflectivity: value,
            noise: value,
            valid: range_mm != 0,
        }
    }

    fn full_frame(meta: &SensorMetadata, range_mm: u32) -> AssembledFrame {
        let columns = (0..meta.width())
            .map(|c| {
                Some(DecodedColumn {
                    timestamp_ns: 1_000_000 + c as u64 * 100,
                    measurement_id: c as u16,
                    frame_id: 4,
                    encoder_count: 0,
                    valid: true,
                    pixels: (0..meta.beam_count())
                        .map(|i| pixel(range_mm, (i * 100 + c) as u16))
                        .collect(),
                })
            })
            .collect();
        AssembledFrame {
            frame_id: 4,
            columns,
            received_at_ns: 5_000_000,
        }
    }

    fn flat_metadata() -> SensorMetadata {
        SensorMetadata {
            beam_altitude_angles: vec![0.0; 4],
            beam_azimuth_angles: vec![0.0; 4],
            pixel_shift_by_row: vec![0; 4],
            ..sample_metadata()
        }
    }

    #[test]
    fn test_shift_row() {
        let mut row = [1, 2, 3, 4, 5];
        shift_row(&mut row, 2);
        assert_eq!(row, [4, 5, 1, 2, 3]);
        shift_row(&mut row, -2);
        assert_eq!(row, [1, 2, 3, 4, 5]);
        shift_row(&mut row, 5);
        assert_eq!(row, [1, 2, 3, 4, 5]);
        shift_row(&mut row, -7);
        assert_eq!(row, [3, 4, 5, 1, 2]);
    }

    #[test]
    fn test_shift_by_width_is_identity() {
        let original: Vec<u32> = (0..16).collect();
        let mut data = original.clone();
        destagger(&mut data, 4, &[4, -4, 8, 0]);
        assert_eq!(data, original);
    }

    #[test]
    fn test_complementary_shift_restores_rows() {
        const W: usize = 8;
        let shifts = [3, -2, 0, 7];
        let original: Vec<u32> = (0..(W * shifts.len()) as u32).collect();
        let mut staggered = original.clone();
        destagger(&mut staggered, W, &shifts);
        let image = Image {
            frame_id: 0,
            timestamp_ns: 0,
            width: W as u32,
            height: shifts.len() as u32,
            missing_columns: 0,
            data: staggered,
        };

        for row in 0..shifts.len() {
            let staggered_row = image.row(row).unwrap();
            for s in -(W as i32)..(2 * W as i32) {
                let mut shifted = staggered_row.to_vec();
                shift_row(&mut shifted, s);
                shift_row(&mut shifted, W as i32 - s);
                assert_eq!(shifted, staggered_row, "row {row}, shift {s}");
            }
        }
        assert!(image.row(shifts.len()).is_none());
        assert_eq!(image.pixel(0, W), None);
        assert_eq!(image.pixel(1, 0), Some(original[W + 2]));
    }

    #[test]
    fn test_spherical_projection_without_offset() {
        let meta = flat_metadata();
        let mut converter = ProductConverter::new();
        let products = converter.convert(&full_frame(&meta, 2000), &meta);

        // Column 0 points along +x, column 2 of 8 along +y
        let p0 = products.point_cloud.point(0, 0).unwrap();
        assert!((p0.x - 2.0).abs() < EPS && p0.y.abs() < EPS && p0.z.abs() < EPS);
        let p2 = products.point_cloud.point(1, 2).unwrap();
        assert!(p2.x.abs() < EPS && (p2.y - 2.0).abs() < EPS);
        assert_eq!(p2.ring, 1);
    }

    #[test]
    fn test_altitude_gives_elevation() {
        let meta = SensorMetadata {
            beam_altitude_angles: vec![30.0, 0.0, 0.0, -30.0],
            ..flat_metadata()
        };
        let products = ProductConverter::new().convert(&full_frame(&meta, 1000), &meta);

        let top = products.point_cloud.point(0, 0).unwrap();
        assert!((top.z - 0.5).abs() < EPS);
        assert!((top.x - 0.866_025).abs() < EPS);
        let bottom = products.point_cloud.point(3, 0).unwrap();
        assert!((bottom.z + 0.5).abs() < EPS);
    }

    #[test]
    fn test_beam_origin_offset() {
        let meta = SensorMetadata {
            beam_altitude_angles: vec![90.0, 0.0, 0.0, 0.0],
            lidar_origin_to_beam_origin_mm: 100.0,
            ..flat_metadata()
        };
        let products = ProductConverter::new().convert(&full_frame(&meta, 1100), &meta);

        // Straight up: the horizontal offset remains, z is range minus offset
        let p = products.point_cloud.point(0, 0).unwrap();
        assert!((p.x - 0.1).abs() < EPS);
        assert!((p.z - 1.0).abs() < EPS);

        // Horizontal beam: offset and range add along the same ray
        let q = products.point_cloud.point(1, 0).unwrap();
        assert!((q.x - 1.1).abs() < EPS);
    }

    #[test]
    fn test_images_share_shift_and_cloud_is_unshifted() {
        let meta = sample_metadata(); // shifts [1, 0, 0, -1], width 8
        let products = ProductConverter::new().convert(&full_frame(&meta, 1000), &meta);

        // Row 0 shifted right by one: pixel at column 1 came from column 0
        assert_eq!(products.intensity_image.pixel(0, 1), Some(0));
        assert_eq!(products.noise_image.pixel(0, 1), Some(0));
        // Row 3 shifted left by one: pixel at column 0 came from column 1
        assert_eq!(products.intensity_image.pixel(3, 0), Some(301));
        assert_eq!(products.noise_image.pixel(3, 0), Some(301));

        assert_eq!(products.point_cloud.point(0, 1).unwrap().intensity, 1);
    }

    #[test]
    fn test_missing_columns_become_sentinels() {
        let meta = sample_metadata();
        let mut frame = full_frame(&meta, 1000);
        frame.columns[5] = None;
        frame.columns[6].as_mut().unwrap().valid = false;

        let products = ProductConverter::new().convert(&frame, &meta);

        assert_eq!(products.missing_columns(), 1);
        assert_eq!(products.range_image.missing_columns, 1);
        assert_eq!(products.point_cloud.points.len(), 8 * 4);
        assert_eq!(products.range_image.data.len(), 8 * 4);
        for beam in 0..4 {
            assert_eq!(*products.point_cloud.point(beam, 5).unwrap(), Point::default());
            assert_eq!(*products.point_cloud.point(beam, 6).unwrap(), Point::default());
        }
        // Row 1 is unshifted
        assert_eq!(products.range_image.pixel(1, 5), Some(0));
        assert_eq!(products.range_image.pixel(1, 4), Some(1000));
    }

    #[test]
    fn test_timestamp_modes() {
        let mut meta = sample_metadata();
        let mut frame = full_frame(&meta, 1000);
        frame.columns[0] = None;

        let products = ProductConverter::new().convert(&frame, &meta);
        assert_eq!(products.point_cloud.timestamp_ns, 1_000_100);
        assert_eq!(products.point_cloud.point(0, 3).unwrap().t_ns, 200);

        meta.timestamp_mode = TimestampMode::TimeFromHost;
        let products = ProductConverter::new().convert(&frame, &meta);
        assert_eq!(products.point_cloud.timestamp_ns, 5_000_000);
        assert_eq!(products.noise_image.timestamp_ns, 5_000_000);
    }

    #[test]
    fn test_geometry_rebuilt_on_metadata_change() {
        let mut converter = ProductConverter::new();
        let meta = flat_metadata();
        converter.convert(&full_frame(&meta, 1000), &meta);

        let raised = SensorMetadata {
            beam_altitude_angles: vec![90.0; 4],
            ..flat_metadata()
        };
        let products = converter.convert(&full_frame(&raised, 1000), &raised);
        assert!((products.point_cloud.point(0, 0).unwrap().z - 1.0).abs() < EPS);
    }

    #[test]
    fn test_imu_units() {
        let converter = ProductConverter::new();
        let sample = ImuSample {
            sys_timestamp_ns: 1,
            accel_timestamp_ns: 2,
            gyro_timestamp_ns: 3,
            acceleration: [0.0, 0.0, 1.0],
            angular_velocity: [180.0, 0.0, -90.0],
        };

        let msg = converter.convert_imu(&sample, 99, &sample_metadata());
        assert_eq!(msg.timestamp_ns, 2);
        assert!((msg.linear_acceleration[2] - STANDARD_GRAVITY).abs() < 1e-9);
        assert!((msg.angular_velocity[0] - std::f64::consts::PI).abs() < 1e-6);
        assert!((msg.angular_velocity[2] + std::f64::consts::FRAC_PI_2).abs() < 1e-6);

        let host = SensorMetadata {
            timestamp_mode: TimestampMode::TimeFromHost,
            ..sample_metadata()
        };
        assert_eq!(converter.convert_imu(&sample, 99, &host).timestamp_ns, 99);
    }
}
