//! Driver counters
//!
//! # Design Principles (KISS)
//! - Lock-free atomic counters for hot path (zero overhead on data path)
//! - Simple snapshot mechanism for reporting
//! - Per-packet and per-frame anomalies are only ever surfaced here

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated by the processing tick
///
/// All operations use Relaxed ordering. Statistics are eventually
/// consistent, which is acceptable for monitoring.
#[derive(Debug, Default)]
pub struct DriverCounters {
    /// Packets received from the source (any type)
    pub packets: AtomicU64,
    /// Bytes received from the source
    pub bytes: AtomicU64,
    /// Receive polls that timed out
    pub timeouts: AtomicU64,
    /// Packets rejected as too short
    pub too_short: AtomicU64,
    /// Packets rejected as malformed
    pub malformed: AtomicU64,
    /// Packets of unknown type
    pub unknown_packets: AtomicU64,
    /// Non-monotonic column timestamps seen inside a packet
    pub timestamp_regressions: AtomicU64,
    /// Columns dropped by the assembler (out of range or stale)
    pub dropped_columns: AtomicU64,
    /// Columns that overwrote an already filled slot
    pub duplicate_columns: AtomicU64,
    /// Frames converted and published
    pub frames: AtomicU64,
    /// Published frames that were missing columns
    pub incomplete_frames: AtomicU64,
    /// Total missing columns across published frames
    pub missing_columns: AtomicU64,
    /// IMU samples published
    pub imu_samples: AtomicU64,
    /// Publish failures
    pub publish_errors: AtomicU64,
}

impl DriverCounters {
    /// Create new zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_packets(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_too_short(&self) {
        self.too_short.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_unknown(&self) {
        self.unknown_packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_timestamp_regressions(&self, n: u64) {
        self.timestamp_regressions.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dropped_columns(&self) {
        self.dropped_columns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_duplicate_columns(&self, n: u64) {
        if n > 0 {
            self.duplicate_columns.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Record a published frame and its missing column count
    #[inline]
    pub fn record_frame(&self, missing: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if missing > 0 {
            self.incomplete_frames.fetch_add(1, Ordering::Relaxed);
            self.missing_columns
                .fetch_add(missing as u64, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn inc_imu(&self) {
        self.imu_samples.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_publish_errors(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Total decode anomalies (rejected packets plus dropped columns)
    pub fn decode_anomalies(&self) -> u64 {
        self.too_short.load(Ordering::Relaxed)
            + self.malformed.load(Ordering::Relaxed)
            + self.unknown_packets.load(Ordering::Relaxed)
            + self.dropped_columns.load(Ordering::Relaxed)
    }

    /// Take a snapshot of current values
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            too_short: self.too_short.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown_packets: self.unknown_packets.load(Ordering::Relaxed),
            timestamp_regressions: self.timestamp_regressions.load(Ordering::Relaxed),
            dropped_columns: self.dropped_columns.load(Ordering::Relaxed),
            duplicate_columns: self.duplicate_columns.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            incomplete_frames: self.incomplete_frames.load(Ordering::Relaxed),
            missing_columns: self.missing_columns.load(Ordering::Relaxed),
            imu_samples: self.imu_samples.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        for counter in [
            &self.packets,
            &self.bytes,
            &self.timeouts,
            &self.too_short,
            &self.malformed,
            &self.unknown_packets,
            &self.timestamp_regressions,
            &self.dropped_columns,
            &self.duplicate_columns,
            &self.frames,
            &self.incomplete_frames,
            &self.missing_columns,
            &self.imu_samples,
            &self.publish_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of counter values at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub timeouts: u64,
    pub too_short: u64,
    pub malformed: u64,
    pub unknown_packets: u64,
    pub timestamp_regressions: u64,
    pub dropped_columns: u64,
    pub duplicate_columns: u64,
    pub frames: u64,
    pub incomplete_frames: u64,
    pub missing_columns: u64,
    pub imu_samples: u64,
    pub publish_errors: u64,
}

impl CounterSnapshot {
    /// Calculate rate between two snapshots given elapsed seconds
    pub fn rate_from(&self, prev: &CounterSnapshot, elapsed_secs: f64) -> RateSnapshot {
        if elapsed_secs <= 0.0 {
            return RateSnapshot::default();
        }

        RateSnapshot {
            packet_rate: (self.packets.saturating_sub(prev.packets)) as f64 / elapsed_secs,
            frame_rate: (self.frames.saturating_sub(prev.frames)) as f64 / elapsed_secs,
            bytes_rate: (self.bytes.saturating_sub(prev.bytes)) as f64 / elapsed_secs,
        }
    }
}

/// Rate calculations from counter snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct RateSnapshot {
    /// Packets per second
    pub packet_rate: f64,
    /// Frames per second
    pub frame_rate: f64,
    /// Bytes per second
    pub bytes_rate: f64,
}

impl RateSnapshot {
    /// Format bytes rate as human-readable string (KB/s, MB/s, etc.)
    pub fn format_bytes_rate(&self) -> String {
        if self.bytes_rate >= 1_000_000_000.0 {
            format!("{:.2} GB/s", self.bytes_rate / 1_000_000_000.0)
        } else if self.bytes_rate >= 1_000_000.0 {
            format!("{:.2} MB/s", self.bytes_rate / 1_000_000.0)
        } else if self.bytes_rate >= 1_000.0 {
            format!("{:.2} KB/s", self.bytes_rate / 1_000.0)
        } else {
            format!("{:.0} B/s", self.bytes_rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_new() {
        let counters = DriverCounters::new();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_record_frame() {
        let counters = DriverCounters::new();
        counters.record_frame(0);
        counters.record_frame(16);

        let snap = counters.snapshot();
        assert_eq!(snap.frames, 2);
        assert_eq!(snap.incomplete_frames, 1);
        assert_eq!(snap.missing_columns, 16);
    }

    #[test]
    fn test_decode_anomalies() {
        let counters = DriverCounters::new();
        counters.inc_too_short();
        counters.inc_malformed();
        counters.inc_dropped_columns();
        counters.add_timestamp_regressions(3);
        counters.add_duplicate_columns(2);

        // Regressions and duplicates do not reject anything
        assert_eq!(counters.decode_anomalies(), 3);
        assert_eq!(counters.snapshot().duplicate_columns, 2);
    }

    #[test]
    fn test_reset() {
        let counters = DriverCounters::new();
        counters.inc_packets(1024);
        counters.inc_timeouts();
        counters.reset();

        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_rate_calculation() {
        let prev = CounterSnapshot {
            packets: 1000,
            frames: 10,
            bytes: 100_000,
            ..Default::default()
        };
        let current = CounterSnapshot {
            packets: 3560,
            frames: 30,
            bytes: 300_000,
            ..Default::default()
        };

        let rate = current.rate_from(&prev, 2.0);
        assert_eq!(rate.packet_rate, 1280.0);
        assert_eq!(rate.frame_rate, 10.0);
        assert_eq!(rate.bytes_rate, 100_000.0);
    }

    #[test]
    fn test_rate_zero_elapsed() {
        let current = CounterSnapshot {
            packets: 100,
            ..Default::default()
        };
        let rate = current.rate_from(&CounterSnapshot::default(), 0.0);
        assert_eq!(rate.packet_rate, 0.0);
    }

    #[test]
    fn test_format_bytes_rate() {
        let rate = RateSnapshot {
            bytes_rate: 500.0,
            ..Default::default()
        };
        assert_eq!(rate.format_bytes_rate(), "500 B/s");

        let rate = RateSnapshot {
            bytes_rate: 1_500_000.0,
            ..Default::default()
        };
        assert_eq!(rate.format_bytes_rate(), "1.50 MB/s");
    }
}
