//! Sensor metadata (calibration) and its per-connection cache
//!
//! Metadata is fetched once per successful connection through a
//! [`MetadataProvider`], validated, and then served read-only from the
//! [`MetadataStore`] until the next reset or cleanup.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::RetryPolicy;

/// Command understood by the sensor's TCP configuration port
pub const METADATA_REQUEST: &str = "get_metadata\n";

/// Metadata errors
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("metadata request timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid metadata: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Source of packet timestamps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimestampMode {
    #[default]
    TimeFromInternalOsc,
    TimeFromSyncPulseIn,
    TimeFromPtp1588,
    /// Ignore the sensor clock and stamp frames with the host receive time
    TimeFromHost,
}

/// Per-connection sensor calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMetadata {
    pub serial: String,
    pub firmware: String,
    /// Operating mode, e.g. "1024x10"
    pub lidar_mode: String,
    #[serde(default)]
    pub timestamp_mode: TimestampMode,
    pub columns_per_revolution: u32,
    pub columns_per_packet: u16,
    /// Elevation of each beam (degrees)
    pub beam_altitude_angles: Vec<f64>,
    /// Azimuth offset of each beam (degrees)
    pub beam_azimuth_angles: Vec<f64>,
    /// Destagger shift per image row (columns, may be negative)
    pub pixel_shift_by_row: Vec<i32>,
    #[serde(default)]
    pub lidar_origin_to_beam_origin_mm: f64,
}

impl SensorMetadata {
    /// Number of beams (image rows)
    pub fn beam_count(&self) -> usize {
        self.beam_altitude_angles.len()
    }

    /// Columns per revolution (image width)
    pub fn width(&self) -> usize {
        self.columns_per_revolution as usize
    }

    /// Check table consistency
    pub fn validate(&self) -> Result<(), MetadataError> {
        let n = self.beam_count();
        if n == 0 {
            return Err(MetadataError::Invalid("no beams".to_string()));
        }
        if self.beam_azimuth_angles.len() != n {
            return Err(MetadataError::Invalid(format!(
                "beam_azimuth_angles has {} entries, expected {}",
                self.beam_azimuth_angles.len(),
                n
            )));
        }
        if self.pixel_shift_by_row.len() != n {
            return Err(MetadataError::Invalid(format!(
                "pixel_shift_by_row has {} entries, expected {}",
                self.pixel_shift_by_row.len(),
                n
            )));
        }
        if self.columns_per_revolution == 0 || self.columns_per_revolution > u16::MAX as u32 + 1 {
            return Err(MetadataError::Invalid(format!(
                "columns_per_revolution out of range: {}",
                self.columns_per_revolution
            )));
        }
        if self.columns_per_packet == 0 {
            return Err(MetadataError::Invalid(
                "columns_per_packet must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// One bounded metadata fetch attempt
pub trait MetadataProvider: Send + Sync {
    fn fetch_once(&self, timeout: Duration) -> BoxFuture<'_, Result<SensorMetadata, MetadataError>>;

    /// Human-readable origin for logs
    fn describe(&self) -> String;
}

/// Fetches metadata from the sensor's TCP configuration port
///
/// Sends `get_metadata\n` and reads exactly one JSON line back.
pub struct TcpMetadataClient {
    addr: String,
}

impl TcpMetadataClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    async fn request(&self) -> Result<SensorMetadata, MetadataError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| MetadataError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(METADATA_REQUEST.as_bytes()).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(MetadataError::Protocol(
                "connection closed before reply".to_string(),
            ));
        }

        debug!(addr = %self.addr, bytes = n, "Metadata reply received");
        Ok(SensorMetadata::from_json(line.trim_end())?)
    }
}

impl MetadataProvider for TcpMetadataClient {
    fn fetch_once(&self, timeout: Duration) -> BoxFuture<'_, Result<SensorMetadata, MetadataError>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.request()).await {
                Ok(result) => result,
                Err(_) => Err(MetadataError::Timeout),
            }
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Reads metadata from a JSON file (offline replay)
pub struct FileMetadata {
    path: PathBuf,
}

impl FileMetadata {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MetadataProvider for FileMetadata {
    fn fetch_once(&self, timeout: Duration) -> BoxFuture<'_, Result<SensorMetadata, MetadataError>> {
        Box::pin(async move {
            let content = tokio::time::timeout(timeout, tokio::fs::read_to_string(&self.path))
                .await
                .map_err(|_| MetadataError::Timeout)??;
            Ok(SensorMetadata::from_json(&content)?)
        })
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// In-memory metadata
///
/// Can be told to fail its first fetches, which is how retry paths are
/// exercised without a sensor.
pub struct StaticMetadata {
    metadata: SensorMetadata,
    failures_remaining: AtomicU32,
    fetches: AtomicU32,
}

impl StaticMetadata {
    pub fn new(metadata: SensorMetadata) -> Self {
        Self {
            metadata,
            failures_remaining: AtomicU32::new(0),
            fetches: AtomicU32::new(0),
        }
    }

    /// Time out the first `n` fetches
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_remaining.store(n, Ordering::Relaxed);
        self
    }

    /// Total fetch attempts, including failed ones
    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl MetadataProvider for StaticMetadata {
    fn fetch_once(&self, _timeout: Duration) -> BoxFuture<'_, Result<SensorMetadata, MetadataError>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            let failing = self
                .failures_remaining
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(MetadataError::Timeout);
            }
            Ok(self.metadata.clone())
        })
    }

    fn describe(&self) -> String {
        format!("static ({})", self.metadata.serial)
    }
}

/// A validated snapshot and when it was fetched
#[derive(Debug, Clone)]
pub struct CachedMetadata {
    pub metadata: Arc<SensorMetadata>,
    pub fetched_at: DateTime<Utc>,
    /// Attempts the fetch needed
    pub attempts: u32,
}

/// Per-connection metadata cache
#[derive(Debug, Default)]
pub struct MetadataStore {
    cached: Option<CachedMetadata>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch, validate and cache metadata
    ///
    /// Performs at most `retry.attempts` attempts with exponential backoff.
    /// Invalid metadata is not retried. Any previous snapshot is dropped
    /// before the first attempt.
    pub async fn fetch(
        &mut self,
        provider: &dyn MetadataProvider,
        retry: &RetryPolicy,
    ) -> Result<Arc<SensorMetadata>, MetadataError> {
        self.cached = None;
        let attempts = retry.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match provider.fetch_once(retry.timeout).await {
                Ok(metadata) => {
                    metadata.validate()?;
                    info!(
                        source = %provider.describe(),
                        serial = %metadata.serial,
                        mode = %metadata.lidar_mode,
                        beams = metadata.beam_count(),
                        attempt,
                        "Sensor metadata fetched"
                    );
                    let metadata = Arc::new(metadata);
                    self.cached = Some(CachedMetadata {
                        metadata: Arc::clone(&metadata),
                        fetched_at: Utc::now(),
                        attempts: attempt,
                    });
                    return Ok(metadata);
                }
                Err(e) if attempt < attempts => {
                    let backoff = retry.backoff(attempt);
                    warn!(
                        source = %provider.describe(),
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Metadata fetch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cached snapshot, never does I/O
    pub fn get(&self) -> Option<Arc<SensorMetadata>> {
        self.cached.as_ref().map(|c| Arc::clone(&c.metadata))
    }

    pub fn cached(&self) -> Option<&CachedMetadata> {
        self.cached.as_ref()
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }

    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Small sensor: 4 beams, 8 columns per revolution
    pub(crate) fn sample_metadata() -> SensorMetadata {
        SensorMetadata {
            serial: "992005000123".to_string(),
            firmware: "v2.0.0".to_string(),
            lidar_mode: "8x10".to_string(),
            timestamp_mode: TimestampMode::TimeFromInternalOsc,
            columns_per_revolution: 8,
            columns_per_packet: 4,
            beam_altitude_angles: vec![15.0, 5.0, -5.0, -15.0],
            beam_azimuth_angles: vec![3.0, 1.0, -1.0, -3.0],
            pixel_shift_by_row: vec![1, 0, 0, -1],
            lidar_origin_to_beam_origin_mm: 0.0,
        }
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_validate_table_lengths() {
        let mut meta = sample_metadata();
        assert!(meta.validate().is_ok());

        meta.pixel_shift_by_row.pop();
        assert!(matches!(meta.validate(), Err(MetadataError::Invalid(_))));

        let mut meta = sample_metadata();
        meta.columns_per_revolution = 0;
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_json_field_names() {
        let json = sample_metadata().to_json().unwrap();
        assert!(json.contains("\"timestamp_mode\":\"TIME_FROM_INTERNAL_OSC\""));
        assert!(json.contains("\"pixel_shift_by_row\":[1,0,0,-1]"));

        let parsed = SensorMetadata::from_json(&json).unwrap();
        assert_eq!(parsed, sample_metadata());
    }

    #[test]
    fn test_beam_origin_defaults_to_zero() {
        let json = r#"{
            "serial": "1", "firmware": "f", "lidar_mode": "8x10",
            "columns_per_revolution": 8, "columns_per_packet": 4,
            "beam_altitude_angles": [0.0], "beam_azimuth_angles": [0.0],
            "pixel_shift_by_row": [0]
        }"#;
        let meta = SensorMetadata::from_json(json).unwrap();
        assert_eq!(meta.lidar_origin_to_beam_origin_mm, 0.0);
        assert_eq!(meta.timestamp_mode, TimestampMode::TimeFromInternalOsc);
    }

    #[tokio::test]
    async fn test_store_retries_then_caches() {
        let provider = StaticMetadata::new(sample_metadata()).failing_first(2);
        let mut store = MetadataStore::new();

        let meta = store.fetch(&provider, &fast_retry(3)).await.unwrap();
        assert_eq!(*meta, sample_metadata());
        assert_eq!(provider.fetch_count(), 3);
        assert_eq!(store.cached().unwrap().attempts, 3);

        // Reads are served from the cache
        assert_eq!(store.get().unwrap(), meta);
        assert_eq!(provider.fetch_count(), 3);

        store.clear();
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn test_store_gives_up_after_attempts() {
        let provider = StaticMetadata::new(sample_metadata()).failing_first(5);
        let mut store = MetadataStore::new();

        let result = store.fetch(&provider, &fast_retry(2)).await;
        assert!(matches!(result, Err(MetadataError::Timeout)));
        assert_eq!(provider.fetch_count(), 2);
        assert!(!store.is_cached());
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_without_retry() {
        let mut meta = sample_metadata();
        meta.beam_azimuth_angles.clear();
        let provider = StaticMetadata::new(meta);
        let mut store = MetadataStore::new();

        let result = store.fetch(&provider, &fast_retry(3)).await;
        assert!(matches!(result, Err(MetadataError::Invalid(_))));
        assert_eq!(provider.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_tcp_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read_half).read_line(&mut line).await.unwrap();
            assert_eq!(line, METADATA_REQUEST);
            let reply = format!("{}\n", sample_metadata().to_json().unwrap());
            write_half.write_all(reply.as_bytes()).await.unwrap();
        });

        let client = TcpMetadataClient::new(addr.to_string());
        let meta = client.fetch_once(Duration::from_secs(2)).await.unwrap();
        assert_eq!(meta, sample_metadata());
    }

    #[tokio::test]
    async fn test_tcp_client_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TcpMetadataClient::new(addr.to_string());
        let result = client.fetch_once(Duration::from_secs(2)).await;
        assert!(matches!(result, Err(MetadataError::Connect { .. })));
    }
}
