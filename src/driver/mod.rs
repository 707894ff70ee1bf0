//! Lifecycle-managed lidar driver
//!
//! [`LidarDriver`] owns the packet source, the metadata cache, the
//! processing pipeline and the periodic tick. Lifecycle transitions,
//! request handlers (`reset`, `get_metadata`) and the tick all serialize on
//! one `tokio::sync::Mutex`, so a request never observes a half-processed
//! packet and the tick never runs against a source being reopened.
//!
//! The tick holds the lock for at most one tick interval plus one receive.
//! Stopping transitions bump the tick epoch before they queue for the lock,
//! which ends a running drain at the next packet.
//!
//! ```text
//!               configure            activate
//! Unconfigured ───────────▶ Inactive ─────────▶ Active
//!      ▲        cleanup        │  ▲  deactivate   │
//!      └───────────────────────┘  └──────────────┘
//!      ▲
//!      │ clear_error
//! ErrorProcessing ◀── error / failed activate / failed reset / source closed
//!
//! shutdown: any state ─▶ Finalized
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::assembler::{AssembledFrame, FrameAssembler};
use crate::common::{
    Command, CommandResponse, CounterSnapshot, DriverCounters, DriverError, DriverResult,
    LifecycleSharedState, LifecycleState, Transition,
};
use crate::converter::ProductConverter;
use crate::decoder::{DecodeError, PacketContent, PacketDecoder, RawPacket};
use crate::publisher::{OutputTarget, ProductSink};
use crate::sensor::{
    MetadataError, MetadataProvider, MetadataStore, PacketFormat, PacketSource, RetryPolicy,
    SensorMetadata, SourceError,
};

/// Runtime settings of the driver
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub format: PacketFormat,
    /// Period of the processing tick
    pub tick_interval: Duration,
    /// Bound on one receive call
    pub poll_timeout: Duration,
    pub max_packets_per_tick: usize,
    pub connect_retry: RetryPolicy,
    pub metadata_retry: RetryPolicy,
    pub output: OutputTarget,
}

impl DriverConfig {
    pub fn new(format: PacketFormat, output: OutputTarget) -> Self {
        Self {
            format,
            tick_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_millis(10),
            max_packets_per_tick: 512,
            connect_retry: RetryPolicy::default(),
            metadata_retry: RetryPolicy::default(),
            output,
        }
    }
}

/// Snapshot returned by [`LidarDriver::status`]
#[derive(Debug, Clone)]
pub struct DriverStatus {
    pub state: LifecycleState,
    pub last_error: Option<String>,
    pub transitions: u64,
    pub counters: CounterSnapshot,
    /// Serial of the connected sensor, when metadata is cached
    pub serial: Option<String>,
    pub metadata_fetched_at: Option<DateTime<Utc>>,
}

impl DriverStatus {
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{}: {} packets, {} frames ({} incomplete), {} anomalies",
            self.state,
            self.counters.packets,
            self.counters.frames,
            self.counters.incomplete_frames,
            self.counters.too_short
                + self.counters.malformed
                + self.counters.unknown_packets
                + self.counters.dropped_columns,
        );
        if let Some(serial) = &self.serial {
            summary.push_str(&format!(", sensor {serial}"));
        }
        if let Some(at) = &self.metadata_fetched_at {
            summary.push_str(&format!(", metadata from {}", at.to_rfc3339()));
        }
        if let Some(err) = &self.last_error {
            summary.push_str(&format!(", last error: {err}"));
        }
        summary
    }
}

/// Decode → assemble → convert → publish
struct Pipeline {
    decoder: PacketDecoder,
    assembler: FrameAssembler,
    converter: ProductConverter,
    sink: Box<dyn ProductSink>,
}

impl Pipeline {
    fn new(format: PacketFormat, sink: Box<dyn ProductSink>) -> Self {
        Self {
            decoder: PacketDecoder::new(format),
            // Resized to the sensor's width once metadata is fetched
            assembler: FrameAssembler::new(0),
            converter: ProductConverter::new(),
            sink,
        }
    }

    async fn handle_packet(
        &mut self,
        packet: RawPacket,
        meta: &SensorMetadata,
        counters: &DriverCounters,
    ) {
        counters.inc_packets(packet.len());

        match self.decoder.decode(&packet, meta) {
            Ok(PacketContent::Lidar {
                columns,
                timestamp_regressions,
            }) => {
                if timestamp_regressions > 0 {
                    counters.add_timestamp_regressions(timestamp_regressions as u64);
                    debug!(regressions = timestamp_regressions, "Column timestamps went backwards");
                }
                let duplicates = self.assembler.stats().duplicates;
                for column in columns {
                    match self.assembler.push(column, packet.received_at_ns) {
                        Ok(Some(frame)) => self.publish_frame(frame, meta, counters).await,
                        Ok(None) => {}
                        Err(rejected) => {
                            counters.inc_dropped_columns();
                            debug!(reason = %rejected, "Column dropped");
                        }
                    }
                }
                counters.add_duplicate_columns(self.assembler.stats().duplicates - duplicates);
            }
            Ok(PacketContent::Imu(sample)) => {
                let msg = self
                    .converter
                    .convert_imu(&sample, packet.received_at_ns, meta);
                counters.inc_imu();
                if let Err(e) = self.sink.publish_imu(&msg).await {
                    counters.inc_publish_errors();
                    warn!(error = %e, "Failed to publish IMU sample");
                }
            }
            Err(e) => {
                match e {
                    DecodeError::TooShort { .. } => counters.inc_too_short(),
                    DecodeError::MalformedColumn(_) => counters.inc_malformed(),
                    DecodeError::UnknownPacketType(_) => counters.inc_unknown(),
                }
                debug!(error = %e, len = packet.len(), "Packet rejected");
            }
        }
    }

    async fn publish_frame(
        &mut self,
        frame: AssembledFrame,
        meta: &SensorMetadata,
        counters: &DriverCounters,
    ) {
        let missing = frame.missing_columns();
        if missing > 0 {
            debug!(frame_id = frame.frame_id, missing, "Incomplete frame");
        }
        let products = self.converter.convert(&frame, meta);
        counters.record_frame(missing);

        if let Err(e) = self.sink.publish_frame(&products).await {
            counters.inc_publish_errors();
            warn!(frame_id = frame.frame_id, error = %e, "Failed to publish frame");
        }
    }
}

/// Everything guarded by the coarse lock
struct DriverInner {
    shared: LifecycleSharedState,
    source: Box<dyn PacketSource>,
    provider: Arc<dyn MetadataProvider>,
    metadata: MetadataStore,
    pipeline: Option<Pipeline>,
    tick: Option<JoinHandle<()>>,
}

impl DriverInner {
    /// Open the source and fetch metadata, both with retries
    async fn connect(&mut self, config: &DriverConfig) -> DriverResult<Arc<SensorMetadata>> {
        self.open_source(&config.connect_retry).await?;

        let meta = self
            .metadata
            .fetch(self.provider.as_ref(), &config.metadata_retry)
            .await?;

        if let Err(e) = check_format(&meta, &config.format) {
            self.metadata.clear();
            return Err(e.into());
        }

        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.assembler.resize(meta.width());
        }
        Ok(meta)
    }

    async fn open_source(&mut self, policy: &RetryPolicy) -> DriverResult<()> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.source.open().await {
                Ok(()) => {
                    info!(source = %self.source.describe(), attempt, "Packet source opened");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    let backoff = policy.backoff(attempt);
                    warn!(
                        source = %self.source.describe(),
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failed to open packet source, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(DriverError::Connect {
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }

    /// Signal the tick to stop; the caller joins the handle after unlocking
    fn stop_tick(&mut self, core: &DriverCore) -> Option<JoinHandle<()>> {
        core.interrupt_tick();
        self.tick.take()
    }

    /// Close the source, drop metadata and any partial frame
    fn release_source(&mut self) {
        self.source.close();
        self.metadata.clear();
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.assembler.reset();
        }
    }

    /// Enter ErrorProcessing
    fn fail(&mut self, core: &DriverCore, reason: String) -> Option<JoinHandle<()>> {
        let handle = self.stop_tick(core);
        self.release_source();
        self.shared.commit_error(&core.state_tx, reason);
        handle
    }

    /// Drain packets until the source goes quiet
    ///
    /// A drain also ends after `max_packets_per_tick` packets, once the tick
    /// interval has elapsed, or when the tick's epoch is superseded.
    async fn process_tick(
        &mut self,
        config: &DriverConfig,
        counters: &DriverCounters,
        epoch_rx: &watch::Receiver<u64>,
        epoch: u64,
    ) -> Result<(), SourceError> {
        let Some(meta) = self.metadata.get() else {
            return Ok(());
        };
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(());
        };

        let deadline = Instant::now() + config.tick_interval;
        for _ in 0..config.max_packets_per_tick {
            if *epoch_rx.borrow() != epoch || Instant::now() >= deadline {
                break;
            }
            let packet = match self.source.receive(config.poll_timeout).await {
                Ok(packet) => packet,
                Err(SourceError::Timeout) => {
                    counters.inc_timeouts();
                    break;
                }
                Err(e) => return Err(e),
            };
            pipeline.handle_packet(packet, &meta, counters).await;
        }
        Ok(())
    }
}

/// State shared between the driver handle and its tick task
struct DriverCore {
    config: DriverConfig,
    inner: Mutex<DriverInner>,
    state_tx: watch::Sender<LifecycleState>,
    /// A tick runs only while the epoch it was started with is current
    tick_epoch: watch::Sender<u64>,
    counters: DriverCounters,
}

impl DriverCore {
    /// Supersede the running tick, if any; does not need the lock
    fn interrupt_tick(&self) {
        self.tick_epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }
}

/// Lifecycle-managed lidar driver
pub struct LidarDriver {
    core: Arc<DriverCore>,
}

impl LidarDriver {
    pub fn new(
        config: DriverConfig,
        source: Box<dyn PacketSource>,
        provider: Arc<dyn MetadataProvider>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Unconfigured);
        let (tick_epoch, _) = watch::channel(0);
        Self {
            core: Arc::new(DriverCore {
                config,
                inner: Mutex::new(DriverInner {
                    shared: LifecycleSharedState::new(),
                    source,
                    provider,
                    metadata: MetadataStore::new(),
                    pipeline: None,
                    tick: None,
                }),
                state_tx,
                tick_epoch,
                counters: DriverCounters::new(),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.core.state_tx.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.core.state_tx.subscribe()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.core.counters.snapshot()
    }

    pub async fn status(&self) -> DriverStatus {
        let inner = self.core.inner.lock().await;
        DriverStatus {
            state: inner.shared.state,
            last_error: inner.shared.last_error.clone(),
            transitions: inner.shared.transitions,
            counters: self.core.counters.snapshot(),
            serial: inner.metadata.get().map(|m| m.serial.clone()),
            metadata_fetched_at: inner.metadata.cached().map(|c| c.fetched_at),
        }
    }

    /// Unconfigured → Inactive: open output channels and build the pipeline
    pub async fn configure(&self) -> DriverResult<()> {
        let mut inner = self.core.inner.lock().await;
        let target = inner.shared.begin(Transition::Configure)?;

        let sink = self.core.config.output.open()?;
        inner.pipeline = Some(Pipeline::new(self.core.config.format.clone(), sink));
        self.core.counters.reset();

        inner.shared.commit(&self.core.state_tx, target);
        Ok(())
    }

    /// Inactive → Active: connect, fetch metadata, start the tick
    ///
    /// On failure the driver is left in ErrorProcessing.
    pub async fn activate(&self) -> DriverResult<()> {
        let mut inner = self.core.inner.lock().await;
        let target = inner.shared.begin(Transition::Activate)?;

        if let Err(e) = inner.connect(&self.core.config).await {
            error!(error = %e, "Activation failed");
            inner.fail(&self.core, e.to_string());
            return Err(e);
        }

        inner.tick = Some(spawn_tick(Arc::clone(&self.core)));
        inner.shared.commit(&self.core.state_tx, target);
        Ok(())
    }

    /// Active → Inactive: stop the tick and close the source
    pub async fn deactivate(&self) -> DriverResult<()> {
        self.core.interrupt_tick();
        let handle = {
            let mut inner = self.core.inner.lock().await;
            let target = inner.shared.begin(Transition::Deactivate)?;
            let handle = inner.stop_tick(&self.core);
            inner.release_source();
            inner.shared.commit(&self.core.state_tx, target);
            handle
        };
        join_tick(handle).await;
        Ok(())
    }

    /// Inactive → Unconfigured: release channels and pipeline
    pub async fn cleanup(&self) -> DriverResult<()> {
        let mut inner = self.core.inner.lock().await;
        let target = inner.shared.begin(Transition::Cleanup)?;
        inner.release_source();
        inner.pipeline = None;
        inner.shared.commit(&self.core.state_tx, target);
        Ok(())
    }

    /// Any non-terminal state → ErrorProcessing
    pub async fn error(&self, reason: impl Into<String>) -> DriverResult<()> {
        self.core.interrupt_tick();
        let handle = {
            let mut inner = self.core.inner.lock().await;
            inner.shared.begin(Transition::Error)?;
            let reason = reason.into();
            warn!(reason = %reason, "Error transition requested");
            inner.fail(&self.core, reason)
        };
        join_tick(handle).await;
        Ok(())
    }

    /// ErrorProcessing → Unconfigured
    pub async fn clear_error(&self) -> DriverResult<()> {
        let mut inner = self.core.inner.lock().await;
        let target = inner.shared.begin(Transition::ClearError)?;
        inner.release_source();
        inner.pipeline = None;
        inner.shared.commit(&self.core.state_tx, target);
        Ok(())
    }

    /// Any state → Finalized
    ///
    /// Best effort; shutting down a finalized driver is a no-op.
    pub async fn shutdown(&self) -> DriverResult<()> {
        self.core.interrupt_tick();
        let handle = {
            let mut inner = self.core.inner.lock().await;
            if inner.shared.state == LifecycleState::Finalized {
                return Ok(());
            }
            let handle = inner.stop_tick(&self.core);
            inner.release_source();
            inner.pipeline = None;
            inner
                .shared
                .commit(&self.core.state_tx, Transition::Shutdown.target());
            handle
        };
        join_tick(handle).await;
        Ok(())
    }

    /// Reconnect to the sensor without changing lifecycle state
    ///
    /// Only valid while Active. The tick is paused for the duration. If the
    /// sensor cannot be reached again the driver enters ErrorProcessing and
    /// the error is returned.
    pub async fn reset(&self) -> DriverResult<Arc<SensorMetadata>> {
        let mut inner = self.core.inner.lock().await;
        if !inner.shared.is_active() {
            return Err(DriverError::NotActive(inner.shared.state));
        }

        info!("Resetting sensor connection");
        inner.release_source();

        match inner.connect(&self.core.config).await {
            Ok(meta) => {
                info!(serial = %meta.serial, "Sensor reset complete");
                Ok(meta)
            }
            Err(e) => {
                error!(error = %e, "Sensor reset failed");
                let handle = inner.fail(&self.core, e.to_string());
                drop(inner);
                join_tick(handle).await;
                Err(e)
            }
        }
    }

    /// Cached sensor metadata; only available while Active
    pub async fn get_metadata(&self) -> DriverResult<Arc<SensorMetadata>> {
        let inner = self.core.inner.lock().await;
        if !inner.shared.is_active() {
            return Err(DriverError::NotAvailable);
        }
        inner.metadata.get().ok_or(DriverError::NotAvailable)
    }

    /// Execute one controller command
    pub async fn handle_command(&self, cmd: Command) -> CommandResponse {
        match cmd {
            Command::Configure => self.respond(self.configure().await, "Configured"),
            Command::Activate => self.respond(self.activate().await, "Activated"),
            Command::Deactivate => self.respond(self.deactivate().await, "Deactivated"),
            Command::Cleanup => self.respond(self.cleanup().await, "Cleaned up"),
            Command::Error { reason } => self.respond(self.error(reason).await, "Error state entered"),
            Command::ClearError => self.respond(self.clear_error().await, "Error cleared"),
            Command::Shutdown => self.respond(self.shutdown().await, "Shut down"),
            Command::Reset => match self.reset().await {
                Ok(meta) => CommandResponse::success(self.state(), "Sensor reset")
                    .with_metadata((*meta).clone()),
                Err(e) => CommandResponse::error(self.state(), e.to_string()),
            },
            Command::GetMetadata => match self.get_metadata().await {
                Ok(meta) => CommandResponse::success(self.state(), "Metadata")
                    .with_metadata((*meta).clone()),
                Err(e) => CommandResponse::error(self.state(), e.to_string()),
            },
            Command::GetStatus => {
                let status = self.status().await;
                CommandResponse::success(status.state, status.summary())
                    .with_counters(status.counters)
            }
        }
    }

    fn respond(&self, result: DriverResult<()>, message: &str) -> CommandResponse {
        match result {
            Ok(()) => CommandResponse::success(self.state(), message),
            Err(e) => CommandResponse::error(self.state(), e.to_string()),
        }
    }
}

/// Reject metadata whose geometry does not match the packet format
fn check_format(meta: &SensorMetadata, format: &PacketFormat) -> Result<(), MetadataError> {
    if meta.beam_count() != format.pixels_per_column as usize {
        return Err(MetadataError::Invalid(format!(
            "sensor has {} beams, packet format expects {}",
            meta.beam_count(),
            format.pixels_per_column
        )));
    }
    if meta.columns_per_packet != format.columns_per_packet {
        return Err(MetadataError::Invalid(format!(
            "sensor sends {} columns per packet, packet format expects {}",
            meta.columns_per_packet, format.columns_per_packet
        )));
    }
    Ok(())
}

fn spawn_tick(core: Arc<DriverCore>) -> JoinHandle<()> {
    let mut epoch = 0;
    core.tick_epoch.send_modify(|current| {
        *current = current.wrapping_add(1);
        epoch = *current;
    });
    let epoch_rx = core.tick_epoch.subscribe();
    tokio::spawn(run_tick(core, epoch_rx, epoch))
}

async fn join_tick(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Processing tick ended abnormally");
        }
    }
}

/// Periodic processing loop
///
/// Exits when its epoch is superseded, when the driver leaves Active, or
/// after moving the driver to ErrorProcessing on a source failure.
async fn run_tick(core: Arc<DriverCore>, mut epoch_rx: watch::Receiver<u64>, epoch: u64) {
    let mut ticker = interval(core.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(
        interval_ms = core.config.tick_interval.as_millis() as u64,
        "Processing tick started"
    );

    loop {
        tokio::select! {
            biased;

            changed = epoch_rx.changed() => {
                if changed.is_err() || *epoch_rx.borrow_and_update() != epoch {
                    break;
                }
            }

            _ = ticker.tick() => {}
        }

        let mut inner = core.inner.lock().await;
        if *epoch_rx.borrow() != epoch || !inner.shared.is_active() {
            break;
        }

        if let Err(e) = inner
            .process_tick(&core.config, &core.counters, &epoch_rx, epoch)
            .await
        {
            error!(error = %e, "Packet source failed while active");
            // Our own handle is detached here
            let _ = inner.fail(&core, e.to_string());
            break;
        }
    }

    debug!("Processing tick stopped");
}
