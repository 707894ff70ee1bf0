//! Publish boundary
//!
//! Products leave the driver through a [`ProductSink`]. The ZeroMQ sink
//! binds one PUB socket per output channel and sends two-frame messages:
//! `[channel name, MessagePack payload]`. The memory sink keeps everything
//! in process and is what tests and embedding applications observe.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::SinkExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tmq::{publish, Context};
use tracing::{debug, info};

use crate::converter::{ImuMessage, Products};

/// Publish errors
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("ZMQ error: {0}")]
    Zmq(#[from] tmq::TmqError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
}

/// One output channel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Topic name sent as the first frame
    pub name: String,
    /// ZMQ bind address (e.g. "tcp://*:5561")
    pub address: String,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// The five output channels
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OutputChannels {
    #[serde(default = "default_points")]
    pub points: ChannelConfig,
    #[serde(default = "default_range_image")]
    pub range_image: ChannelConfig,
    #[serde(default = "default_intensity_image")]
    pub intensity_image: ChannelConfig,
    #[serde(default = "default_noise_image")]
    pub noise_image: ChannelConfig,
    #[serde(default = "default_imu")]
    pub imu: ChannelConfig,
}

fn default_points() -> ChannelConfig {
    ChannelConfig::new("points", "tcp://*:5561")
}

fn default_range_image() -> ChannelConfig {
    ChannelConfig::new("range_image", "tcp://*:5562")
}

fn default_intensity_image() -> ChannelConfig {
    ChannelConfig::new("intensity_image", "tcp://*:5563")
}

fn default_noise_image() -> ChannelConfig {
    ChannelConfig::new("noise_image", "tcp://*:5564")
}

fn default_imu() -> ChannelConfig {
    ChannelConfig::new("imu", "tcp://*:5565")
}

impl Default for OutputChannels {
    fn default() -> Self {
        Self {
            points: default_points(),
            range_image: default_range_image(),
            intensity_image: default_intensity_image(),
            noise_image: default_noise_image(),
            imu: default_imu(),
        }
    }
}

/// Consumer of converted products
pub trait ProductSink: Send {
    fn publish_frame<'a>(&'a mut self, products: &'a Products) -> BoxFuture<'a, Result<(), PublishError>>;

    fn publish_imu<'a>(&'a mut self, imu: &'a ImuMessage) -> BoxFuture<'a, Result<(), PublishError>>;
}

/// Where products go, chosen at configure time
#[derive(Clone)]
pub enum OutputTarget {
    Zmq(OutputChannels),
    Memory(MemorySink),
}

impl OutputTarget {
    /// Open the channels
    pub fn open(&self) -> Result<Box<dyn ProductSink>, PublishError> {
        match self {
            OutputTarget::Zmq(channels) => Ok(Box::new(ZmqPublisher::bind(channels)?)),
            OutputTarget::Memory(sink) => Ok(Box::new(sink.clone())),
        }
    }
}

impl std::fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputTarget::Zmq(channels) => f.debug_tuple("Zmq").field(channels).finish(),
            OutputTarget::Memory(_) => f.write_str("Memory"),
        }
    }
}

struct Channel {
    name: String,
    socket: publish::Publish,
}

impl Channel {
    fn bind(context: &Context, config: &ChannelConfig) -> Result<Self, PublishError> {
        let socket = publish(context).bind(&config.address)?;
        info!(channel = %config.name, address = %config.address, "Output channel bound");
        Ok(Self {
            name: config.name.clone(),
            socket,
        })
    }

    async fn send<T: Serialize>(&mut self, payload: &T) -> Result<(), PublishError> {
        let bytes = rmp_serde::to_vec(payload)?;
        let msg: tmq::Multipart = vec![
            tmq::Message::from(self.name.as_bytes()),
            tmq::Message::from(bytes.as_slice()),
        ]
        .into();
        self.socket.send(msg).await?;
        Ok(())
    }
}

/// ZeroMQ PUB publisher, one socket per channel
pub struct ZmqPublisher {
    points: Channel,
    range_image: Channel,
    intensity_image: Channel,
    noise_image: Channel,
    imu: Channel,
}

impl ZmqPublisher {
    pub fn bind(channels: &OutputChannels) -> Result<Self, PublishError> {
        let context = Context::new();
        Ok(Self {
            points: Channel::bind(&context, &channels.points)?,
            range_image: Channel::bind(&context, &channels.range_image)?,
            intensity_image: Channel::bind(&context, &channels.intensity_image)?,
            noise_image: Channel::bind(&context, &channels.noise_image)?,
            imu: Channel::bind(&context, &channels.imu)?,
        })
    }
}

impl ProductSink for ZmqPublisher {
    fn publish_frame<'a>(&'a mut self, products: &'a Products) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(async move {
            self.points.send(&products.point_cloud).await?;
            self.range_image.send(&products.range_image).await?;
            self.intensity_image.send(&products.intensity_image).await?;
            self.noise_image.send(&products.noise_image).await?;
            debug!(
                frame_id = products.frame_id(),
                missing = products.missing_columns(),
                "Published frame"
            );
            Ok(())
        })
    }

    fn publish_imu<'a>(&'a mut self, imu: &'a ImuMessage) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(async move { self.imu.send(imu).await })
    }
}

#[derive(Debug, Default)]
struct MemoryRecord {
    frames: Vec<Products>,
    imu: Vec<ImuMessage>,
}

/// In-process sink
///
/// Clones share the same storage, so a handle kept by the caller sees what
/// the driver published.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    record: Arc<Mutex<MemoryRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Products> {
        self.record.lock().frames.clone()
    }

    pub fn frame_count(&self) -> usize {
        self.record.lock().frames.len()
    }

    pub fn imu(&self) -> Vec<ImuMessage> {
        self.record.lock().imu.clone()
    }

    /// Remove and return everything recorded so far
    pub fn take_frames(&self) -> Vec<Products> {
        std::mem::take(&mut self.record.lock().frames)
    }
}

impl ProductSink for MemorySink {
    fn publish_frame<'a>(&'a mut self, products: &'a Products) -> BoxFuture<'a, Result<(), PublishError>> {
        self.record.lock().frames.push(products.clone());
        Box::pin(async { Ok(()) })
    }

    fn publish_imu<'a>(&'a mut self, imu: &'a ImuMessage) -> BoxFuture<'a, Result<(), PublishError>> {
        self.record.lock().imu.push(*imu);
        Box::pin(async { Ok(()) })
    }
}
