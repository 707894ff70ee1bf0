//! Packet sources
//!
//! A [`PacketSource`] delivers raw datagrams to the driver tick. Two
//! implementations are provided:
//!
//! - [`UdpSource`]: live sensor traffic on a bound UDP port
//! - [`ReplaySource`]: a fixed list of datagrams, used for offline replay
//!   and tests
//!
//! `receive` never blocks past its timeout. A timeout is a normal outcome
//! (sensors go quiet); `Closed` while the driver is active is fatal.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::format::PacketFormat;
use crate::common::now_ns;
use crate::decoder::RawPacket;

/// Packet source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("cannot open {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("receive timed out")]
    Timeout,

    #[error("source closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Source of raw sensor datagrams
pub trait PacketSource: Send {
    /// Open (or reopen) the connection to the sensor
    fn open(&mut self) -> BoxFuture<'_, Result<(), SourceError>>;

    /// Receive the next datagram, waiting at most `timeout`
    fn receive(&mut self, timeout: Duration) -> BoxFuture<'_, Result<RawPacket, SourceError>>;

    /// Release the connection. Calling close on a closed source is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;
}

/// Live UDP source
pub struct UdpSource {
    bind_address: String,
    /// Only accept datagrams from this host when set
    sensor_host: Option<IpAddr>,
    format: PacketFormat,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpSource {
    pub fn new(bind_address: impl Into<String>, format: PacketFormat) -> Self {
        let buf = vec![0u8; format.max_packet_len];
        Self {
            bind_address: bind_address.into(),
            sensor_host: None,
            format,
            socket: None,
            buf,
        }
    }

    /// Drop datagrams that do not come from `host`
    pub fn with_sensor_host(mut self, host: IpAddr) -> Self {
        self.sensor_host = Some(host);
        self
    }

    /// Bound local address while open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl PacketSource for UdpSource {
    fn open(&mut self) -> BoxFuture<'_, Result<(), SourceError>> {
        Box::pin(async move {
            self.close();
            let socket = UdpSocket::bind(&self.bind_address)
                .await
                .map_err(|source| SourceError::Connect {
                    endpoint: self.bind_address.clone(),
                    source,
                })?;
            info!(
                address = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                "UDP source bound"
            );
            self.socket = Some(socket);
            Ok(())
        })
    }

    fn receive(&mut self, timeout: Duration) -> BoxFuture<'_, Result<RawPacket, SourceError>> {
        Box::pin(async move {
            let socket = self.socket.as_ref().ok_or(SourceError::Closed)?;
            let deadline = Instant::now() + timeout;

            loop {
                let (len, from) =
                    match tokio::time::timeout_at(deadline, socket.recv_from(&mut self.buf)).await
                    {
                        Err(_) => return Err(SourceError::Timeout),
                        Ok(result) => result?,
                    };

                if let Some(host) = self.sensor_host {
                    if from.ip() != host {
                        trace!(from = %from, "Ignoring datagram from foreign host");
                        continue;
                    }
                }

                let data = Bytes::copy_from_slice(&self.buf[..len]);
                let packet_type = self.format.classify(&data);
                return Ok(RawPacket::new(data, now_ns(), packet_type));
            }
        })
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!(address = %self.bind_address, "UDP source closed");
        }
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.bind_address)
    }
}

/// Open/close counters shared with the owner of a [`ReplaySource`]
#[derive(Debug, Default)]
pub struct ReplayStats {
    pub opens: AtomicU32,
    pub closes: AtomicU32,
}

impl ReplayStats {
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::Relaxed)
    }
}

/// Replays a fixed list of datagrams
///
/// Every `open` rewinds to the first datagram. Once exhausted, `receive`
/// reports `Timeout` (a quiet sensor) or `Closed` when built with
/// [`ReplaySource::close_when_exhausted`].
pub struct ReplaySource {
    packets: Vec<Bytes>,
    format: PacketFormat,
    index: usize,
    open: bool,
    close_when_exhausted: bool,
    failed_opens: u32,
    stats: Arc<ReplayStats>,
}

impl ReplaySource {
    pub fn new(packets: Vec<Vec<u8>>, format: PacketFormat) -> Self {
        Self {
            packets: packets.into_iter().map(Bytes::from).collect(),
            format,
            index: 0,
            open: false,
            close_when_exhausted: false,
            failed_opens: 0,
            stats: Arc::new(ReplayStats::default()),
        }
    }

    pub fn empty(format: PacketFormat) -> Self {
        Self::new(Vec::new(), format)
    }

    /// Report `Closed` after the last datagram instead of timing out
    pub fn close_when_exhausted(mut self) -> Self {
        self.close_when_exhausted = true;
        self
    }

    /// Refuse the first `n` open attempts
    pub fn fail_opens(mut self, n: u32) -> Self {
        self.failed_opens = n;
        self
    }

    pub fn stats(&self) -> Arc<ReplayStats> {
        Arc::clone(&self.stats)
    }

    pub fn remaining(&self) -> usize {
        self.packets.len().saturating_sub(self.index)
    }
}

impl PacketSource for ReplaySource {
    fn open(&mut self) -> BoxFuture<'_, Result<(), SourceError>> {
        Box::pin(async move {
            if self.failed_opens > 0 {
                self.failed_opens -= 1;
                return Err(SourceError::Connect {
                    endpoint: self.describe(),
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "replay refused"),
                });
            }
            self.index = 0;
            self.open = true;
            self.stats.opens.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn receive(&mut self, _timeout: Duration) -> BoxFuture<'_, Result<RawPacket, SourceError>> {
        Box::pin(async move {
            if !self.open {
                return Err(SourceError::Closed);
            }

            match self.packets.get(self.index) {
                Some(data) => {
                    self.index += 1;
                    let packet_type = self.format.classify(data);
                    Ok(RawPacket::new(data.clone(), now_ns(), packet_type))
                }
                None if self.close_when_exhausted => {
                    self.open = false;
                    Err(SourceError::Closed)
                }
                None => Err(SourceError::Timeout),
            }
        })
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.stats.closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn describe(&self) -> String {
        format!("replay ({} packets)", self.packets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::PacketType;
    use crate::sensor::format::{encode_imu_packet, IMU_PACKET_LEN};
    use crate::decoder::ImuSample;

    #[tokio::test]
    async fn test_replay_rewinds_on_open() {
        let mut source = ReplaySource::new(vec![vec![1, 0, 0], vec![9]], PacketFormat::default());
        let stats = source.stats();

        assert!(matches!(
            source.receive(Duration::from_millis(1)).await,
            Err(SourceError::Closed)
        ));

        source.open().await.unwrap();
        let first = source.receive(Duration::from_millis(1)).await.unwrap();
        assert_eq!(first.packet_type, PacketType::Lidar);
        let second = source.receive(Duration::from_millis(1)).await.unwrap();
        assert_eq!(second.packet_type, PacketType::Unknown);
        assert!(matches!(
            source.receive(Duration::from_millis(1)).await,
            Err(SourceError::Timeout)
        ));

        source.open().await.unwrap();
        assert_eq!(source.remaining(), 2);
        assert_eq!(stats.opens(), 2);
    }

    #[tokio::test]
    async fn test_replay_close_when_exhausted() {
        let mut source = ReplaySource::new(vec![vec![0; 4]], PacketFormat::default())
            .close_when_exhausted();
        source.open().await.unwrap();
        source.receive(Duration::from_millis(1)).await.unwrap();

        assert!(matches!(
            source.receive(Duration::from_millis(1)).await,
            Err(SourceError::Closed)
        ));
        assert!(!source.is_open());
    }

    #[tokio::test]
    async fn test_replay_failed_opens() {
        let mut source = ReplaySource::empty(PacketFormat::default()).fail_opens(1);
        assert!(matches!(
            source.open().await,
            Err(SourceError::Connect { .. })
        ));
        assert!(source.open().await.is_ok());
        assert_eq!(source.stats().opens(), 1);
    }

    #[tokio::test]
    async fn test_udp_receive_and_timeout() {
        let mut source = UdpSource::new("127.0.0.1:0", PacketFormat::default());
        source.open().await.unwrap();
        let addr = source.local_addr().unwrap();

        assert!(matches!(
            source.receive(Duration::from_millis(20)).await,
            Err(SourceError::Timeout)
        ));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&encode_imu_packet(&ImuSample::default()), addr)
            .await
            .unwrap();

        let packet = source.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(packet.len(), IMU_PACKET_LEN);
        assert_eq!(packet.packet_type, PacketType::Imu);

        source.close();
        assert!(matches!(
            source.receive(Duration::from_millis(1)).await,
            Err(SourceError::Closed)
        ));
    }
}
