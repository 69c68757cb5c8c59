//! Pumping frames between a [`FrameDevice`] and a frame tunnel.
//!
//! The agent pumps between a container interface and the relay; the helper
//! pumps between a switch port and the relay. Counters are relative to the
//! device: `inbound` frames were delivered to it, `outbound` frames were read
//! from it.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::FrameDevice;
use crate::frame::{MAX_FRAME_LEN, MIN_FRAME_LEN, read_frame, write_frame};
use crate::proto;
use crate::transport::{ChannelListener, ChannelStream, is_closed};

/// Frame and byte counters for one direction.
#[derive(Debug, Default)]
pub struct FrameCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl FrameCounters {
    /// Count one frame of `len` bytes.
    pub fn record(&self, len: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Frames counted so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Bytes counted so far.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Traffic counters for a device or a relay.
#[derive(Debug, Default)]
pub struct TrafficStats {
    /// Frames delivered to the device.
    pub inbound: FrameCounters,
    /// Frames read from the device.
    pub outbound: FrameCounters,
    errors: AtomicU64,
}

impl TrafficStats {
    /// Count a dropped frame or failed transfer.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Errors counted so far.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Point-in-time copy for the control protocol.
    #[must_use]
    pub fn snapshot(&self) -> proto::PacketStats {
        proto::PacketStats {
            frames_in: self.inbound.frames(),
            bytes_in: self.inbound.bytes(),
            frames_out: self.outbound.frames(),
            bytes_out: self.outbound.bytes(),
            errors: self.errors(),
        }
    }
}

/// Move frames between `device` and `stream` until the stream ends, either
/// side fails or `cancel` fires.
///
/// Tunnel frames shorter than an Ethernet header are counted as errors and
/// dropped.
///
/// # Errors
///
/// Returns the first I/O error from the stream or the device.
pub async fn pump_device(
    device: Arc<dyn FrameDevice>,
    stream: ChannelStream,
    cancel: CancellationToken,
    stats: Arc<TrafficStats>,
) -> io::Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    tokio::select! {
        () = cancel.cancelled() => Ok(()),
        result = tunnel_to_device(&mut reader, device.as_ref(), &stats) => result,
        result = device_to_tunnel(device.as_ref(), &mut writer, &stats) => result,
    }
}

async fn tunnel_to_device<R>(
    reader: &mut R,
    device: &dyn FrameDevice,
    stats: &TrafficStats,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(2048);
    while let Some(n) = read_frame(reader, &mut buf).await? {
        if n < MIN_FRAME_LEN {
            stats.record_error();
            continue;
        }
        device.send_frame(&buf[..n]).await?;
        stats.inbound.record(n);
    }
    Ok(())
}

async fn device_to_tunnel<W>(
    device: &dyn FrameDevice,
    writer: &mut W,
    stats: &TrafficStats,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        let n = device.recv_frame(&mut buf).await?;
        if n == 0 {
            continue;
        }
        write_frame(writer, &buf[..n]).await?;
        stats.outbound.record(n);
    }
}

/// Accept tunnel connections on `listener` and pump each into `device`.
///
/// A new connection replaces the current one, so a relay that reconnects
/// takes over the device. Returns when `cancel` fires or the listener closes.
pub async fn serve_device(
    mut listener: Box<dyn ChannelListener>,
    device: Arc<dyn FrameDevice>,
    cancel: CancellationToken,
    stats: Arc<TrafficStats>,
) {
    let mut current: Option<(CancellationToken, JoinHandle<()>)> = None;

    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(stream) => {
                if let Some((token, task)) = current.take() {
                    token.cancel();
                    let _ = task.await;
                }
                tracing::debug!(device = device.name(), peer = stream.peer(), "Tunnel connected");
                let token = cancel.child_token();
                let task = tokio::spawn(pump_logged(
                    Arc::clone(&device),
                    stream,
                    token.clone(),
                    Arc::clone(&stats),
                ));
                current = Some((token, task));
            }
            Err(e) if is_closed(&e) => break,
            Err(e) => {
                tracing::warn!(device = device.name(), error = %e, "Tunnel accept failed");
                stats.record_error();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    if let Some((token, task)) = current {
        token.cancel();
        let _ = task.await;
    }
    tracing::debug!(device = device.name(), "Stopped serving device");
}

async fn pump_logged(
    device: Arc<dyn FrameDevice>,
    stream: ChannelStream,
    cancel: CancellationToken,
    stats: Arc<TrafficStats>,
) {
    let name = device.name().to_string();
    match pump_device(device, stream, cancel, Arc::clone(&stats)).await {
        Ok(()) => tracing::debug!(device = %name, "Tunnel closed"),
        Err(e) => {
            stats.record_error();
            tracing::warn!(device = %name, error = %e, "Tunnel failed");
        }
    }
}
