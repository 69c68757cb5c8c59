//! Frame-oriented network devices.
//!
//! A [`FrameDevice`] moves whole Ethernet frames: a TAP interface inside a
//! VM, a switch port in the helper, or an in-memory pipe.

use std::io;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

/// A device that sends and receives whole Ethernet frames.
#[async_trait]
pub trait FrameDevice: Send + Sync {
    /// Kernel or logical interface name.
    fn name(&self) -> &str;

    /// Receive one frame into `buf`, returning its length. Longer frames are
    /// truncated to `buf.len()`.
    async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Transmit one frame.
    async fn send_frame(&self, frame: &[u8]) -> io::Result<()>;
}

/// One end of an in-memory point-to-point link.
pub struct MemoryDevice {
    name: String,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl MemoryDevice {
    /// Frames buffered per direction before senders wait.
    pub const QUEUE_LEN: usize = 256;

    /// Create two connected ends: frames sent on one arrive at the other.
    #[must_use]
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(Self::QUEUE_LEN);
        let (b_tx, a_rx) = mpsc::channel(Self::QUEUE_LEN);
        (
            Self {
                name: a.into(),
                tx: a_tx,
                rx: Mutex::new(a_rx),
            },
            Self {
                name: b.into(),
                tx: b_tx,
                rx: Mutex::new(b_rx),
            },
        )
    }

    /// Send without waiting; drops the frame if the peer's queue is full.
    pub fn try_send_frame(&self, frame: &[u8]) -> bool {
        self.tx.try_send(frame.to_vec()).is_ok()
    }
}

impl std::fmt::Debug for MemoryDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDevice")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FrameDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let frame = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "link peer closed"))?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }

    async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link peer closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_link() {
        let (a, b) = MemoryDevice::pair("a", "b");
        a.send_frame(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(b.recv_frame(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(b.name(), "b");
    }

    #[tokio::test]
    async fn closed_peer_is_broken_pipe() {
        let (a, b) = MemoryDevice::pair("a", "b");
        drop(b);
        let err = a.send_frame(&[0]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let err = a.recv_frame(&mut [0u8; 4]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
