//! Control channels between the host and the VMs.
//!
//! A control channel is a reliable byte stream addressed by a port number:
//! vsock on real VMs (hybrid vsock over a Unix socket on the host side), TCP
//! for development and an in-process loopback hub for tests. Both the gRPC
//! control protocols and the frame tunnel run over [`ChannelStream`]s.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub mod fd;
pub mod hybrid;
pub mod loopback;
pub mod tcp;
pub mod vsock;

pub use fd::FdStream;
pub use hybrid::HybridVsockChannel;
pub use loopback::LoopbackHub;
pub use tcp::{TcpBinder, TcpChannel};
pub use vsock::{VsockBinder, VsockChannel};

/// Any bidirectional async byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A connected control-channel stream.
pub struct ChannelStream {
    inner: Box<dyn AsyncStream>,
    peer: String,
}

impl ChannelStream {
    /// Wrap a stream; `peer` describes the other end for logs.
    pub fn new<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(stream),
            peer: peer.into(),
        }
    }

    /// Description of the other end.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Connection info exposed to tonic services.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    /// Description of the other end.
    pub peer: String,
}

impl tonic::transport::server::Connected for ChannelStream {
    type ConnectInfo = ChannelInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        ChannelInfo {
            peer: self.peer.clone(),
        }
    }
}

/// Opens streams to ports of one VM (host side).
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Connect to `port`.
    async fn open(&self, port: u32) -> io::Result<ChannelStream>;

    /// Human-readable endpoint description.
    fn describe(&self) -> String;
}

/// Accepts streams on one port (VM side).
#[async_trait]
pub trait ChannelListener: Send {
    /// Wait for the next connection.
    async fn accept(&mut self) -> io::Result<ChannelStream>;
}

/// Creates listeners (VM side).
#[async_trait]
pub trait ChannelBinder: Send + Sync {
    /// Listen on `port`.
    async fn bind(&self, port: u32) -> io::Result<Box<dyn ChannelListener>>;
}

/// Turn a listener into the connection stream tonic's server consumes.
///
/// Accept errors are logged and skipped; the stream only ends when the
/// listener is closed for good.
pub fn incoming(
    listener: Box<dyn ChannelListener>,
) -> impl Stream<Item = io::Result<ChannelStream>> + Send + 'static {
    futures::stream::unfold(listener, |mut listener| async move {
        loop {
            match listener.accept().await {
                Ok(stream) => return Some((Ok(stream), listener)),
                Err(e) if is_closed(&e) => {
                    tracing::debug!(error = %e, "Listener closed");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept control connection");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    })
}

/// Whether an accept error means the listener is gone.
#[must_use]
pub fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
    ) || err.raw_os_error() == Some(libc::EBADF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn channel_stream_passes_bytes_through() {
        let (a, b) = tokio::io::duplex(64);
        let mut a = ChannelStream::new(a, "left");
        let mut b = ChannelStream::new(b, "right");
        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(b.peer(), "right");
    }

    #[tokio::test]
    async fn incoming_yields_accepted_streams() {
        let hub = LoopbackHub::new();
        let listener = hub.binder("vm").bind(7).await.unwrap();
        let mut conns = Box::pin(incoming(listener));

        let channel = hub.channel("vm");
        let mut client = channel.open(7).await.unwrap();
        client.write_all(b"x").await.unwrap();

        let mut server = conns.next().await.unwrap().unwrap();
        let mut byte = [0u8; 1];
        server.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"x");
    }
}
