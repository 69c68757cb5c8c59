//! TCP control channels, for running the helper and agents outside VMs.

use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{ChannelBinder, ChannelListener, ChannelStream, ControlChannel};

fn tcp_port(port: u32, offset: i32) -> io::Result<u16> {
    i64::from(port)
        .checked_add(i64::from(offset))
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("channel port {port} with offset {offset} is not a TCP port"),
            )
        })
}

/// Connects to `host:(port + offset)`.
#[derive(Debug, Clone)]
pub struct TcpChannel {
    host: IpAddr,
    offset: i32,
}

impl TcpChannel {
    /// Connect to ports on `host` unchanged.
    #[must_use]
    pub const fn new(host: IpAddr) -> Self {
        Self { host, offset: 0 }
    }

    /// Shift every channel port by `offset` when mapping to TCP.
    #[must_use]
    pub const fn with_port_offset(mut self, offset: i32) -> Self {
        self.offset = offset;
        self
    }
}

#[async_trait]
impl ControlChannel for TcpChannel {
    async fn open(&self, port: u32) -> io::Result<ChannelStream> {
        let addr = SocketAddr::new(self.host, tcp_port(port, self.offset)?);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(ChannelStream::new(stream, format!("tcp:{addr}")))
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.host)
    }
}

/// Listens on `addr:(port + offset)`.
#[derive(Debug, Clone)]
pub struct TcpBinder {
    addr: IpAddr,
    offset: i32,
}

impl TcpBinder {
    /// Listen on `addr`.
    #[must_use]
    pub const fn new(addr: IpAddr) -> Self {
        Self { addr, offset: 0 }
    }

    /// Shift every channel port by `offset` when mapping to TCP.
    #[must_use]
    pub const fn with_port_offset(mut self, offset: i32) -> Self {
        self.offset = offset;
        self
    }
}

#[async_trait]
impl ChannelBinder for TcpBinder {
    async fn bind(&self, port: u32) -> io::Result<Box<dyn ChannelListener>> {
        let addr = SocketAddr::new(self.addr, tcp_port(port, self.offset)?);
        let listener = TcpListener::bind(addr).await?;
        tracing::debug!(%addr, port, "Listening on TCP channel");
        Ok(Box::new(TcpChannelListener { listener }))
    }
}

struct TcpChannelListener {
    listener: TcpListener,
}

#[async_trait]
impl ChannelListener for TcpChannelListener {
    async fn accept(&mut self) -> io::Result<ChannelStream> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(ChannelStream::new(stream, format!("tcp:{peer}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn port_mapping_bounds() {
        assert_eq!(tcp_port(20_000, 1_000).unwrap(), 21_000);
        assert_eq!(tcp_port(20_000, -20_000).unwrap(), 0);
        assert!(tcp_port(70_000, 0).is_err());
        assert!(tcp_port(5, -6).is_err());
    }

    #[tokio::test]
    async fn tcp_round_trip() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        // Reserve a free port, then hand it to the binder.
        let probe = std::net::TcpListener::bind((localhost, 0)).unwrap();
        let port = u32::from(probe.local_addr().unwrap().port());
        drop(probe);

        let mut listener = TcpBinder::new(localhost).bind(port).await.unwrap();
        let mut client = TcpChannel::new(localhost).open(port).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        assert!(client.peer().starts_with("tcp:127.0.0.1"));
    }
}
