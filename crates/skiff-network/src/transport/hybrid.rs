//! Host side of hybrid vsock.
//!
//! Firecracker and Cloud Hypervisor expose a guest's vsock device to the host
//! as a Unix socket. A connection to guest port `P` is made by connecting to
//! that socket, sending `CONNECT P\n` and reading an `OK <host_port>\n` reply;
//! afterwards the socket carries the guest stream.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::{ChannelStream, ControlChannel};

const MAX_REPLY_LEN: usize = 64;

/// Connects to guest ports through a hybrid vsock Unix socket.
#[derive(Debug, Clone)]
pub struct HybridVsockChannel {
    socket: PathBuf,
}

impl HybridVsockChannel {
    /// Use the hypervisor socket at `socket`.
    #[must_use]
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

#[async_trait]
impl ControlChannel for HybridVsockChannel {
    async fn open(&self, port: u32) -> io::Result<ChannelStream> {
        let mut stream = UnixStream::connect(&self.socket).await?;
        stream
            .write_all(format!("CONNECT {port}\n").as_bytes())
            .await?;

        // Read byte-wise so no guest data after the reply line is consumed.
        let mut reply = Vec::with_capacity(16);
        loop {
            let byte = stream.read_u8().await.map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("guest port {port} refused the connection"),
                    )
                } else {
                    e
                }
            })?;
            if byte == b'\n' {
                break;
            }
            if reply.len() == MAX_REPLY_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "hybrid vsock reply too long",
                ));
            }
            reply.push(byte);
        }

        let reply = String::from_utf8_lossy(&reply);
        if !reply.starts_with("OK") {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("hybrid vsock CONNECT {port} rejected: {reply}"),
            ));
        }
        Ok(ChannelStream::new(
            stream,
            format!("hvsock:{}:{port}", self.socket.display()),
        ))
    }

    fn describe(&self) -> String {
        format!("hvsock:{}", self.socket.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    async fn fake_hypervisor(reply: &'static [u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut line = Vec::new();
            loop {
                let byte = conn.read_u8().await.unwrap();
                if byte == b'\n' {
                    break;
                }
                line.push(byte);
            }
            assert_eq!(line, b"CONNECT 5555");
            conn.write_all(reply).await.unwrap();
            let mut echo = [0u8; 4];
            if conn.read_exact(&mut echo).await.is_ok() {
                conn.write_all(&echo).await.unwrap();
            }
        });
        (dir, path)
    }

    #[tokio::test]
    async fn handshake_then_stream() {
        let (_dir, path) = fake_hypervisor(b"OK 1073741824\n").await;
        let mut stream = HybridVsockChannel::new(&path).open(5555).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn rejected_connect_is_refused() {
        let (_dir, path) = fake_hypervisor(b"NOPE\n").await;
        let err = HybridVsockChannel::new(&path).open(5555).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn missing_socket_fails() {
        let err = HybridVsockChannel::new("/nonexistent/skiff.sock")
            .open(1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
