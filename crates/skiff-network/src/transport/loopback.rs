//! In-process control channels.
//!
//! A [`LoopbackHub`] stands in for the vsock fabric: listeners register under
//! `(endpoint, port)` and connections are in-memory duplex pipes. It lets a
//! daemon, helper and agents run inside one process.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ChannelBinder, ChannelListener, ChannelStream, ControlChannel};

const PIPE_CAPACITY: usize = 256 * 1024;

type Registry = Arc<Mutex<HashMap<(String, u32), mpsc::Sender<ChannelStream>>>>;

/// A set of named in-process endpoints.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    listeners: Registry,
}

impl LoopbackHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener factory for `endpoint`.
    #[must_use]
    pub fn binder(&self, endpoint: &str) -> LoopbackBinder {
        LoopbackBinder {
            listeners: Arc::clone(&self.listeners),
            endpoint: endpoint.to_string(),
        }
    }

    /// Connector to `endpoint`.
    #[must_use]
    pub fn channel(&self, endpoint: &str) -> LoopbackChannel {
        LoopbackChannel {
            listeners: Arc::clone(&self.listeners),
            endpoint: endpoint.to_string(),
        }
    }

    /// Whether something listens on `(endpoint, port)`.
    #[must_use]
    pub fn is_listening(&self, endpoint: &str, port: u32) -> bool {
        self.listeners
            .lock()
            .contains_key(&(endpoint.to_string(), port))
    }
}

/// Connects to listeners of one endpoint.
#[derive(Clone)]
pub struct LoopbackChannel {
    listeners: Registry,
    endpoint: String,
}

#[async_trait]
impl ControlChannel for LoopbackChannel {
    async fn open(&self, port: u32) -> io::Result<ChannelStream> {
        let sender = self
            .listeners
            .lock()
            .get(&(self.endpoint.clone(), port))
            .cloned()
            .ok_or_else(|| refused(&self.endpoint, port))?;

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let peer = format!("loopback:{}:{port}", self.endpoint);
        sender
            .send(ChannelStream::new(server, "loopback:client"))
            .await
            .map_err(|_| refused(&self.endpoint, port))?;
        Ok(ChannelStream::new(client, peer))
    }

    fn describe(&self) -> String {
        format!("loopback:{}", self.endpoint)
    }
}

fn refused(endpoint: &str, port: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("nothing listens on loopback:{endpoint}:{port}"),
    )
}

/// Creates listeners on one endpoint.
#[derive(Clone)]
pub struct LoopbackBinder {
    listeners: Registry,
    endpoint: String,
}

#[async_trait]
impl ChannelBinder for LoopbackBinder {
    async fn bind(&self, port: u32) -> io::Result<Box<dyn ChannelListener>> {
        let key = (self.endpoint.clone(), port);
        let (tx, rx) = mpsc::channel(16);
        {
            let mut listeners = self.listeners.lock();
            if listeners.get(&key).is_some_and(|tx| !tx.is_closed()) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("loopback:{}:{port} already bound", self.endpoint),
                ));
            }
            listeners.insert(key.clone(), tx);
        }
        Ok(Box::new(LoopbackListener {
            listeners: Arc::clone(&self.listeners),
            key,
            rx,
        }))
    }
}

struct LoopbackListener {
    listeners: Registry,
    key: (String, u32),
    rx: mpsc::Receiver<ChannelStream>,
}

#[async_trait]
impl ChannelListener for LoopbackListener {
    async fn accept(&mut self) -> io::Result<ChannelStream> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.rx.close();
        let mut listeners = self.listeners.lock();
        if listeners.get(&self.key).is_some_and(mpsc::Sender::is_closed) {
            listeners.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_without_listener_is_refused() {
        let hub = LoopbackHub::new();
        let err = hub.channel("vm").open(5555).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn dropping_listener_frees_the_port() {
        let hub = LoopbackHub::new();
        let binder = hub.binder("vm");
        let listener = binder.bind(1).await.unwrap();
        assert!(hub.is_listening("vm", 1));
        assert_eq!(
            binder.bind(1).await.err().map(|e| e.kind()),
            Some(io::ErrorKind::AddrInUse)
        );
        drop(listener);
        assert!(!hub.is_listening("vm", 1));
        assert!(binder.bind(1).await.is_ok());
    }

    #[tokio::test]
    async fn endpoints_are_isolated() {
        let hub = LoopbackHub::new();
        let mut listener = hub.binder("a").bind(9).await.unwrap();
        assert!(hub.channel("b").open(9).await.is_err());

        let mut client = hub.channel("a").open(9).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        server.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
