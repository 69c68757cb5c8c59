//! Per-attachment packet relay.
//!
//! A relay joins two frame tunnels: one to the agent inside the container VM
//! and one to the helper's switch port. Each direction runs in its own task
//! and copies length-prefixed frames unchanged. A supervisor task owns the
//! port lease and releases it only after both directions have ended and both
//! streams are closed.
//!
//! Statistics are from the container's point of view: `inbound` frames were
//! delivered to the container, `outbound` frames were sent by it.

use std::io;
use std::sync::Arc;

use skiff_common::{ContainerId, NetworkId, SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::frame::{read_frame, write_frame};
use crate::ports::{PortLease, RelayPortPair};
use crate::pump::{FrameCounters, TrafficStats};
use crate::retry::RetryPolicy;
use crate::transport::{ChannelStream, ControlChannel};

/// A relay that has a port pair but is not running yet.
#[derive(Debug)]
pub struct PacketRelay {
    container: ContainerId,
    network: NetworkId,
    lease: PortLease,
}

impl PacketRelay {
    /// Prepare a relay for one attachment on the leased ports.
    #[must_use]
    pub const fn new(container: ContainerId, network: NetworkId, lease: PortLease) -> Self {
        Self {
            container,
            network,
            lease,
        }
    }

    /// The ports this relay will use.
    #[must_use]
    pub const fn ports(&self) -> RelayPortPair {
        self.lease.pair()
    }

    /// Open both tunnel endpoints, retrying while either side is not
    /// listening yet, and start forwarding.
    ///
    /// On failure the lease is dropped and the ports are free again.
    ///
    /// # Errors
    ///
    /// `AgentUnreachable` or `HelperUnreachable` once retries are exhausted.
    pub async fn connect(
        self,
        container_channel: &dyn ControlChannel,
        helper_channel: &dyn ControlChannel,
        retry: RetryPolicy,
    ) -> SkiffResult<RelayHandle> {
        let ports = self.ports();
        let container = self.container.as_str();

        let container_stream = retry
            .run("open container relay endpoint", || async move {
                container_channel
                    .open(ports.container_port)
                    .await
                    .map_err(|e| SkiffError::AgentUnreachable {
                        container: container.to_string(),
                        message: format!("relay port {}: {e}", ports.container_port),
                    })
            })
            .await?;

        let helper_stream = retry
            .run("open helper relay endpoint", || async move {
                helper_channel
                    .open(ports.helper_port)
                    .await
                    .map_err(|e| SkiffError::HelperUnreachable {
                        message: format!("relay port {}: {e}", ports.helper_port),
                    })
            })
            .await?;

        Ok(self.start(container_stream, helper_stream))
    }

    /// Start forwarding between two already connected streams.
    #[must_use]
    pub fn start(self, container_stream: ChannelStream, helper_stream: ChannelStream) -> RelayHandle {
        let Self {
            container,
            network,
            lease,
        } = self;
        let ports = lease.pair();
        let stats = Arc::new(TrafficStats::default());
        let cancel = CancellationToken::new();

        tracing::info!(
            container = %container,
            network = %network.short(),
            container_port = ports.container_port,
            helper_port = ports.helper_port,
            container_peer = container_stream.peer(),
            helper_peer = helper_stream.peer(),
            "Relay started"
        );

        let (container_rx, container_tx) = tokio::io::split(container_stream);
        let (helper_rx, helper_tx) = tokio::io::split(helper_stream);

        let upstream = tokio::spawn(forward(
            container_rx,
            helper_tx,
            Arc::clone(&stats),
            Direction::ToHelper,
            cancel.child_token(),
        ));
        let downstream = tokio::spawn(forward(
            helper_rx,
            container_tx,
            Arc::clone(&stats),
            Direction::ToContainer,
            cancel.child_token(),
        ));

        let supervisor = tokio::spawn(supervise(container, network, lease, upstream, downstream));

        RelayHandle {
            ports,
            stats,
            cancel,
            supervisor: Some(supervisor),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToHelper,
    ToContainer,
}

impl Direction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ToHelper => "container->helper",
            Self::ToContainer => "helper->container",
        }
    }

    fn counters(self, stats: &TrafficStats) -> &FrameCounters {
        match self {
            Self::ToHelper => &stats.outbound,
            Self::ToContainer => &stats.inbound,
        }
    }
}

async fn forward<R, W>(
    mut reader: R,
    mut writer: W,
    stats: Arc<TrafficStats>,
    direction: Direction,
    cancel: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let counters = direction.counters(&stats);
    let mut buf = Vec::with_capacity(2048);
    let result = loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            next = read_frame(&mut reader, &mut buf) => next,
        };
        match next {
            Ok(Some(n)) => {
                if let Err(e) = write_frame(&mut writer, &buf[..n]).await {
                    break Err(e);
                }
                counters.record(n);
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    let _ = writer.shutdown().await;
    if result.is_err() {
        stats.record_error();
    }
    tracing::trace!(direction = direction.as_str(), "Relay direction ended");
    result
}

async fn supervise(
    container: ContainerId,
    network: NetworkId,
    lease: PortLease,
    upstream: JoinHandle<io::Result<()>>,
    downstream: JoinHandle<io::Result<()>>,
) {
    let (up, down) = tokio::join!(upstream, downstream);
    for (direction, outcome) in [
        (Direction::ToHelper, up),
        (Direction::ToContainer, down),
    ] {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                container = %container,
                network = %network.short(),
                direction = direction.as_str(),
                error = %e,
                "Relay direction failed"
            ),
            Err(e) => tracing::error!(
                container = %container,
                direction = direction.as_str(),
                error = %e,
                "Relay task panicked"
            ),
        }
    }
    let port = lease.pair().container_port;
    drop(lease);
    tracing::info!(container = %container, network = %network.short(), port, "Relay stopped");
}

/// A running relay.
///
/// Dropping the handle cancels the relay; [`RelayHandle::stop`] also waits
/// until its ports have been released.
#[derive(Debug)]
pub struct RelayHandle {
    ports: RelayPortPair,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl RelayHandle {
    /// Ports held by this relay.
    #[must_use]
    pub const fn ports(&self) -> RelayPortPair {
        self.ports
    }

    /// Live traffic counters.
    #[must_use]
    pub fn stats(&self) -> Arc<TrafficStats> {
        Arc::clone(&self.stats)
    }

    /// Whether both directions have ended and the ports are released.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.supervisor.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop forwarding, close both streams and release the ports.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                tracing::error!(error = %e, "Relay supervisor panicked");
            }
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
