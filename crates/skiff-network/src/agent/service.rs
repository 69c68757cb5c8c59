//! `NetworkAgent` gRPC service.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use skiff_common::{SkiffError, SkiffResult};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use super::{InterfaceProvisioner, InterfaceSpec};
use crate::mac::MacAddress;
use crate::naming::{device_index, device_name};
use crate::proto;
use crate::proto::network_agent_server::{NetworkAgent, NetworkAgentServer};
use crate::pump::{TrafficStats, serve_device};
use crate::rpc::error_to_status;
use crate::transport::{ChannelBinder, ChannelListener, incoming};

struct ActiveInterface {
    spec: InterfaceSpec,
    relay_port: u32,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct AgentState {
    provisioner: Arc<dyn InterfaceProvisioner>,
    binder: Arc<dyn ChannelBinder>,
    interfaces: Mutex<BTreeMap<u32, ActiveInterface>>,
    started: Instant,
}

/// The in-VM network agent.
///
/// Cloning is cheap; clones share the same interfaces.
#[derive(Clone)]
pub struct AgentService {
    state: Arc<AgentState>,
}

fn invalid(message: impl Into<String>) -> SkiffError {
    SkiffError::InvalidRequest {
        message: message.into(),
    }
}

fn parse_addr(field: &str, value: &str) -> SkiffResult<Ipv4Addr> {
    Ipv4Addr::from_str(value).map_err(|_| invalid(format!("{field}: '{value}' is not an IPv4 address")))
}

impl AgentService {
    /// Agent creating interfaces with `provisioner` and listening for relay
    /// tunnels with `binder`.
    #[must_use]
    pub fn new(provisioner: Arc<dyn InterfaceProvisioner>, binder: Arc<dyn ChannelBinder>) -> Self {
        Self {
            state: Arc::new(AgentState {
                provisioner,
                binder,
                interfaces: Mutex::new(BTreeMap::new()),
                started: Instant::now(),
            }),
        }
    }

    fn spec_from(request: &proto::ConfigureNetworkRequest) -> SkiffResult<InterfaceSpec> {
        let prefix_len = u8::try_from(request.prefix_length)
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| invalid(format!("prefix_length {} out of range", request.prefix_length)))?;
        Ok(InterfaceSpec {
            device: device_name(request.device_index),
            index: request.device_index,
            address: parse_addr("ip_address", &request.ip_address)?,
            prefix_len,
            gateway: parse_addr("gateway", &request.gateway)?,
            mac: MacAddress::from_str(&request.mac_address)?,
            default_route: request.device_index == 0,
        })
    }

    /// Create (or replace) interface `eth{device_index}` and start serving
    /// its relay port.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for malformed fields; provisioning or listen failures
    /// otherwise. Nothing is left behind on failure.
    pub async fn configure(
        &self,
        request: proto::ConfigureNetworkRequest,
    ) -> SkiffResult<proto::ConfigureNetworkResponse> {
        let spec = Self::spec_from(&request)?;
        let dns = if request.dns_server.is_empty() {
            spec.gateway
        } else {
            parse_addr("dns_server", &request.dns_server)?
        };

        let mut interfaces = self.state.interfaces.lock().await;
        if let Some(previous) = interfaces.remove(&spec.index) {
            tracing::info!(device = %previous.spec.device, "Replacing interface");
            self.teardown(previous).await;
        }

        let device = self.state.provisioner.create(&spec).await?;
        let listener: Box<dyn ChannelListener> =
            match self.state.binder.bind(request.relay_port).await {
                Ok(listener) => listener,
                Err(e) => {
                    drop(device);
                    if let Err(cleanup) = self.state.provisioner.remove(&spec.device).await {
                        tracing::warn!(device = %spec.device, error = %cleanup, "Cleanup failed");
                    }
                    return Err(SkiffError::Internal {
                        message: format!("failed to listen on relay port {}: {e}", request.relay_port),
                    });
                }
            };

        if spec.index == 0 {
            if let Err(e) = self.state.provisioner.write_resolver(dns).await {
                tracing::warn!(error = %e, "Failed to write resolver configuration");
            }
        }

        let stats = Arc::new(TrafficStats::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve_device(
            listener,
            device,
            cancel.clone(),
            Arc::clone(&stats),
        ));

        tracing::info!(
            device = %spec.device,
            address = %spec.address,
            relay_port = request.relay_port,
            "Network attached"
        );
        let response = proto::ConfigureNetworkResponse {
            device: spec.device.clone(),
            mac_address: spec.mac.to_string(),
        };
        interfaces.insert(
            spec.index,
            ActiveInterface {
                spec,
                relay_port: request.relay_port,
                stats,
                cancel,
                task,
            },
        );
        Ok(response)
    }

    /// Remove an interface by name. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for names that are not `eth{index}`.
    pub async fn detach(&self, device: &str) -> SkiffResult<bool> {
        let index = device_index(device).ok_or_else(|| invalid(format!("unknown device name '{device}'")))?;
        let removed = self.state.interfaces.lock().await.remove(&index);
        match removed {
            Some(active) => {
                self.teardown(active).await;
                tracing::info!(device, "Network detached");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn teardown(&self, active: ActiveInterface) {
        active.cancel.cancel();
        if let Err(e) = active.task.await {
            tracing::error!(device = %active.spec.device, error = %e, "Interface task panicked");
        }
        if let Err(e) = self.state.provisioner.remove(&active.spec.device).await {
            tracing::warn!(device = %active.spec.device, error = %e, "Failed to remove interface");
        }
    }

    /// Current interfaces with their counters.
    pub async fn interfaces(&self) -> Vec<proto::InterfaceInfo> {
        self.state
            .interfaces
            .lock()
            .await
            .values()
            .map(|active| proto::InterfaceInfo {
                device: active.spec.device.clone(),
                device_index: active.spec.index,
                ip_address: active.spec.address.to_string(),
                prefix_length: u32::from(active.spec.prefix_len),
                gateway: active.spec.gateway.to_string(),
                mac_address: active.spec.mac.to_string(),
                relay_port: active.relay_port,
                stats: Some(active.stats.snapshot()),
            })
            .collect()
    }

    /// Version, interface count and uptime.
    pub async fn status(&self) -> proto::GetStatusResponse {
        let active = self.state.interfaces.lock().await.len();
        proto::GetStatusResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_interfaces: u32::try_from(active).unwrap_or(u32::MAX),
            uptime_seconds: self.state.started.elapsed().as_secs(),
        }
    }

    /// Tear down every interface.
    pub async fn shutdown(&self) {
        let all = std::mem::take(&mut *self.state.interfaces.lock().await);
        for active in all.into_values() {
            self.teardown(active).await;
        }
    }

    /// Wrap the agent in its tonic service.
    #[must_use]
    pub fn into_server(self) -> NetworkAgentServer<Self> {
        NetworkAgentServer::new(self)
    }

    /// Serve the control protocol on `listener` until `shutdown` resolves,
    /// then remove all interfaces.
    ///
    /// # Errors
    ///
    /// Returns the transport error that stopped the server.
    pub async fn serve(
        self,
        listener: Box<dyn ChannelListener>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> SkiffResult<()> {
        let agent = self.clone();
        let result = tonic::transport::Server::builder()
            .add_service(self.into_server())
            .serve_with_incoming_shutdown(incoming(listener), shutdown)
            .await;
        agent.shutdown().await;
        result.map_err(|e| SkiffError::Internal {
            message: format!("agent control server failed: {e}"),
        })
    }
}

#[tonic::async_trait]
impl NetworkAgent for AgentService {
    async fn configure_network(
        &self,
        request: Request<proto::ConfigureNetworkRequest>,
    ) -> Result<Response<proto::ConfigureNetworkResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(index = req.device_index, ip = %req.ip_address, "ConfigureNetwork");
        self.configure(req)
            .await
            .map(Response::new)
            .map_err(|e| error_to_status(&e))
    }

    async fn detach_network(
        &self,
        request: Request<proto::DetachNetworkRequest>,
    ) -> Result<Response<proto::DetachNetworkResponse>, Status> {
        let req = request.into_inner();
        let removed = self.detach(&req.device).await.map_err(|e| error_to_status(&e))?;
        Ok(Response::new(proto::DetachNetworkResponse { removed }))
    }

    async fn list_interfaces(
        &self,
        _request: Request<proto::ListInterfacesRequest>,
    ) -> Result<Response<proto::ListInterfacesResponse>, Status> {
        Ok(Response::new(proto::ListInterfacesResponse {
            interfaces: self.interfaces().await,
        }))
    }

    async fn get_status(
        &self,
        _request: Request<proto::GetStatusRequest>,
    ) -> Result<Response<proto::GetStatusResponse>, Status> {
        Ok(Response::new(self.status().await))
    }
}
