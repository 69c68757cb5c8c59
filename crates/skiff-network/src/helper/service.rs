//! `NetworkControl` gRPC service.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use ipnet::Ipv4Net;
use skiff_common::{SkiffError, SkiffResult};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use super::SwitchBackend;
use super::dns::{DnsRecord, NameResolutionManager};
use super::nat::{ForwardRule, PacketFilter};
use crate::mac::MacAddress;
use crate::naming::{BridgeNaming, port_name};
use crate::proto;
use crate::publish::{self, Protocol, PublishedPort};
use crate::proto::network_control_server::{NetworkControl, NetworkControlServer};
use crate::pump::{TrafficStats, serve_device};
use crate::rpc::error_to_status;
use crate::transport::{ChannelBinder, ChannelListener, incoming};

/// Upper bound on bridge name candidates tried for one network.
const MAX_NAME_CANDIDATES: u32 = 64;

struct PortState {
    port_name: String,
    helper_port: u32,
    address: Ipv4Addr,
    mac: MacAddress,
    published: Vec<PublishedPort>,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct BridgeState {
    name: String,
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    ports: BTreeMap<String, PortState>,
}

struct HelperState {
    backend: Arc<dyn SwitchBackend>,
    binder: Arc<dyn ChannelBinder>,
    dns: Arc<NameResolutionManager>,
    filter: Arc<dyn PacketFilter>,
    naming: BridgeNaming,
    bridges: Mutex<BTreeMap<String, BridgeState>>,
    started: Instant,
}

/// The network helper: switches, ports, container names and address
/// translation.
///
/// Cloning is cheap; clones share the same bridges.
#[derive(Clone)]
pub struct HelperService {
    state: Arc<HelperState>,
}

fn invalid(message: impl Into<String>) -> SkiffError {
    SkiffError::InvalidRequest {
        message: message.into(),
    }
}

fn required<'a>(field: &str, value: &'a str) -> SkiffResult<&'a str> {
    if value.is_empty() {
        Err(invalid(format!("{field} is required")))
    } else {
        Ok(value)
    }
}

fn forward_rule(network_id: &str, address: Ipv4Addr, port: PublishedPort) -> ForwardRule {
    ForwardRule {
        network_id: network_id.to_string(),
        address,
        port,
    }
}

/// The attachment already holding `key` on this helper, other than
/// `container` on `network_id`.
fn port_holder<'a>(
    bridges: &'a BTreeMap<String, BridgeState>,
    key: (Protocol, u16),
    container: &str,
    network_id: &str,
) -> Option<&'a str> {
    bridges.iter().find_map(|(id, bridge)| {
        bridge
            .ports
            .iter()
            .filter(|(c, _)| !(id == network_id && c.as_str() == container))
            .find(|(_, port)| port.published.iter().any(|p| p.host_key() == key))
            .map(|(c, _)| c.as_str())
    })
}

fn check_ports_free(
    bridges: &BTreeMap<String, BridgeState>,
    ports: &[PublishedPort],
    container: &str,
    network_id: &str,
) -> SkiffResult<()> {
    for port in ports {
        if let Some(holder) = port_holder(bridges, port.host_key(), container, network_id) {
            return Err(SkiffError::PortAllocated {
                port: format!("{}/{}", port.host_port, port.protocol),
                container: holder.to_string(),
            });
        }
    }
    Ok(())
}

impl HelperService {
    /// Helper driving `backend`, accepting relay tunnels with `binder`,
    /// serving names through `dns` and translating addresses with `filter`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn SwitchBackend>,
        binder: Arc<dyn ChannelBinder>,
        dns: Arc<NameResolutionManager>,
        filter: Arc<dyn PacketFilter>,
        naming: BridgeNaming,
    ) -> Self {
        Self {
            state: Arc::new(HelperState {
                backend,
                binder,
                dns,
                filter,
                naming,
                bridges: Mutex::new(BTreeMap::new()),
                started: Instant::now(),
            }),
        }
    }

    fn pick_name(&self, network_id: &str, bridges: &BTreeMap<String, BridgeState>) -> SkiffResult<String> {
        (0..MAX_NAME_CANDIDATES)
            .map(|salt| self.state.naming.candidate(network_id, salt))
            .find(|name| !bridges.values().any(|b| &b.name == name))
            .ok_or_else(|| SkiffError::BridgeOperationFailed {
                message: format!("no free bridge name for network {network_id}"),
            })
    }

    /// Create the switch, name zone and masquerading for a network. Creating
    /// an existing bridge returns its name.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for malformed fields; backend or resolver failures
    /// otherwise, after undoing the partial work.
    pub async fn create_bridge(&self, request: &proto::CreateBridgeRequest) -> SkiffResult<String> {
        let network_id = required("network_id", &request.network_id)?;
        let subnet = Ipv4Net::from_str(&request.subnet)
            .map_err(|_| invalid(format!("subnet: '{}' is not an IPv4 CIDR", request.subnet)))?
            .trunc();
        let gateway = Ipv4Addr::from_str(&request.gateway)
            .map_err(|_| invalid(format!("gateway: '{}' is not an IPv4 address", request.gateway)))?;
        if !subnet.contains(&gateway) {
            return Err(invalid(format!("gateway {gateway} is outside {subnet}")));
        }

        let mut bridges = self.state.bridges.lock().await;
        if let Some(existing) = bridges.get(network_id) {
            return Ok(existing.name.clone());
        }

        let name = self.pick_name(network_id, &bridges)?;
        self.state
            .backend
            .create_bridge(&name, gateway, subnet.prefix_len())
            .await?;
        let ready = async {
            self.state.dns.add_zone(network_id, gateway).await?;
            if let Err(e) = self.state.filter.masquerade(network_id, subnet).await {
                if let Err(cleanup) = self.state.dns.remove_zone(network_id).await {
                    tracing::warn!(network = network_id, error = %cleanup, "Cleanup failed");
                }
                return Err(e);
            }
            Ok::<(), SkiffError>(())
        };
        if let Err(e) = ready.await {
            if let Err(cleanup) = self.state.backend.delete_bridge(&name).await {
                tracing::warn!(bridge = %name, error = %cleanup, "Cleanup failed");
            }
            return Err(e);
        }

        tracing::info!(network = network_id, bridge = %name, %subnet, "Bridge ready");
        bridges.insert(
            network_id.to_string(),
            BridgeState {
                name: name.clone(),
                subnet,
                gateway,
                ports: BTreeMap::new(),
            },
        );
        Ok(name)
    }

    /// Remove a network's switch, ports, names and masquerading. Returns
    /// whether it existed.
    ///
    /// # Errors
    ///
    /// Backend failures removing the bridge. The network stays known, with
    /// its ports unplugged, so the deletion can be retried.
    pub async fn delete_bridge(&self, network_id: &str) -> SkiffResult<bool> {
        let mut bridges = self.state.bridges.lock().await;
        let Some(bridge) = bridges.get_mut(network_id) else {
            return Ok(false);
        };
        let name = bridge.name.clone();
        let subnet = bridge.subnet;
        for (container, port) in std::mem::take(&mut bridge.ports) {
            self.unplug(&name, network_id, &container, port).await;
        }
        self.state.backend.delete_bridge(&name).await?;
        bridges.remove(network_id);

        if let Err(e) = self.state.dns.remove_zone(network_id).await {
            tracing::warn!(network = network_id, error = %e, "Failed to remove name zone");
        }
        if let Err(e) = self.state.filter.remove_masquerade(network_id, subnet).await {
            tracing::warn!(network = network_id, error = %e, "Failed to remove masquerading");
        }
        tracing::info!(network = network_id, bridge = %name, "Bridge deleted");
        Ok(true)
    }

    /// Plug a container into a network's switch, wait for its relay on
    /// `helper_port` and forward its published ports. An existing attachment
    /// is replaced.
    ///
    /// # Errors
    ///
    /// `NetworkNotFound` when the bridge does not exist, `InvalidRequest`
    /// for malformed fields, `PortAllocated` when another attachment
    /// publishes the same host port; port, listen, name or filter failures
    /// otherwise, after undoing the partial work.
    pub async fn attach(
        &self,
        request: &proto::AttachContainerRequest,
    ) -> SkiffResult<proto::AttachContainerResponse> {
        let container = required("container_id", &request.container_id)?;
        let network_id = required("network_id", &request.network_id)?;
        let address = Ipv4Addr::from_str(&request.ip_address)
            .map_err(|_| invalid(format!("ip_address: '{}' is not an IPv4 address", request.ip_address)))?;
        let mac = MacAddress::from_str(&request.mac_address)?;
        let published = publish::parse_mappings(&request.port_mappings)?;

        let mut bridges = self.state.bridges.lock().await;
        check_ports_free(&bridges, &published, container, network_id)?;
        let bridge = bridges
            .get_mut(network_id)
            .ok_or_else(|| SkiffError::NetworkNotFound {
                id: network_id.to_string(),
            })?;
        if !bridge.subnet.contains(&address) {
            return Err(invalid(format!("{address} is outside {}", bridge.subnet)));
        }
        let replaced = bridge.ports.remove(container);
        if let Some(previous) = replaced {
            tracing::info!(container, network = network_id, "Replacing attachment");
            self.unplug(&bridge.name, network_id, container, previous).await;
        }

        let port = port_name(container, network_id);
        let device = self.state.backend.add_port(&bridge.name, &port, mac).await?;

        let listener: Box<dyn ChannelListener> = match self.state.binder.bind(request.helper_port).await {
            Ok(listener) => listener,
            Err(e) => {
                drop(device);
                self.remove_port(&bridge.name, &port).await;
                return Err(SkiffError::BridgeOperationFailed {
                    message: format!("failed to listen on helper port {}: {e}", request.helper_port),
                });
            }
        };

        let record = dns_record(request, address);
        let named = record.is_some();
        let result = match record {
            Some(record) => self.state.dns.add_record(network_id, container, record).await,
            // A replaced attachment may have been named; this one is not.
            None => self.state.dns.remove_record(network_id, container).await.map(drop),
        };
        if let Err(e) = result {
            drop(listener);
            drop(device);
            self.remove_port(&bridge.name, &port).await;
            return Err(e);
        }

        if let Err(e) = self.forward_all(network_id, address, &published).await {
            drop(listener);
            drop(device);
            if named {
                if let Err(cleanup) = self.state.dns.remove_record(network_id, container).await {
                    tracing::warn!(container, network = network_id, error = %cleanup, "Cleanup failed");
                }
            }
            self.remove_port(&bridge.name, &port).await;
            return Err(e);
        }

        let stats = Arc::new(TrafficStats::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve_device(listener, device, cancel.clone(), Arc::clone(&stats)));

        tracing::info!(
            container,
            network = network_id,
            port = %port,
            helper_port = request.helper_port,
            %mac,
            published = published.len(),
            "Container attached"
        );
        let response = proto::AttachContainerResponse {
            bridge_name: bridge.name.clone(),
            port_name: port.clone(),
        };
        bridge.ports.insert(
            container.to_string(),
            PortState {
                port_name: port,
                helper_port: request.helper_port,
                address,
                mac,
                published,
                stats,
                cancel,
                task,
            },
        );
        Ok(response)
    }

    /// Unplug a container from a network. Returns whether it was attached.
    pub async fn detach(&self, container_id: &str, network_id: &str) -> bool {
        let mut bridges = self.state.bridges.lock().await;
        let Some(bridge) = bridges.get_mut(network_id) else {
            return false;
        };
        let Some(port) = bridge.ports.remove(container_id) else {
            return false;
        };
        let name = bridge.name.clone();
        self.unplug(&name, network_id, container_id, port).await;
        if let Err(e) = self.state.dns.remove_record(network_id, container_id).await {
            tracing::warn!(container = container_id, network = network_id, error = %e, "Failed to remove name");
        }
        tracing::info!(container = container_id, network = network_id, "Container detached");
        true
    }

    /// Forward every port, removing the ones already forwarded if one fails.
    async fn forward_all(&self, network_id: &str, address: Ipv4Addr, ports: &[PublishedPort]) -> SkiffResult<()> {
        for (done, port) in ports.iter().enumerate() {
            if let Err(e) = self.state.filter.forward(&forward_rule(network_id, address, *port)).await {
                for installed in &ports[..done] {
                    self.unforward(network_id, address, *installed).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn unforward(&self, network_id: &str, address: Ipv4Addr, port: PublishedPort) {
        if let Err(e) = self
            .state
            .filter
            .remove_forward(&forward_rule(network_id, address, port))
            .await
        {
            tracing::warn!(network = network_id, %port, error = %e, "Failed to remove port forward");
        }
    }

    /// Forward another host port to an attached container. Returns whether
    /// the mapping is new.
    ///
    /// # Errors
    ///
    /// `NetworkNotFound`/`NotConnected` for an unknown attachment,
    /// `PortAllocated` when the host port is taken, filter failures
    /// otherwise.
    pub async fn add_port_mapping(
        &self,
        container_id: &str,
        network_id: &str,
        port: PublishedPort,
    ) -> SkiffResult<bool> {
        let mut bridges = self.state.bridges.lock().await;
        let not_connected = || SkiffError::NotConnected {
            container: container_id.to_string(),
            network: network_id.to_string(),
        };
        let attached = bridges
            .get(network_id)
            .ok_or_else(|| SkiffError::NetworkNotFound {
                id: network_id.to_string(),
            })?
            .ports
            .get(container_id)
            .ok_or_else(not_connected)?;
        if attached.published.contains(&port) {
            return Ok(false);
        }
        if let Some(own) = attached.published.iter().find(|p| p.host_key() == port.host_key()) {
            return Err(SkiffError::PortAllocated {
                port: format!("{}/{} (as {own})", port.host_port, port.protocol),
                container: container_id.to_string(),
            });
        }
        let address = attached.address;
        check_ports_free(&bridges, &[port], container_id, network_id)?;
        self.state
            .filter
            .forward(&forward_rule(network_id, address, port))
            .await?;
        if let Some(attached) = bridges
            .get_mut(network_id)
            .and_then(|bridge| bridge.ports.get_mut(container_id))
        {
            attached.published.push(port);
        }
        tracing::info!(container = container_id, network = network_id, %port, "Port published");
        Ok(true)
    }

    /// Stop forwarding a host port. Returns whether it was forwarded.
    ///
    /// # Errors
    ///
    /// Filter failures; the mapping is kept.
    pub async fn remove_port_mapping(
        &self,
        container_id: &str,
        network_id: &str,
        protocol: Protocol,
        host_port: u16,
    ) -> SkiffResult<bool> {
        let mut bridges = self.state.bridges.lock().await;
        let Some(attached) = bridges
            .get_mut(network_id)
            .and_then(|bridge| bridge.ports.get_mut(container_id))
        else {
            return Ok(false);
        };
        let Some(index) = attached
            .published
            .iter()
            .position(|p| p.host_key() == (protocol, host_port))
        else {
            return Ok(false);
        };
        let port = attached.published[index];
        self.state
            .filter
            .remove_forward(&forward_rule(network_id, attached.address, port))
            .await?;
        attached.published.remove(index);
        tracing::info!(container = container_id, network = network_id, %port, "Port unpublished");
        Ok(true)
    }

    async fn unplug(&self, bridge: &str, network_id: &str, container: &str, port: PortState) {
        for published in &port.published {
            self.unforward(network_id, port.address, *published).await;
        }
        port.cancel.cancel();
        if let Err(e) = port.task.await {
            tracing::error!(container, port = %port.port_name, error = %e, "Port task panicked");
        }
        tracing::debug!(
            container,
            port = %port.port_name,
            helper_port = port.helper_port,
            mac = %port.mac,
            frames_in = port.stats.inbound.frames(),
            frames_out = port.stats.outbound.frames(),
            "Port unplugged"
        );
        self.remove_port(bridge, &port.port_name).await;
    }

    async fn remove_port(&self, bridge: &str, port: &str) {
        if let Err(e) = self.state.backend.remove_port(bridge, port).await {
            tracing::warn!(bridge, port, error = %e, "Failed to remove port");
        }
    }

    /// Bridges with their attached containers.
    pub async fn bridges(&self) -> Vec<proto::BridgeInfo> {
        self.state
            .bridges
            .lock()
            .await
            .iter()
            .map(|(id, bridge)| proto::BridgeInfo {
                network_id: id.clone(),
                bridge_name: bridge.name.clone(),
                subnet: bridge.subnet.to_string(),
                gateway: bridge.gateway.to_string(),
                containers: bridge.ports.keys().cloned().collect(),
            })
            .collect()
    }

    /// Backend and resolver health.
    pub async fn health(&self) -> proto::GetHealthResponse {
        let bridge_count = self.state.bridges.lock().await.len();
        let (healthy, backend_status) = match self.state.backend.status().await {
            Ok(status) => (true, status),
            Err(e) => (false, e.to_string()),
        };
        proto::GetHealthResponse {
            healthy,
            backend: self.state.backend.name().to_string(),
            backend_status,
            resolver_running: self.state.dns.is_running(),
            uptime_seconds: self.state.started.elapsed().as_secs(),
            bridge_count: u32::try_from(bridge_count).unwrap_or(u32::MAX),
            packet_filter: self.state.filter.name().to_string(),
        }
    }

    /// Resolve a container name.
    pub async fn resolve(&self, hostname: &str, networks: &[String]) -> proto::ResolveNameResponse {
        match self.state.dns.resolve(hostname, networks).await {
            Some((address, network_id)) => proto::ResolveNameResponse {
                found: true,
                ip_address: address.to_string(),
                network_id,
            },
            None => proto::ResolveNameResponse::default(),
        }
    }

    /// Networks a container is plugged into.
    pub async fn container_networks(&self, container_id: &str) -> Vec<String> {
        self.state
            .bridges
            .lock()
            .await
            .iter()
            .filter(|(_, bridge)| bridge.ports.contains_key(container_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Delete every bridge and stop the resolver.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.state.bridges.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.delete_bridge(&id).await {
                tracing::warn!(network = %id, error = %e, "Failed to delete bridge");
            }
        }
        if let Err(e) = self.state.dns.shutdown().await {
            tracing::warn!(error = %e, "Failed to stop resolver");
        }
    }

    /// Wrap the helper in its tonic service.
    #[must_use]
    pub fn into_server(self) -> NetworkControlServer<Self> {
        NetworkControlServer::new(self)
    }

    /// Serve the control protocol on `listener` until `shutdown` resolves,
    /// then tear everything down.
    ///
    /// # Errors
    ///
    /// Returns the transport error that stopped the server.
    pub async fn serve(
        self,
        listener: Box<dyn ChannelListener>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> SkiffResult<()> {
        let helper = self.clone();
        let result = tonic::transport::Server::builder()
            .add_service(self.into_server())
            .serve_with_incoming_shutdown(incoming(listener), shutdown)
            .await;
        helper.shutdown().await;
        result.map_err(|e| SkiffError::Internal {
            message: format!("helper control server failed: {e}"),
        })
    }
}

/// The name record for an attachment. Without a hostname the first alias
/// is the primary name; without either the container gets no names.
fn dns_record(request: &proto::AttachContainerRequest, address: Ipv4Addr) -> Option<DnsRecord> {
    let mut names = std::iter::once(request.hostname.as_str())
        .chain(request.aliases.iter().map(String::as_str))
        .filter(|n| !n.is_empty());
    let hostname = names.next()?.to_string();
    let aliases = names
        .filter(|n| !n.eq_ignore_ascii_case(&hostname))
        .map(ToString::to_string)
        .collect();
    Some(DnsRecord {
        hostname,
        address,
        aliases,
    })
}

#[tonic::async_trait]
impl NetworkControl for HelperService {
    async fn create_bridge(
        &self,
        request: Request<proto::CreateBridgeRequest>,
    ) -> Result<Response<proto::CreateBridgeResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(network = %req.network_id, subnet = %req.subnet, "CreateBridge");
        let bridge_name = HelperService::create_bridge(self, &req)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(proto::CreateBridgeResponse { bridge_name }))
    }

    async fn delete_bridge(
        &self,
        request: Request<proto::DeleteBridgeRequest>,
    ) -> Result<Response<proto::DeleteBridgeResponse>, Status> {
        let req = request.into_inner();
        let existed = HelperService::delete_bridge(self, &req.network_id)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(proto::DeleteBridgeResponse { existed }))
    }

    async fn attach_container(
        &self,
        request: Request<proto::AttachContainerRequest>,
    ) -> Result<Response<proto::AttachContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(container = %req.container_id, network = %req.network_id, "AttachContainer");
        self.attach(&req)
            .await
            .map(Response::new)
            .map_err(|e| error_to_status(&e))
    }

    async fn detach_container(
        &self,
        request: Request<proto::DetachContainerRequest>,
    ) -> Result<Response<proto::DetachContainerResponse>, Status> {
        let req = request.into_inner();
        let existed = self.detach(&req.container_id, &req.network_id).await;
        Ok(Response::new(proto::DetachContainerResponse { existed }))
    }

    async fn list_bridges(
        &self,
        _request: Request<proto::ListBridgesRequest>,
    ) -> Result<Response<proto::ListBridgesResponse>, Status> {
        Ok(Response::new(proto::ListBridgesResponse {
            bridges: self.bridges().await,
        }))
    }

    async fn get_health(
        &self,
        _request: Request<proto::GetHealthRequest>,
    ) -> Result<Response<proto::GetHealthResponse>, Status> {
        Ok(Response::new(self.health().await))
    }

    async fn resolve_name(
        &self,
        request: Request<proto::ResolveNameRequest>,
    ) -> Result<Response<proto::ResolveNameResponse>, Status> {
        let req = request.into_inner();
        Ok(Response::new(self.resolve(&req.hostname, &req.network_ids).await))
    }

    async fn get_container_networks(
        &self,
        request: Request<proto::GetContainerNetworksRequest>,
    ) -> Result<Response<proto::GetContainerNetworksResponse>, Status> {
        let req = request.into_inner();
        Ok(Response::new(proto::GetContainerNetworksResponse {
            network_ids: self.container_networks(&req.container_id).await,
        }))
    }

    async fn add_port_mapping(
        &self,
        request: Request<proto::PortMappingRequest>,
    ) -> Result<Response<proto::PortMappingResponse>, Status> {
        let req = request.into_inner();
        let mapping = req
            .mapping
            .ok_or_else(|| Status::invalid_argument("mapping is required"))?;
        let port = PublishedPort::from_proto(&mapping).map_err(|e| error_to_status(&e))?;
        let changed = HelperService::add_port_mapping(self, &req.container_id, &req.network_id, port)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(proto::PortMappingResponse { changed }))
    }

    async fn remove_port_mapping(
        &self,
        request: Request<proto::PortMappingRequest>,
    ) -> Result<Response<proto::PortMappingResponse>, Status> {
        let req = request.into_inner();
        let mapping = req
            .mapping
            .ok_or_else(|| Status::invalid_argument("mapping is required"))?;
        let protocol: Protocol = mapping.protocol.parse().map_err(|e| error_to_status(&e))?;
        let host_port = u16::try_from(mapping.host_port)
            .map_err(|_| Status::invalid_argument(format!("port {} out of range", mapping.host_port)))?;
        let changed =
            HelperService::remove_port_mapping(self, &req.container_id, &req.network_id, protocol, host_port)
                .await
                .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(proto::PortMappingResponse { changed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_frame};
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use ipnet::Ipv4Net;

    use crate::device::FrameDevice;
    use crate::helper::{LearningSwitch, NullFilter, NullResolver, ResolverProcess};
    use crate::transport::{ControlChannel, LoopbackHub};

    const NET: &str = "4e6574776f726b31";

    struct Fixture {
        helper: HelperService,
        hub: LoopbackHub,
        filter: Arc<NullFilter>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(
        backend: Arc<dyn SwitchBackend>,
        filter: Arc<dyn PacketFilter>,
    ) -> (HelperService, LoopbackHub, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let hub = LoopbackHub::new();
        let dns = NameResolutionManager::new(
            dir.path(),
            Vec::new(),
            Arc::new(NullResolver::default()) as Arc<dyn ResolverProcess>,
        );
        let helper = HelperService::new(
            backend,
            Arc::new(hub.binder("helper")),
            Arc::new(dns),
            filter,
            BridgeNaming::default(),
        );
        (helper, hub, dir)
    }

    fn fixture() -> Fixture {
        let filter = Arc::new(NullFilter::default());
        let (helper, hub, dir) = fixture_with(
            Arc::new(LearningSwitch::new()),
            Arc::clone(&filter) as Arc<dyn PacketFilter>,
        );
        Fixture {
            helper,
            hub,
            filter,
            _dir: dir,
        }
    }

    /// A learning switch whose bridge removal fails until allowed.
    #[derive(Default)]
    struct StuckBridges {
        inner: LearningSwitch,
        stuck: AtomicBool,
    }

    #[async_trait]
    impl SwitchBackend for StuckBridges {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn create_bridge(&self, bridge: &str, gateway: Ipv4Addr, prefix_len: u8) -> SkiffResult<()> {
            self.inner.create_bridge(bridge, gateway, prefix_len).await
        }

        async fn delete_bridge(&self, bridge: &str) -> SkiffResult<()> {
            if self.stuck.load(Ordering::SeqCst) {
                return Err(SkiffError::BridgeOperationFailed {
                    message: format!("{bridge}: device or resource busy"),
                });
            }
            self.inner.delete_bridge(bridge).await
        }

        async fn add_port(&self, bridge: &str, port: &str, mac: MacAddress) -> SkiffResult<Arc<dyn FrameDevice>> {
            self.inner.add_port(bridge, port, mac).await
        }

        async fn remove_port(&self, bridge: &str, port: &str) -> SkiffResult<()> {
            self.inner.remove_port(bridge, port).await
        }

        async fn status(&self) -> SkiffResult<String> {
            self.inner.status().await
        }
    }

    /// A filter that refuses to forward one host port.
    struct RefusingFilter {
        inner: NullFilter,
        refused: u16,
    }

    #[async_trait]
    impl PacketFilter for RefusingFilter {
        fn name(&self) -> &'static str {
            "refusing"
        }

        async fn masquerade(&self, network_id: &str, subnet: Ipv4Net) -> SkiffResult<()> {
            self.inner.masquerade(network_id, subnet).await
        }

        async fn remove_masquerade(&self, network_id: &str, subnet: Ipv4Net) -> SkiffResult<()> {
            self.inner.remove_masquerade(network_id, subnet).await
        }

        async fn forward(&self, rule: &ForwardRule) -> SkiffResult<()> {
            if rule.port.host_port == self.refused {
                return Err(SkiffError::BridgeOperationFailed {
                    message: "packet filter: table locked".into(),
                });
            }
            self.inner.forward(rule).await
        }

        async fn remove_forward(&self, rule: &ForwardRule) -> SkiffResult<()> {
            self.inner.remove_forward(rule).await
        }
    }

    fn create(network_id: &str) -> proto::CreateBridgeRequest {
        proto::CreateBridgeRequest {
            network_id: network_id.to_string(),
            subnet: "172.30.0.0/24".to_string(),
            gateway: "172.30.0.1".to_string(),
        }
    }

    fn attach(container: &str, last: u8, helper_port: u32) -> proto::AttachContainerRequest {
        proto::AttachContainerRequest {
            container_id: container.to_string(),
            network_id: NET.to_string(),
            helper_port,
            mac_address: format!("02:42:ac:1e:00:{last:02x}"),
            ip_address: format!("172.30.0.{last}"),
            hostname: container.to_string(),
            aliases: vec![format!("{container}-alias")],
            port_mappings: Vec::new(),
        }
    }

    fn tcp(host_port: u16, container_port: u16) -> PublishedPort {
        PublishedPort::new(Protocol::Tcp, host_port, container_port).unwrap()
    }

    fn frame(dst: u8, src: u8) -> Vec<u8> {
        let mut f = vec![0x02, 0x42, 0, 0, 0, dst, 0x02, 0x42, 0, 0, 0, src, 0x08, 0x00];
        f.resize(64, 0xee);
        f
    }

    #[test_log::test(tokio::test)]
    async fn create_bridge_is_idempotent() {
        let f = fixture();
        let first = f.helper.create_bridge(&create(NET)).await.unwrap();
        let second = f.helper.create_bridge(&create(NET)).await.unwrap();
        assert_eq!(first, second);
        assert!(first.len() <= crate::naming::MAX_IFNAME_LEN);
        assert!(f.helper.state.dns.is_running());

        let other = f.helper.create_bridge(&create("0ther")).await.unwrap();
        assert_ne!(first, other);
        assert_eq!(f.helper.bridges().await.len(), 2);
        assert_eq!(f.helper.health().await.bridge_count, 2);
    }

    #[tokio::test]
    async fn bad_bridge_requests_are_rejected() {
        let f = fixture();
        let mut req = create(NET);
        req.gateway = "10.0.0.1".to_string();
        assert!(matches!(
            f.helper.create_bridge(&req).await,
            Err(SkiffError::InvalidRequest { .. })
        ));
        req.subnet = "nope".to_string();
        assert!(f.helper.create_bridge(&req).await.is_err());
        assert!(f.helper.bridges().await.is_empty());
    }

    #[tokio::test]
    async fn attach_requires_bridge() {
        let f = fixture();
        assert!(matches!(
            f.helper.attach(&attach("web", 2, 30_000)).await,
            Err(SkiffError::NetworkNotFound { .. })
        ));
        assert!(!f.hub.is_listening("helper", 30_000));
    }

    #[test_log::test(tokio::test)]
    async fn attached_ports_switch_frames() {
        let f = fixture();
        f.helper.create_bridge(&create(NET)).await.unwrap();
        let a = f.helper.attach(&attach("web", 2, 30_000)).await.unwrap();
        f.helper.attach(&attach("db", 3, 30_001)).await.unwrap();
        assert_eq!(a.port_name.len(), 14);

        let channel = f.hub.channel("helper");
        let mut web = channel.open(30_000).await.unwrap();
        let mut db = channel.open(30_001).await.unwrap();

        write_frame(&mut web, &frame(0xff, 2)).await.unwrap();
        let mut got = Vec::new();
        assert_eq!(read_frame(&mut db, &mut got).await.unwrap(), Some(64));
        assert_eq!(got, frame(0xff, 2));

        write_frame(&mut db, &frame(2, 3)).await.unwrap();
        assert_eq!(read_frame(&mut web, &mut got).await.unwrap(), Some(64));
        assert_eq!(got, frame(2, 3));

        let resolved = f.helper.resolve("WEB-alias", &[]).await;
        assert!(resolved.found);
        assert_eq!(resolved.ip_address, "172.30.0.2");
        assert_eq!(f.helper.container_networks("db").await, vec![NET.to_string()]);
    }

    #[tokio::test]
    async fn detach_and_delete_are_idempotent() {
        let f = fixture();
        f.helper.create_bridge(&create(NET)).await.unwrap();
        f.helper.attach(&attach("web", 2, 30_000)).await.unwrap();

        assert!(f.helper.detach("web", NET).await);
        assert!(!f.helper.detach("web", NET).await);
        assert!(!f.hub.is_listening("helper", 30_000));
        assert!(!f.helper.resolve("web", &[]).await.found);

        f.helper.attach(&attach("db", 3, 30_001)).await.unwrap();
        assert!(f.helper.delete_bridge(NET).await.unwrap());
        assert!(!f.helper.delete_bridge(NET).await.unwrap());
        assert!(!f.hub.is_listening("helper", 30_001));
        assert!(f.helper.container_networks("db").await.is_empty());
    }

    #[tokio::test]
    async fn busy_helper_port_leaves_nothing_behind() {
        let f = fixture();
        f.helper.create_bridge(&create(NET)).await.unwrap();
        let _taken = f.hub.binder("helper").bind(30_000).await.unwrap();
        assert!(f.helper.attach(&attach("web", 2, 30_000)).await.is_err());
        assert!(f.helper.container_networks("web").await.is_empty());
        assert!(!f.helper.resolve("web", &[]).await.found);
    }

    #[test]
    fn names_fall_back_to_aliases() {
        let address = Ipv4Addr::new(172, 30, 0, 2);
        let mut req = attach("web", 2, 1);
        req.hostname.clear();
        let record = dns_record(&req, address).unwrap();
        assert_eq!(record.hostname, "web-alias");
        assert!(record.aliases.is_empty());

        req.aliases.clear();
        assert!(dns_record(&req, address).is_none());
    }

    #[test_log::test(tokio::test)]
    async fn failed_bridge_removal_can_be_retried() {
        let backend = Arc::new(StuckBridges::default());
        let (helper, hub, _dir) = fixture_with(
            Arc::clone(&backend) as Arc<dyn SwitchBackend>,
            Arc::new(NullFilter::default()),
        );
        helper.create_bridge(&create(NET)).await.unwrap();
        helper.attach(&attach("web", 2, 30_000)).await.unwrap();

        backend.stuck.store(true, Ordering::SeqCst);
        assert!(matches!(
            helper.delete_bridge(NET).await,
            Err(SkiffError::BridgeOperationFailed { .. })
        ));
        let remaining = helper.bridges().await;
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].containers.is_empty());
        assert!(!hub.is_listening("helper", 30_000));

        backend.stuck.store(false, Ordering::SeqCst);
        assert!(helper.delete_bridge(NET).await.unwrap());
        assert!(helper.bridges().await.is_empty());
        assert!(!helper.state.dns.is_running());
    }

    #[tokio::test]
    async fn replacing_without_names_drops_the_old_record() {
        let f = fixture();
        f.helper.create_bridge(&create(NET)).await.unwrap();
        f.helper.attach(&attach("web", 2, 30_000)).await.unwrap();
        assert!(f.helper.resolve("web", &[]).await.found);

        let mut unnamed = attach("web", 2, 30_000);
        unnamed.hostname.clear();
        unnamed.aliases.clear();
        f.helper.attach(&unnamed).await.unwrap();
        assert!(!f.helper.resolve("web", &[]).await.found);
        assert!(!f.helper.resolve("web-alias", &[]).await.found);
        assert_eq!(f.helper.container_networks("web").await, vec![NET.to_string()]);
    }

    #[tokio::test]
    async fn malformed_mac_is_rejected() {
        let f = fixture();
        f.helper.create_bridge(&create(NET)).await.unwrap();
        let mut req = attach("web", 2, 30_000);
        req.mac_address = "02:42:zz:00:00:02".to_string();
        assert!(matches!(
            f.helper.attach(&req).await,
            Err(SkiffError::InvalidRequest { .. })
        ));
        assert!(!f.hub.is_listening("helper", 30_000));
    }

    #[test_log::test(tokio::test)]
    async fn bridges_masquerade_their_subnet() {
        let f = fixture();
        f.helper.create_bridge(&create(NET)).await.unwrap();
        assert_eq!(f.filter.rules(), [format!("masquerade {NET} 172.30.0.0/24")]);
        assert_eq!(f.helper.health().await.packet_filter, "none");

        f.helper.delete_bridge(NET).await.unwrap();
        assert!(f.filter.rules().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn published_ports_follow_the_attachment() {
        let f = fixture();
        f.helper.create_bridge(&create(NET)).await.unwrap();
        let mut web = attach("web", 2, 30_000);
        web.port_mappings = vec![tcp(8080, 80).to_proto()];
        f.helper.attach(&web).await.unwrap();
        assert!(f.filter.rules().contains(&format!("forward {NET} 8080:80/tcp 172.30.0.2")));

        // Replacing with the same mapping is not a conflict with itself.
        f.helper.attach(&web).await.unwrap();

        let mut db = attach("db", 3, 30_001);
        db.port_mappings = vec![tcp(8080, 5432).to_proto()];
        assert!(matches!(
            f.helper.attach(&db).await,
            Err(SkiffError::PortAllocated { container, .. }) if container == "web"
        ));
        assert!(!f.hub.is_listening("helper", 30_001));

        assert!(f.helper.add_port_mapping("web", NET, tcp(8443, 443)).await.unwrap());
        assert!(!f.helper.add_port_mapping("web", NET, tcp(8443, 443)).await.unwrap());
        assert!(matches!(
            f.helper.add_port_mapping("web", NET, tcp(8443, 444)).await,
            Err(SkiffError::PortAllocated { .. })
        ));
        assert!(matches!(
            f.helper.add_port_mapping("db", NET, tcp(9000, 90)).await,
            Err(SkiffError::NotConnected { .. })
        ));

        assert!(f.helper.remove_port_mapping("web", NET, Protocol::Tcp, 8080).await.unwrap());
        assert!(!f.helper.remove_port_mapping("web", NET, Protocol::Udp, 8443).await.unwrap());
        f.helper.attach(&db).await.unwrap();

        f.helper.detach("web", NET).await;
        f.helper.detach("db", NET).await;
        assert_eq!(f.filter.rules(), [format!("masquerade {NET} 172.30.0.0/24")]);
    }

    #[tokio::test]
    async fn refused_forward_undoes_the_attachment() {
        let filter = Arc::new(RefusingFilter {
            inner: NullFilter::default(),
            refused: 9090,
        });
        let (helper, hub, _dir) = fixture_with(
            Arc::new(LearningSwitch::new()),
            Arc::clone(&filter) as Arc<dyn PacketFilter>,
        );
        helper.create_bridge(&create(NET)).await.unwrap();
        let mut web = attach("web", 2, 30_000);
        web.port_mappings = vec![tcp(8080, 80).to_proto(), tcp(9090, 90).to_proto()];
        assert!(helper.attach(&web).await.is_err());

        assert!(!hub.is_listening("helper", 30_000));
        assert!(!helper.resolve("web", &[]).await.found);
        assert!(helper.container_networks("web").await.is_empty());
        assert_eq!(filter.inner.rules(), [format!("masquerade {NET} 172.30.0.0/24")]);
    }
}
