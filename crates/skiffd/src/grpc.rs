//! `NetworkService` gRPC surface, consumed by the Docker API handlers and
//! the container lifecycle.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use skiff_common::{ContainerId, SkiffError};
use skiff_network::proto;
use skiff_network::proto::network_service_server::{NetworkService, NetworkServiceServer};
use skiff_network::publish::parse_mappings;
use skiff_network::registry::NetworkInspect;
use skiff_network::rpc::error_to_status;
use skiff_network::{
    Attachment, ConnectRequest, CreateNetworkRequest, Network, NetworkRegistry, Protocol, PublishedPort,
};
use tonic::{Request, Response, Status};

/// Network service backed by the registry.
#[derive(Clone)]
pub struct NetworkServiceImpl {
    registry: Arc<NetworkRegistry>,
}

impl NetworkServiceImpl {
    /// Serve `registry`.
    #[must_use]
    pub const fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self { registry }
    }

    /// Wrap into the generated tonic server.
    #[must_use]
    pub fn into_server(self) -> NetworkServiceServer<Self> {
        NetworkServiceServer::new(self)
    }
}

fn invalid(message: String) -> Status {
    error_to_status(&SkiffError::InvalidRequest { message })
}

fn container_id(raw: &str) -> Result<ContainerId, Status> {
    ContainerId::new(raw).map_err(|e| error_to_status(&e))
}

fn optional<T: std::str::FromStr>(raw: &str, what: &str) -> Result<Option<T>, Status>
where
    T::Err: std::fmt::Display,
{
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|e| invalid(format!("invalid {what} '{raw}': {e}")))
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Registry request from the wire form.
///
/// # Errors
///
/// `InvalidArgument` for a malformed subnet or gateway.
pub fn create_request(request: proto::CreateNetworkRequest) -> Result<CreateNetworkRequest, Status> {
    let mut create = CreateNetworkRequest::new(request.name);
    if !request.driver.is_empty() {
        create = create.driver(request.driver);
    }
    if let Some(subnet) = optional::<Ipv4Net>(&request.subnet, "subnet")? {
        create = create.subnet(subnet);
    }
    if let Some(gateway) = optional::<Ipv4Addr>(&request.gateway, "gateway")? {
        create = create.gateway(gateway);
    }
    create.options.extend(request.options);
    create.labels.extend(request.labels);
    Ok(create)
}

/// Registry request from the wire form.
///
/// # Errors
///
/// `InvalidArgument` for a malformed address or port mapping.
pub fn connect_request(request: &proto::ConnectContainerRequest) -> Result<ConnectRequest, Status> {
    let mut connect = ConnectRequest::default();
    if let Some(address) = optional::<Ipv4Addr>(&request.ipv4_address, "IPv4 address")? {
        connect = connect.address(address);
    }
    for alias in request.aliases.iter().filter(|a| !a.is_empty()) {
        connect = connect.alias(alias.clone());
    }
    if !request.hostname.is_empty() {
        connect = connect.hostname(request.hostname.clone());
    }
    for port in parse_mappings(&request.ports).map_err(|e| error_to_status(&e))? {
        connect = connect.publish(port);
    }
    Ok(connect)
}

/// Wire form of an attachment.
#[must_use]
pub fn endpoint_resource(attachment: &Attachment) -> proto::EndpointResource {
    proto::EndpointResource {
        container_id: attachment.container.to_string(),
        network_id: attachment.network.to_string(),
        ip_address: attachment.address.to_string(),
        prefix_length: u32::from(attachment.prefix_len),
        gateway: attachment.gateway.to_string(),
        mac_address: attachment.mac.to_string(),
        device: attachment.device(),
        aliases: attachment.aliases.clone(),
        hostname: attachment.hostname.clone().unwrap_or_default(),
        ports: attachment.ports.iter().map(PublishedPort::to_proto).collect(),
    }
}

/// Wire form of a network and its endpoints.
#[must_use]
pub fn network_resource(network: &Network, endpoints: &[Attachment]) -> proto::NetworkResource {
    let map = |m: &std::collections::BTreeMap<String, String>| -> HashMap<String, String> {
        m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    };
    proto::NetworkResource {
        id: network.id.to_string(),
        name: network.name.clone(),
        driver: network.driver.clone(),
        subnet: network.subnet.to_string(),
        gateway: network.gateway.to_string(),
        created: network.created.timestamp(),
        is_default: network.is_default,
        bridge: network.bridge.clone(),
        options: map(&network.options),
        labels: map(&network.labels),
        endpoints: endpoints.iter().map(endpoint_resource).collect(),
    }
}

fn port_request(request: proto::PortRequest) -> Result<(ContainerId, String, proto::PortMapping), Status> {
    let container = container_id(&request.container_id)?;
    let port = request
        .port
        .ok_or_else(|| invalid("port mapping is required".to_string()))?;
    Ok((container, request.network, port))
}

fn inspect_resource(inspect: &NetworkInspect) -> proto::NetworkResource {
    network_resource(&inspect.network, &inspect.endpoints)
}

#[tonic::async_trait]
impl NetworkService for NetworkServiceImpl {
    async fn create_network(
        &self,
        request: Request<proto::CreateNetworkRequest>,
    ) -> Result<Response<proto::NetworkResource>, Status> {
        let create = create_request(request.into_inner())?;
        tracing::debug!(name = %create.name, "Creating network via gRPC");
        let network = self
            .registry
            .create_network(create)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(network_resource(&network, &[])))
    }

    async fn delete_network(
        &self,
        request: Request<proto::DeleteNetworkRequest>,
    ) -> Result<Response<proto::DeleteNetworkResponse>, Status> {
        let req = request.into_inner();
        self.registry
            .delete_network(&req.network, req.force)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(proto::DeleteNetworkResponse {}))
    }

    async fn list_networks(
        &self,
        _request: Request<proto::ListNetworksRequest>,
    ) -> Result<Response<proto::ListNetworksResponse>, Status> {
        let networks = self
            .registry
            .list_networks()
            .iter()
            .filter_map(|network| self.registry.inspect_network(network.id.as_str()).ok())
            .map(|inspect| inspect_resource(&inspect))
            .collect();
        Ok(Response::new(proto::ListNetworksResponse { networks }))
    }

    async fn inspect_network(
        &self,
        request: Request<proto::InspectNetworkRequest>,
    ) -> Result<Response<proto::NetworkResource>, Status> {
        let inspect = self
            .registry
            .inspect_network(&request.into_inner().network)
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(inspect_resource(&inspect)))
    }

    async fn connect_container(
        &self,
        request: Request<proto::ConnectContainerRequest>,
    ) -> Result<Response<proto::EndpointResource>, Status> {
        let req = request.into_inner();
        let container = container_id(&req.container_id)?;
        let connect = connect_request(&req)?;
        let attachment = self
            .registry
            .connect(&container, &req.network, connect)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(endpoint_resource(&attachment)))
    }

    async fn disconnect_container(
        &self,
        request: Request<proto::DisconnectContainerRequest>,
    ) -> Result<Response<proto::DisconnectContainerResponse>, Status> {
        let req = request.into_inner();
        let container = container_id(&req.container_id)?;
        let disconnected = self
            .registry
            .disconnect(&container, &req.network, req.force)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(proto::DisconnectContainerResponse { disconnected }))
    }

    async fn restore_container(
        &self,
        request: Request<proto::ContainerRequest>,
    ) -> Result<Response<proto::RestoreContainerResponse>, Status> {
        let container = container_id(&request.into_inner().container_id)?;
        let restored = self
            .registry
            .restore_container(&container)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(proto::RestoreContainerResponse {
            restored: count(restored),
        }))
    }

    async fn remove_container(
        &self,
        request: Request<proto::ContainerRequest>,
    ) -> Result<Response<proto::RemoveContainerResponse>, Status> {
        let container = container_id(&request.into_inner().container_id)?;
        let disconnected = self.registry.remove_container(&container).await;
        Ok(Response::new(proto::RemoveContainerResponse {
            disconnected: count(disconnected),
        }))
    }

    async fn publish_port(
        &self,
        request: Request<proto::PortRequest>,
    ) -> Result<Response<proto::EndpointResource>, Status> {
        let (container, network, mapping) = port_request(request.into_inner())?;
        let port = PublishedPort::from_proto(&mapping).map_err(|e| error_to_status(&e))?;
        tracing::debug!(container = %container, %network, %port, "Publishing port via gRPC");
        let attachment = self
            .registry
            .publish_port(&container, &network, port)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(endpoint_resource(&attachment)))
    }

    async fn unpublish_port(
        &self,
        request: Request<proto::PortRequest>,
    ) -> Result<Response<proto::EndpointResource>, Status> {
        let (container, network, mapping) = port_request(request.into_inner())?;
        let protocol: Protocol = mapping.protocol.parse().map_err(|e| error_to_status(&e))?;
        let host_port = u16::try_from(mapping.host_port)
            .map_err(|_| invalid(format!("port {} out of range", mapping.host_port)))?;
        let attachment = self
            .registry
            .unpublish_port(&container, &network, protocol, host_port)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(endpoint_resource(&attachment)))
    }
}
