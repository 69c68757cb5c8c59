//! gRPC clients over control channels, and error/status mapping.

use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use skiff_common::{ContainerId, SkiffError, SkiffResult};
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Status};

use crate::proto;
use crate::proto::network_agent_client::NetworkAgentClient;
use crate::proto::network_control_client::NetworkControlClient;
use crate::publish::PublishedPort;
use crate::retry::RetryPolicy;
use crate::transport::ControlChannel;

// Authority is ignored; the connector decides where streams go.
const CHANNEL_URI: &str = "http://skiff.local";

fn endpoint(timeout: Duration) -> Endpoint {
    Endpoint::from_static(CHANNEL_URI)
        .timeout(timeout)
        .connect_timeout(timeout)
}

macro_rules! connector {
    ($channel:expr, $port:expr) => {{
        let channel: Arc<dyn ControlChannel> = $channel;
        let port: u32 = $port;
        tower::service_fn(move |_: Uri| {
            let channel = Arc::clone(&channel);
            async move { channel.open(port).await.map(TokioIo::new) }
        })
    }};
}

/// Map a server error onto the gRPC status code callers dispatch on.
#[must_use]
pub fn error_to_status(err: &SkiffError) -> Status {
    let message = err.to_string();
    match err {
        SkiffError::NetworkNotFound { .. } | SkiffError::NotConnected { .. } => {
            Status::not_found(message)
        }
        SkiffError::NetworkNameConflict { .. }
        | SkiffError::AlreadyConnected { .. }
        | SkiffError::PortAllocated { .. } => Status::already_exists(message),
        SkiffError::NetworkInUse { .. }
        | SkiffError::AddressExhausted { .. }
        | SkiffError::RelayPortsExhausted { .. } => Status::failed_precondition(message),
        SkiffError::AddressConflict { .. }
        | SkiffError::InvalidSubnet { .. }
        | SkiffError::InvalidRequest { .. }
        | SkiffError::InvalidContainerId { .. } => Status::invalid_argument(message),
        SkiffError::OperationNotPermitted { .. } => Status::permission_denied(message),
        SkiffError::AgentUnreachable { .. } | SkiffError::HelperUnreachable { .. } => {
            Status::unavailable(message)
        }
        _ => Status::internal(message),
    }
}

const fn is_unreachable(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled
    )
}

fn agent_error(container: &ContainerId, status: &Status) -> SkiffError {
    let message = status.message().to_string();
    match status.code() {
        code if is_unreachable(code) => SkiffError::AgentUnreachable {
            container: container.to_string(),
            message,
        },
        Code::InvalidArgument => SkiffError::InvalidRequest { message },
        _ => SkiffError::AgentOperationFailed {
            container: container.to_string(),
            message,
        },
    }
}

fn helper_error(status: &Status) -> SkiffError {
    let message = status.message().to_string();
    match status.code() {
        code if is_unreachable(code) => SkiffError::HelperUnreachable { message },
        Code::InvalidArgument => SkiffError::InvalidRequest { message },
        _ => SkiffError::BridgeOperationFailed { message },
    }
}

/// Client for one container's in-VM network agent.
#[derive(Debug, Clone)]
pub struct AgentClient {
    container: ContainerId,
    inner: NetworkAgentClient<Channel>,
    retry: RetryPolicy,
}

impl AgentClient {
    /// Connect to the agent, retrying while it is still starting.
    ///
    /// # Errors
    ///
    /// `AgentUnreachable` once the retry policy is exhausted.
    pub async fn connect(
        container: ContainerId,
        channel: Arc<dyn ControlChannel>,
        port: u32,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> SkiffResult<Self> {
        let id = &container;
        let channel = &channel;
        let transport = retry
            .run("connect to network agent", || async move {
                endpoint(timeout)
                    .connect_with_connector(connector!(Arc::clone(channel), port))
                    .await
                    .map_err(|e| SkiffError::AgentUnreachable {
                        container: id.to_string(),
                        message: format!("{}: {e}", channel.describe()),
                    })
            })
            .await?;
        tracing::debug!(container = %container, port, "Connected to network agent");
        Ok(Self {
            container,
            inner: NetworkAgentClient::new(transport),
            retry,
        })
    }

    /// The container this agent runs in.
    #[must_use]
    pub const fn container(&self) -> &ContainerId {
        &self.container
    }

    /// Create or replace interface `eth{device_index}`.
    ///
    /// # Errors
    ///
    /// Agent failures or unreachability.
    pub async fn configure(
        &self,
        request: proto::ConfigureNetworkRequest,
    ) -> SkiffResult<proto::ConfigureNetworkResponse> {
        let request = &request;
        self.retry
            .run("configure network", || async move {
                self.inner
                    .clone()
                    .configure_network(request.clone())
                    .await
                    .map(tonic::Response::into_inner)
                    .map_err(|s| agent_error(&self.container, &s))
            })
            .await
    }

    /// Remove an interface; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Agent failures or unreachability.
    pub async fn detach(&self, device: &str) -> SkiffResult<bool> {
        self.retry
            .run("detach network", || async move {
                self.inner
                    .clone()
                    .detach_network(proto::DetachNetworkRequest {
                        device: device.to_string(),
                    })
                    .await
                    .map(|r| r.into_inner().removed)
                    .map_err(|s| agent_error(&self.container, &s))
            })
            .await
    }
}

/// Client for the helper VM's network control service.
///
/// The connection is established lazily and re-established after the helper
/// restarts, so one client lives for the whole daemon lifetime.
#[derive(Debug, Clone)]
pub struct HelperClient {
    inner: NetworkControlClient<Channel>,
    retry: RetryPolicy,
}

macro_rules! helper_call {
    ($self:ident, $what:literal, $method:ident, $request:expr) => {{
        let request = &$request;
        $self
            .retry
            .run($what, || async move {
                $self
                    .inner
                    .clone()
                    .$method(request.clone())
                    .await
                    .map(tonic::Response::into_inner)
                    .map_err(|s| helper_error(&s))
            })
            .await
    }};
}

impl HelperClient {
    /// Create a client that connects through `channel` on first use.
    #[must_use]
    pub fn new(
        channel: Arc<dyn ControlChannel>,
        port: u32,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let transport = endpoint(timeout).connect_with_connector_lazy(connector!(channel, port));
        Self {
            inner: NetworkControlClient::new(transport),
            retry,
        }
    }

    /// Create the switch for a network (idempotent).
    ///
    /// # Errors
    ///
    /// Helper failures or unreachability.
    pub async fn create_bridge(
        &self,
        request: proto::CreateBridgeRequest,
    ) -> SkiffResult<proto::CreateBridgeResponse> {
        helper_call!(self, "create bridge", create_bridge, request)
    }

    /// Remove a network's switch; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Helper failures or unreachability.
    pub async fn delete_bridge(&self, network_id: &str) -> SkiffResult<bool> {
        let request = proto::DeleteBridgeRequest {
            network_id: network_id.to_string(),
        };
        let response = helper_call!(self, "delete bridge", delete_bridge, request)?;
        Ok(response.existed)
    }

    /// Plug a container's relay into a network's switch.
    ///
    /// # Errors
    ///
    /// Helper failures or unreachability.
    pub async fn attach_container(
        &self,
        request: proto::AttachContainerRequest,
    ) -> SkiffResult<proto::AttachContainerResponse> {
        helper_call!(self, "attach container", attach_container, request)
    }

    /// Unplug a container from a network's switch; returns whether it was
    /// attached.
    ///
    /// # Errors
    ///
    /// Helper failures or unreachability.
    pub async fn detach_container(&self, container_id: &str, network_id: &str) -> SkiffResult<bool> {
        let request = proto::DetachContainerRequest {
            container_id: container_id.to_string(),
            network_id: network_id.to_string(),
        };
        let response = helper_call!(self, "detach container", detach_container, request)?;
        Ok(response.existed)
    }

    /// Forward a host port to an attached container; returns whether the
    /// mapping is new.
    ///
    /// # Errors
    ///
    /// Helper failures or unreachability.
    pub async fn add_port_mapping(
        &self,
        container_id: &str,
        network_id: &str,
        port: PublishedPort,
    ) -> SkiffResult<bool> {
        let request = proto::PortMappingRequest {
            container_id: container_id.to_string(),
            network_id: network_id.to_string(),
            mapping: Some(port.to_proto()),
        };
        let response = helper_call!(self, "add port mapping", add_port_mapping, request)?;
        Ok(response.changed)
    }

    /// Stop forwarding a host port; returns whether it was forwarded.
    ///
    /// # Errors
    ///
    /// Helper failures or unreachability.
    pub async fn remove_port_mapping(
        &self,
        container_id: &str,
        network_id: &str,
        port: PublishedPort,
    ) -> SkiffResult<bool> {
        let request = proto::PortMappingRequest {
            container_id: container_id.to_string(),
            network_id: network_id.to_string(),
            mapping: Some(port.to_proto()),
        };
        let response = helper_call!(self, "remove port mapping", remove_port_mapping, request)?;
        Ok(response.changed)
    }

    /// Helper health, without retrying.
    ///
    /// # Errors
    ///
    /// `HelperUnreachable` when the helper does not answer.
    pub async fn health(&self) -> SkiffResult<proto::GetHealthResponse> {
        self.inner
            .clone()
            .get_health(proto::GetHealthRequest {})
            .await
            .map(tonic::Response::into_inner)
            .map_err(|s| helper_error(&s))
    }

    /// Networks the helper has the container attached to.
    ///
    /// # Errors
    ///
    /// Helper failures or unreachability.
    pub async fn container_networks(&self, container_id: &str) -> SkiffResult<Vec<String>> {
        let request = proto::GetContainerNetworksRequest {
            container_id: container_id.to_string(),
        };
        let response =
            helper_call!(self, "get container networks", get_container_networks, request)?;
        Ok(response.network_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_map_to_codes() {
        let cases = [
            (
                SkiffError::NetworkNotFound { id: "x".into() },
                Code::NotFound,
            ),
            (
                SkiffError::AlreadyConnected {
                    container: "c".into(),
                    network: "n".into(),
                },
                Code::AlreadyExists,
            ),
            (
                SkiffError::PortAllocated {
                    port: "8080/tcp".into(),
                    container: "c".into(),
                },
                Code::AlreadyExists,
            ),
            (
                SkiffError::NetworkInUse {
                    network: "n".into(),
                    endpoints: 2,
                },
                Code::FailedPrecondition,
            ),
            (
                SkiffError::AddressConflict {
                    address: "10.0.0.1".into(),
                    reason: "gateway".into(),
                },
                Code::InvalidArgument,
            ),
            (
                SkiffError::OperationNotPermitted {
                    operation: "delete default".into(),
                },
                Code::PermissionDenied,
            ),
            (
                SkiffError::HelperUnreachable {
                    message: "down".into(),
                },
                Code::Unavailable,
            ),
            (
                SkiffError::Internal {
                    message: "boom".into(),
                },
                Code::Internal,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(error_to_status(&err).code(), code, "{err}");
        }
    }

    #[test]
    fn unavailable_status_is_transient() {
        let container = ContainerId::new("web").unwrap();
        let err = agent_error(&container, &Status::unavailable("refused"));
        assert!(err.is_transient());
        let err = agent_error(&container, &Status::internal("no tun"));
        assert!(matches!(err, SkiffError::AgentOperationFailed { .. }));
        assert!(!err.is_transient());

        assert!(helper_error(&Status::deadline_exceeded("slow")).is_transient());
        assert!(matches!(
            helper_error(&Status::invalid_argument("bad subnet")),
            SkiffError::InvalidRequest { .. }
        ));
    }
}
