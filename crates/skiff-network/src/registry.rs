//! Network registry.
//!
//! The registry is the source of truth for networks and attachments. All
//! mutations are serialized by a writer gate and applied copy-on-write: a
//! mutation works on a clone of the state and publishes it with a single
//! swap once the data plane has done its part, so a failed connect leaves no
//! trace and readers never observe half an operation.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use skiff_common::{ContainerId, NetworkId, SkiffError, SkiffResult};
use tokio::sync::Mutex;

use crate::config::NetworkConfig;
use crate::dataplane::DataPlane;
use crate::ipam::{Ipam, gateway_for, validate_subnet};
use crate::mac::MacAddress;
use crate::naming::device_name;
use crate::publish::{Protocol, PublishedPort};
use crate::store::{PersistedState, RegistryStore, STATE_VERSION};

/// The only supported network driver.
pub const BRIDGE_DRIVER: &str = "bridge";

/// A user-visible network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// 64 hex character id.
    pub id: NetworkId,
    /// Unique name.
    pub name: String,
    /// Driver, always `bridge`.
    pub driver: String,
    /// Subnet in CIDR form.
    pub subnet: Ipv4Net,
    /// Gateway address, held by the helper's bridge.
    pub gateway: Ipv4Addr,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Driver options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// User labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Whether this is the network created at startup.
    #[serde(default)]
    pub is_default: bool,
    /// Bridge name assigned by the helper.
    #[serde(default)]
    pub bridge: String,
}

/// A container's endpoint on a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// The container.
    pub container: ContainerId,
    /// The network.
    pub network: NetworkId,
    /// Container address.
    pub address: Ipv4Addr,
    /// Subnet prefix length.
    pub prefix_len: u8,
    /// Network gateway.
    pub gateway: Ipv4Addr,
    /// Interface MAC.
    pub mac: MacAddress,
    /// Interface index inside the container (`eth{device_index}`).
    pub device_index: u32,
    /// Extra DNS names.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Primary DNS name.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Host ports forwarded to this endpoint.
    #[serde(default)]
    pub ports: Vec<PublishedPort>,
}

impl Attachment {
    /// Interface name inside the container.
    #[must_use]
    pub fn device(&self) -> String {
        device_name(self.device_index)
    }

    fn key(&self) -> (ContainerId, NetworkId) {
        (self.container.clone(), self.network.clone())
    }
}

/// Parameters of [`NetworkRegistry::create_network`].
#[derive(Debug, Clone, Default)]
pub struct CreateNetworkRequest {
    /// Network name.
    pub name: String,
    /// Driver; `None` means `bridge`.
    pub driver: Option<String>,
    /// Explicit subnet; `None` picks one from the address pools.
    pub subnet: Option<Ipv4Net>,
    /// Explicit gateway; `None` uses the first host address.
    pub gateway: Option<Ipv4Addr>,
    /// Driver options.
    pub options: BTreeMap<String, String>,
    /// User labels.
    pub labels: BTreeMap<String, String>,
}

impl CreateNetworkRequest {
    /// Request for a network called `name` with defaults for everything else.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the driver.
    #[must_use]
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Set the subnet.
    #[must_use]
    pub const fn subnet(mut self, subnet: Ipv4Net) -> Self {
        self.subnet = Some(subnet);
        self
    }

    /// Set the gateway.
    #[must_use]
    pub const fn gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Add a driver option.
    #[must_use]
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Add a label.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Parameters of [`NetworkRegistry::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Requested address; `None` takes the lowest free one.
    pub address: Option<Ipv4Addr>,
    /// Extra DNS names.
    pub aliases: Vec<String>,
    /// Primary DNS name.
    pub hostname: Option<String>,
    /// Host ports to forward to the endpoint.
    pub ports: Vec<PublishedPort>,
}

impl ConnectRequest {
    /// Request a specific address.
    #[must_use]
    pub const fn address(mut self, address: Ipv4Addr) -> Self {
        self.address = Some(address);
        self
    }

    /// Add a DNS alias.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Set the DNS hostname.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Forward a host port to the endpoint.
    #[must_use]
    pub fn publish(mut self, port: PublishedPort) -> Self {
        self.ports.push(port);
        self
    }
}

/// A network with its endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInspect {
    /// The network.
    pub network: Network,
    /// Its attachments, ordered by container id.
    pub endpoints: Vec<Attachment>,
}

#[derive(Debug, Clone, Default)]
struct RegistryState {
    networks: BTreeMap<NetworkId, Network>,
    attachments: BTreeMap<(ContainerId, NetworkId), Attachment>,
    ipam: Ipam,
}

impl RegistryState {
    fn from_persisted(persisted: PersistedState) -> SkiffResult<Self> {
        let mut state = Self::default();
        for network in persisted.networks {
            state.ipam.add_network(&network.id, network.subnet, network.gateway)?;
            state.networks.insert(network.id.clone(), network);
        }
        for attachment in persisted.attachments {
            if !state.networks.contains_key(&attachment.network) {
                tracing::warn!(
                    container = %attachment.container.short(),
                    network = %attachment.network.short(),
                    "Dropping attachment to unknown network"
                );
                continue;
            }
            state
                .ipam
                .reserve(&attachment.network, &attachment.container, attachment.address)?;
            state.attachments.insert(attachment.key(), attachment);
        }
        Ok(state)
    }

    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            version: STATE_VERSION,
            networks: self.networks.values().cloned().collect(),
            attachments: self.attachments.values().cloned().collect(),
        }
    }

    /// Exact id, exact name, then unique id prefix.
    fn find(&self, reference: &str) -> SkiffResult<&Network> {
        let not_found = || SkiffError::NetworkNotFound {
            id: reference.to_string(),
        };
        if reference.is_empty() {
            return Err(not_found());
        }
        if let Some(network) = self.networks.values().find(|n| n.id.as_str() == reference) {
            return Ok(network);
        }
        if let Some(network) = self.networks.values().find(|n| n.name == reference) {
            return Ok(network);
        }
        let matches: Vec<&Network> = self
            .networks
            .values()
            .filter(|n| n.id.as_str().starts_with(reference))
            .collect();
        match matches.as_slice() {
            [network] => Ok(network),
            [] => Err(not_found()),
            _ => Err(SkiffError::InvalidRequest {
                message: format!("network id prefix {reference} is ambiguous"),
            }),
        }
    }

    fn endpoints(&self, network: &NetworkId) -> Vec<Attachment> {
        self.attachments
            .values()
            .filter(|a| &a.network == network)
            .cloned()
            .collect()
    }

    fn container_attachments(&self, container: &ContainerId) -> Vec<Attachment> {
        self.attachments
            .values()
            .filter(|a| &a.container == container)
            .cloned()
            .collect()
    }

    /// Fail with `PortAllocated` if another attachment than `key`
    /// publishes one of the host ports of `ports`.
    fn check_ports_free(&self, ports: &[PublishedPort], key: &(ContainerId, NetworkId)) -> SkiffResult<()> {
        for port in ports {
            let holder = self
                .attachments
                .iter()
                .filter(|(k, _)| *k != key)
                .find(|(_, a)| a.ports.iter().any(|p| p.host_key() == port.host_key()));
            if let Some((_, holder)) = holder {
                return Err(SkiffError::PortAllocated {
                    port: format!("{}/{}", port.host_port, port.protocol),
                    container: holder.container.to_string(),
                });
            }
        }
        Ok(())
    }

    fn next_device_index(&self, container: &ContainerId) -> u32 {
        let used: Vec<u32> = self
            .attachments
            .values()
            .filter(|a| &a.container == container)
            .map(|a| a.device_index)
            .collect();
        (0..).find(|index| !used.contains(index)).unwrap_or_default()
    }
}

fn distinct_host_ports(ports: &[PublishedPort]) -> SkiffResult<()> {
    let mut seen = BTreeSet::new();
    for port in ports {
        if !seen.insert(port.host_key()) {
            return Err(SkiffError::InvalidRequest {
                message: format!("host port {}/{} published twice", port.host_port, port.protocol),
            });
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> SkiffResult<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SkiffError::InvalidRequest {
            message: format!("invalid network name '{name}': use [a-zA-Z0-9][a-zA-Z0-9_.-]*"),
        })
    }
}

/// Networks and attachments, kept consistent with the data plane.
pub struct NetworkRegistry {
    config: NetworkConfig,
    dataplane: Arc<dyn DataPlane>,
    store: Option<RegistryStore>,
    writer: Mutex<()>,
    state: RwLock<Arc<RegistryState>>,
}

impl NetworkRegistry {
    /// An empty registry that keeps its state in memory only.
    #[must_use]
    pub fn new(config: NetworkConfig, dataplane: Arc<dyn DataPlane>) -> Self {
        Self {
            config,
            dataplane,
            store: None,
            writer: Mutex::new(()),
            state: RwLock::new(Arc::new(RegistryState::default())),
        }
    }

    /// A registry persisted in `store`, starting from its saved state.
    ///
    /// # Errors
    ///
    /// Unreadable state, or saved allocations that contradict each other.
    pub fn load(config: NetworkConfig, dataplane: Arc<dyn DataPlane>, store: RegistryStore) -> SkiffResult<Self> {
        let state = match store.load()? {
            Some(persisted) => RegistryState::from_persisted(persisted)?,
            None => RegistryState::default(),
        };
        tracing::info!(
            path = %store.path().display(),
            networks = state.networks.len(),
            attachments = state.attachments.len(),
            "Network registry loaded"
        );
        Ok(Self {
            config,
            dataplane,
            store: Some(store),
            writer: Mutex::new(()),
            state: RwLock::new(Arc::new(state)),
        })
    }

    /// Registry configuration.
    #[must_use]
    pub const fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn snapshot(&self) -> Arc<RegistryState> {
        Arc::clone(&self.state.read())
    }

    /// Persist and publish `next`. Nothing changes if persisting fails.
    fn commit(&self, next: RegistryState) -> SkiffResult<()> {
        if let Some(store) = &self.store {
            store.save(&next.to_persisted())?;
        }
        *self.state.write() = Arc::new(next);
        Ok(())
    }

    /// Publish `next` even if it cannot be persisted; used after teardown,
    /// when the data plane already reflects it.
    fn commit_logged(&self, next: RegistryState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&next.to_persisted()) {
                tracing::error!(error = %e, "Failed to persist network state");
            }
        }
        *self.state.write() = Arc::new(next);
    }

    async fn delete_bridge_logged(&self, network: &NetworkId) {
        if let Err(e) = self.dataplane.delete_bridge(network).await {
            tracing::warn!(network = %network.short(), error = %e, "Failed to delete bridge");
        }
    }

    /// Create the default network unless it exists.
    ///
    /// # Errors
    ///
    /// Same as [`Self::create_network`].
    pub async fn ensure_default_network(&self) -> SkiffResult<Network> {
        if let Some(network) = self.snapshot().networks.values().find(|n| n.is_default) {
            return Ok(network.clone());
        }
        let defaults = &self.config.default_network;
        let request = CreateNetworkRequest::new(defaults.name.clone()).subnet(defaults.subnet);
        self.create(request, true).await
    }

    /// Create a network and its bridge.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a bad name or driver, `NetworkNameConflict`,
    /// `InvalidSubnet` for malformed or overlapping subnets,
    /// `AddressConflict` for a bad gateway, or the helper's error.
    pub async fn create_network(&self, request: CreateNetworkRequest) -> SkiffResult<Network> {
        self.create(request, false).await
    }

    async fn create(&self, request: CreateNetworkRequest, is_default: bool) -> SkiffResult<Network> {
        let _gate = self.writer.lock().await;
        let mut next = (*self.snapshot()).clone();
        if is_default {
            if let Some(existing) = next.networks.values().find(|n| n.is_default) {
                return Ok(existing.clone());
            }
        }

        let driver = request.driver.unwrap_or_else(|| BRIDGE_DRIVER.to_string());
        if driver != BRIDGE_DRIVER {
            return Err(SkiffError::InvalidRequest {
                message: format!("unsupported network driver '{driver}'"),
            });
        }
        validate_name(&request.name)?;
        if next.networks.values().any(|n| n.name == request.name) {
            return Err(SkiffError::NetworkNameConflict { name: request.name });
        }

        let subnet = match request.subnet {
            Some(subnet) => {
                let subnet = validate_subnet(subnet)?;
                if let Some(other) = next.ipam.overlapping(subnet) {
                    return Err(SkiffError::InvalidSubnet {
                        subnet: subnet.to_string(),
                        reason: format!("overlaps network {}", other.short()),
                    });
                }
                subnet
            }
            None => next.ipam.next_free_subnet(&self.config.address_pools)?,
        };
        let gateway = match request.gateway {
            Some(gateway) => gateway,
            None => gateway_for(subnet)?,
        };

        let mut network = Network {
            id: NetworkId::generate(),
            name: request.name,
            driver,
            subnet,
            gateway,
            created: Utc::now(),
            options: request.options,
            labels: request.labels,
            is_default,
            bridge: String::new(),
        };
        next.ipam.add_network(&network.id, subnet, gateway)?;
        network.bridge = self.dataplane.create_bridge(&network).await?;
        next.networks.insert(network.id.clone(), network.clone());

        if let Err(e) = self.commit(next) {
            self.delete_bridge_logged(&network.id).await;
            return Err(e);
        }
        tracing::info!(
            network = %network.id.short(),
            name = %network.name,
            %subnet,
            %gateway,
            bridge = %network.bridge,
            "Network created"
        );
        Ok(network)
    }

    /// Delete a network. With `force`, its containers are disconnected
    /// first.
    ///
    /// # Errors
    ///
    /// `NetworkNotFound`, `OperationNotPermitted` for the default network,
    /// `NetworkInUse` when endpoints remain and `force` is not set.
    pub async fn delete_network(&self, reference: &str, force: bool) -> SkiffResult<()> {
        let _gate = self.writer.lock().await;
        let current = self.snapshot();
        let network = current.find(reference)?.clone();
        if network.is_default {
            return Err(SkiffError::OperationNotPermitted {
                operation: format!("delete the default network {}", network.name),
            });
        }
        let endpoints = current.endpoints(&network.id);
        if !endpoints.is_empty() && !force {
            return Err(SkiffError::NetworkInUse {
                network: network.name,
                endpoints: endpoints.len(),
            });
        }

        for attachment in &endpoints {
            self.dataplane.detach(attachment).await;
        }
        self.delete_bridge_logged(&network.id).await;

        let mut next = (*current).clone();
        next.attachments.retain(|(_, id), _| id != &network.id);
        next.ipam.remove_network(&network.id);
        next.networks.remove(&network.id);
        self.commit_logged(next);
        tracing::info!(
            network = %network.id.short(),
            name = %network.name,
            disconnected = endpoints.len(),
            "Network deleted"
        );
        Ok(())
    }

    /// All networks, by name.
    #[must_use]
    pub fn list_networks(&self) -> Vec<Network> {
        let mut networks: Vec<Network> = self.snapshot().networks.values().cloned().collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }

    /// Look a network up by id, name or unique id prefix.
    ///
    /// # Errors
    ///
    /// `NetworkNotFound`, or `InvalidRequest` for an ambiguous prefix.
    pub fn network(&self, reference: &str) -> SkiffResult<Network> {
        self.snapshot().find(reference).cloned()
    }

    /// A network with its endpoints.
    ///
    /// # Errors
    ///
    /// Same as [`Self::network`].
    pub fn inspect_network(&self, reference: &str) -> SkiffResult<NetworkInspect> {
        let state = self.snapshot();
        let network = state.find(reference)?.clone();
        let endpoints = state.endpoints(&network.id);
        Ok(NetworkInspect { network, endpoints })
    }

    /// Connect a container to a network.
    ///
    /// For a running container the data path is brought up before the
    /// attachment is recorded; a stopped container's attachment is recorded
    /// and brought up by [`Self::restore_container`].
    ///
    /// # Errors
    ///
    /// `NetworkNotFound`, `AlreadyConnected`, `PortAllocated`, IPAM errors,
    /// or the data plane's error. Nothing is recorded on failure.
    pub async fn connect(
        &self,
        container: &ContainerId,
        reference: &str,
        request: ConnectRequest,
    ) -> SkiffResult<Attachment> {
        let _gate = self.writer.lock().await;
        let mut next = (*self.snapshot()).clone();
        let network = next.find(reference)?.clone();
        if next
            .attachments
            .contains_key(&(container.clone(), network.id.clone()))
        {
            return Err(SkiffError::AlreadyConnected {
                container: container.to_string(),
                network: network.name,
            });
        }
        distinct_host_ports(&request.ports)?;
        next.check_ports_free(&request.ports, &(container.clone(), network.id.clone()))?;

        let address = next.ipam.allocate(&network.id, container, request.address)?;
        let attachment = Attachment {
            container: container.clone(),
            network: network.id.clone(),
            address,
            prefix_len: network.subnet.prefix_len(),
            gateway: network.gateway,
            mac: MacAddress::generate(self.config.mac_prefix),
            device_index: next.next_device_index(container),
            aliases: request.aliases,
            hostname: request.hostname,
            ports: request.ports,
        };

        let running = self.dataplane.container_running(container).await;
        if running {
            self.dataplane.attach(&network, &attachment).await?;
        }

        next.attachments.insert(attachment.key(), attachment.clone());
        if let Err(e) = self.commit(next) {
            if running {
                self.dataplane.detach(&attachment).await;
            }
            return Err(e);
        }
        tracing::info!(
            container = %container.short(),
            network = %network.name,
            address = %attachment.address,
            device = %attachment.device(),
            ports = attachment.ports.len(),
            deferred = !running,
            "Container connected"
        );
        Ok(attachment)
    }

    /// Disconnect a container from a network. Returns whether an
    /// attachment was removed.
    ///
    /// # Errors
    ///
    /// Without `force`: `NetworkNotFound` or `NotConnected`. With `force`
    /// both are successful no-ops.
    pub async fn disconnect(&self, container: &ContainerId, reference: &str, force: bool) -> SkiffResult<bool> {
        let _gate = self.writer.lock().await;
        let current = self.snapshot();
        let network = match current.find(reference) {
            Ok(network) => network.clone(),
            Err(_) if force => return Ok(false),
            Err(e) => return Err(e),
        };
        let key = (container.clone(), network.id.clone());
        let Some(attachment) = current.attachments.get(&key).cloned() else {
            if force {
                return Ok(false);
            }
            return Err(SkiffError::NotConnected {
                container: container.to_string(),
                network: network.name,
            });
        };

        self.dataplane.detach(&attachment).await;

        let mut next = (*current).clone();
        next.ipam.release(&network.id, container);
        next.attachments.remove(&key);
        self.commit_logged(next);
        tracing::info!(
            container = %container.short(),
            network = %network.name,
            address = %attachment.address,
            "Container disconnected"
        );
        Ok(true)
    }

    fn attachment_on(
        state: &RegistryState,
        container: &ContainerId,
        reference: &str,
    ) -> SkiffResult<(Network, Attachment)> {
        let network = state.find(reference)?.clone();
        let attachment = state
            .attachments
            .get(&(container.clone(), network.id.clone()))
            .cloned()
            .ok_or_else(|| SkiffError::NotConnected {
                container: container.to_string(),
                network: network.name.clone(),
            })?;
        Ok((network, attachment))
    }

    /// Forward a host port to a container's endpoint. A running container's
    /// forward is installed right away; a stopped container's comes up with
    /// its data path. Publishing an existing mapping changes nothing.
    ///
    /// # Errors
    ///
    /// `NetworkNotFound`, `NotConnected`, `PortAllocated` when the host port
    /// is taken (by this endpoint with another container port, too), or the
    /// data plane's error.
    pub async fn publish_port(
        &self,
        container: &ContainerId,
        reference: &str,
        port: PublishedPort,
    ) -> SkiffResult<Attachment> {
        let _gate = self.writer.lock().await;
        let current = self.snapshot();
        let (network, attachment) = Self::attachment_on(&current, container, reference)?;
        if attachment.ports.contains(&port) {
            return Ok(attachment);
        }
        if let Some(own) = attachment.ports.iter().find(|p| p.host_key() == port.host_key()) {
            return Err(SkiffError::PortAllocated {
                port: format!("{}/{} (as {own})", port.host_port, port.protocol),
                container: container.to_string(),
            });
        }
        current.check_ports_free(&[port], &attachment.key())?;

        let running = self.dataplane.container_running(container).await;
        if running {
            self.dataplane.publish(&attachment, port).await?;
        }

        let mut next = (*current).clone();
        let mut updated = attachment;
        updated.ports.push(port);
        next.attachments.insert(updated.key(), updated.clone());
        if let Err(e) = self.commit(next) {
            if running {
                if let Err(undo) = self.dataplane.unpublish(&updated, port).await {
                    tracing::warn!(container = %container.short(), %port, error = %undo, "Failed to undo port publish");
                }
            }
            return Err(e);
        }
        tracing::info!(container = %container.short(), network = %network.name, %port, deferred = !running, "Port published");
        Ok(updated)
    }

    /// Stop forwarding a host port to a container's endpoint. Unpublishing
    /// a port that is not published changes nothing.
    ///
    /// # Errors
    ///
    /// `NetworkNotFound`, `NotConnected`, or the data plane's error; the
    /// mapping is kept on failure.
    pub async fn unpublish_port(
        &self,
        container: &ContainerId,
        reference: &str,
        protocol: Protocol,
        host_port: u16,
    ) -> SkiffResult<Attachment> {
        let _gate = self.writer.lock().await;
        let current = self.snapshot();
        let (network, attachment) = Self::attachment_on(&current, container, reference)?;
        let Some(index) = attachment
            .ports
            .iter()
            .position(|p| p.host_key() == (protocol, host_port))
        else {
            return Ok(attachment);
        };
        let port = attachment.ports[index];
        if self.dataplane.container_running(container).await {
            self.dataplane.unpublish(&attachment, port).await?;
        }

        let mut next = (*current).clone();
        let mut updated = attachment;
        updated.ports.remove(index);
        next.attachments.insert(updated.key(), updated.clone());
        self.commit_logged(next);
        tracing::info!(container = %container.short(), network = %network.name, %port, "Port unpublished");
        Ok(updated)
    }

    /// Forget a removed container: tear down and release all of its
    /// attachments. Returns how many there were.
    pub async fn remove_container(&self, container: &ContainerId) -> usize {
        let _gate = self.writer.lock().await;
        let current = self.snapshot();
        let attachments = current.container_attachments(container);
        for attachment in &attachments {
            self.dataplane.detach(attachment).await;
        }
        self.dataplane.forget_container(container).await;
        if attachments.is_empty() {
            return 0;
        }

        let mut next = (*current).clone();
        for attachment in &attachments {
            next.ipam.release(&attachment.network, container);
            next.attachments.remove(&attachment.key());
        }
        self.commit_logged(next);
        tracing::info!(container = %container.short(), networks = attachments.len(), "Container removed from networks");
        attachments.len()
    }

    /// Bring a (re)started container's recorded attachments up again with
    /// their recorded addresses, MACs and devices. Returns how many came up.
    ///
    /// # Errors
    ///
    /// The first data plane error when no attachment could be restored.
    pub async fn restore_container(&self, container: &ContainerId) -> SkiffResult<usize> {
        let _gate = self.writer.lock().await;
        let current = self.snapshot();
        let attachments = current.container_attachments(container);
        self.dataplane.forget_container(container).await;
        if attachments.is_empty() {
            return Ok(0);
        }
        if !self.dataplane.container_running(container).await {
            tracing::debug!(container = %container.short(), "Container not running, nothing to restore");
            return Ok(0);
        }

        let mut restored = 0;
        let mut first_error = None;
        for attachment in &attachments {
            let Some(network) = current.networks.get(&attachment.network) else {
                continue;
            };
            match self.dataplane.attach(network, attachment).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::warn!(
                        container = %container.short(),
                        network = %network.name,
                        error = %e,
                        "Failed to restore attachment"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        if restored == 0 {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        tracing::info!(container = %container.short(), restored, total = attachments.len(), "Container networks restored");
        Ok(restored)
    }

    /// Rebuild the helper's state: recreate every bridge and re-plumb every
    /// attachment of a running container. Returns the number of attachments
    /// re-plumbed.
    ///
    /// A network whose bridge cannot be recreated is logged and skipped
    /// together with its attachments; the others are still reconciled.
    ///
    /// # Errors
    ///
    /// The first bridge failure when no bridge could be recreated.
    /// Attachment failures are only logged.
    pub async fn reconcile(&self) -> SkiffResult<usize> {
        let _gate = self.writer.lock().await;
        let current = self.snapshot();

        let mut next = (*current).clone();
        let mut renamed = false;
        let mut failed = BTreeSet::new();
        let mut first_error = None;
        for network in current.networks.values() {
            let bridge = match self.dataplane.create_bridge(network).await {
                Ok(bridge) => bridge,
                Err(e) => {
                    tracing::warn!(network = %network.name, error = %e, "Failed to recreate bridge");
                    failed.insert(network.id.clone());
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            if bridge != network.bridge {
                if let Some(entry) = next.networks.get_mut(&network.id) {
                    entry.bridge = bridge;
                    renamed = true;
                }
            }
        }
        if failed.len() == current.networks.len() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        if renamed {
            self.commit_logged(next);
        }

        let state = self.snapshot();
        let mut replumbed = 0;
        for attachment in state.attachments.values() {
            if failed.contains(&attachment.network) {
                continue;
            }
            if !self.dataplane.container_running(&attachment.container).await {
                continue;
            }
            let Some(network) = state.networks.get(&attachment.network) else {
                continue;
            };
            self.dataplane.detach(attachment).await;
            match self.dataplane.attach(network, attachment).await {
                Ok(()) => replumbed += 1,
                Err(e) => tracing::warn!(
                    container = %attachment.container.short(),
                    network = %network.name,
                    error = %e,
                    "Failed to re-plumb attachment"
                ),
            }
        }
        tracing::info!(
            networks = state.networks.len(),
            failed = failed.len(),
            replumbed,
            "Reconciled data plane"
        );
        Ok(replumbed)
    }

    /// A container's attachments, by network id.
    #[must_use]
    pub fn attachments_for(&self, container: &ContainerId) -> Vec<Attachment> {
        self.snapshot().container_attachments(container)
    }
}
