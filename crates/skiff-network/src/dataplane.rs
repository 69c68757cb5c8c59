//! Data path orchestration.
//!
//! An attachment's data path is three pieces that have to come up in
//! order: the agent's interface (listening on the container port), the
//! helper's switch port (listening on the helper port) and finally the
//! relay that connects both. Teardown runs the other way round and keeps
//! going past failures.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use skiff_common::{ContainerId, NetworkId, SkiffResult};

use crate::config::NetworkConfig;
use crate::ports::RelayPortAllocator;
use crate::proto;
use crate::publish::PublishedPort;
use crate::pump::TrafficStats;
use crate::registry::{Attachment, Network};
use crate::relay::{PacketRelay, RelayHandle};
use crate::rpc::{AgentClient, HelperClient};
use crate::runtime::{ContainerChannel, ContainerRuntime};
use crate::transport::ControlChannel;

/// What the registry needs to materialize its state.
#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Create (or confirm) the switch of a network; returns its name.
    async fn create_bridge(&self, network: &Network) -> SkiffResult<String>;

    /// Remove a network's switch.
    async fn delete_bridge(&self, network: &NetworkId) -> SkiffResult<()>;

    /// Bring up an attachment's data path, undoing partial work on failure.
    async fn attach(&self, network: &Network, attachment: &Attachment) -> SkiffResult<()>;

    /// Tear down an attachment's data path. Never fails; problems are
    /// logged.
    async fn detach(&self, attachment: &Attachment);

    /// Forward another host port to an attachment that is up.
    async fn publish(&self, attachment: &Attachment, port: PublishedPort) -> SkiffResult<()>;

    /// Stop forwarding a host port to an attachment.
    async fn unpublish(&self, attachment: &Attachment, port: PublishedPort) -> SkiffResult<()>;

    /// Whether the container is running.
    async fn container_running(&self, container: &ContainerId) -> bool;

    /// Drop everything cached for a container whose VM went away.
    async fn forget_container(&self, container: &ContainerId);
}

type AttachmentKey = (ContainerId, NetworkId);

/// [`DataPlane`] for containers in VMs: in-VM agents, relays and the
/// helper VM.
pub struct VmDataPlane {
    config: NetworkConfig,
    runtime: Arc<dyn ContainerRuntime>,
    helper_channel: Arc<dyn ControlChannel>,
    helper: HelperClient,
    ports: Arc<RelayPortAllocator>,
    agents: DashMap<ContainerId, AgentClient>,
    relays: DashMap<AttachmentKey, RelayHandle>,
}

impl VmDataPlane {
    /// Data plane reaching containers through `runtime` and the helper
    /// through `helper_channel`.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        runtime: Arc<dyn ContainerRuntime>,
        helper_channel: Arc<dyn ControlChannel>,
    ) -> Self {
        let helper = HelperClient::new(
            Arc::clone(&helper_channel),
            config.helper.control_port,
            config.rpc_timeout(),
            config.helper.retry,
        );
        let ports = Arc::new(RelayPortAllocator::from_config(&config.relay));
        Self {
            config,
            runtime,
            helper_channel,
            helper,
            ports,
            agents: DashMap::new(),
            relays: DashMap::new(),
        }
    }

    /// The helper client.
    #[must_use]
    pub const fn helper(&self) -> &HelperClient {
        &self.helper
    }

    /// The relay port allocator.
    #[must_use]
    pub const fn ports(&self) -> &Arc<RelayPortAllocator> {
        &self.ports
    }

    /// Number of running relays.
    #[must_use]
    pub fn active_relays(&self) -> usize {
        self.relays.len()
    }

    /// Frame counters of an attachment's relay.
    #[must_use]
    pub fn relay_stats(&self, container: &ContainerId, network: &NetworkId) -> Option<Arc<TrafficStats>> {
        self.relays
            .get(&(container.clone(), network.clone()))
            .map(|relay| relay.stats())
    }

    fn channel(&self, container: &ContainerId) -> Arc<dyn ControlChannel> {
        Arc::new(ContainerChannel::new(Arc::clone(&self.runtime), container.clone()))
    }

    /// The container's agent, launching it on first use.
    async fn agent(&self, container: &ContainerId) -> SkiffResult<AgentClient> {
        if let Some(agent) = self.agents.get(container) {
            return Ok(agent.clone());
        }

        let port = self.config.agent.control_port;
        let argv = vec![
            self.config.agent.binary.clone(),
            "--port".to_string(),
            port.to_string(),
        ];
        let process = self.runtime.exec_in_namespace(container, &argv).await?;
        tracing::info!(container = %container.short(), pid = ?process.pid, "Network agent launched");

        let agent = AgentClient::connect(
            container.clone(),
            self.channel(container),
            port,
            self.config.rpc_timeout(),
            self.config.agent.retry,
        )
        .await?;
        self.agents.insert(container.clone(), agent.clone());
        Ok(agent)
    }

    async fn detach_agent(agent: &AgentClient, device: &str) {
        if let Err(e) = agent.detach(device).await {
            tracing::warn!(container = %agent.container().short(), device, error = %e, "Failed to remove interface");
        }
    }

    async fn detach_helper(&self, attachment: &Attachment) {
        if let Err(e) = self
            .helper
            .detach_container(attachment.container.as_str(), attachment.network.as_str())
            .await
        {
            tracing::warn!(
                container = %attachment.container.short(),
                network = %attachment.network.short(),
                error = %e,
                "Failed to detach helper port"
            );
        }
    }
}

#[async_trait]
impl DataPlane for VmDataPlane {
    async fn create_bridge(&self, network: &Network) -> SkiffResult<String> {
        let response = self
            .helper
            .create_bridge(proto::CreateBridgeRequest {
                network_id: network.id.to_string(),
                subnet: network.subnet.to_string(),
                gateway: network.gateway.to_string(),
            })
            .await?;
        Ok(response.bridge_name)
    }

    async fn delete_bridge(&self, network: &NetworkId) -> SkiffResult<()> {
        let existed = self.helper.delete_bridge(network.as_str()).await?;
        tracing::debug!(network = %network.short(), existed, "Bridge removed");
        Ok(())
    }

    async fn attach(&self, network: &Network, attachment: &Attachment) -> SkiffResult<()> {
        let key = (attachment.container.clone(), attachment.network.clone());
        if let Some((_, stale)) = self.relays.remove(&key) {
            stale.stop().await;
        }

        let agent = self.agent(&attachment.container).await?;
        let lease = self.ports.lease()?;
        let ports = lease.pair();
        let device = attachment.device();

        agent
            .configure(proto::ConfigureNetworkRequest {
                device_index: attachment.device_index,
                ip_address: attachment.address.to_string(),
                prefix_length: u32::from(attachment.prefix_len),
                gateway: attachment.gateway.to_string(),
                mac_address: attachment.mac.to_string(),
                dns_server: String::new(),
                relay_port: ports.container_port,
            })
            .await?;

        let attached = self
            .helper
            .attach_container(proto::AttachContainerRequest {
                container_id: attachment.container.to_string(),
                network_id: attachment.network.to_string(),
                helper_port: ports.helper_port,
                mac_address: attachment.mac.to_string(),
                ip_address: attachment.address.to_string(),
                hostname: attachment.hostname.clone().unwrap_or_default(),
                aliases: attachment.aliases.clone(),
                port_mappings: attachment.ports.iter().map(PublishedPort::to_proto).collect(),
            })
            .await;
        let attached = match attached {
            Ok(attached) => attached,
            Err(e) => {
                Self::detach_agent(&agent, &device).await;
                return Err(e);
            }
        };

        let relay = PacketRelay::new(attachment.container.clone(), attachment.network.clone(), lease);
        let container_channel = self.channel(&attachment.container);
        let handle = match relay
            .connect(
                container_channel.as_ref(),
                self.helper_channel.as_ref(),
                self.config.agent.retry,
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.detach_helper(attachment).await;
                Self::detach_agent(&agent, &device).await;
                return Err(e);
            }
        };

        tracing::info!(
            container = %attachment.container.short(),
            network = %network.name,
            bridge = %attached.bridge_name,
            port = %attached.port_name,
            device = %device,
            address = %attachment.address,
            published = attachment.ports.len(),
            container_port = ports.container_port,
            helper_port = ports.helper_port,
            "Data path up"
        );
        self.relays.insert(key, handle);
        Ok(())
    }

    async fn detach(&self, attachment: &Attachment) {
        let key = (attachment.container.clone(), attachment.network.clone());
        if let Some((_, relay)) = self.relays.remove(&key) {
            relay.stop().await;
        }
        self.detach_helper(attachment).await;
        let agent = self
            .agents
            .get(&attachment.container)
            .map(|agent| agent.clone());
        if let Some(agent) = agent {
            Self::detach_agent(&agent, &attachment.device()).await;
        }
        tracing::info!(
            container = %attachment.container.short(),
            network = %attachment.network.short(),
            "Data path down"
        );
    }

    async fn publish(&self, attachment: &Attachment, port: PublishedPort) -> SkiffResult<()> {
        let added = self
            .helper
            .add_port_mapping(attachment.container.as_str(), attachment.network.as_str(), port)
            .await?;
        tracing::debug!(container = %attachment.container.short(), %port, added, "Port forward installed");
        Ok(())
    }

    async fn unpublish(&self, attachment: &Attachment, port: PublishedPort) -> SkiffResult<()> {
        let removed = self
            .helper
            .remove_port_mapping(attachment.container.as_str(), attachment.network.as_str(), port)
            .await?;
        tracing::debug!(container = %attachment.container.short(), %port, removed, "Port forward removed");
        Ok(())
    }

    async fn container_running(&self, container: &ContainerId) -> bool {
        self.runtime.is_running(container).await
    }

    async fn forget_container(&self, container: &ContainerId) {
        let keys: Vec<AttachmentKey> = self
            .relays
            .iter()
            .filter(|entry| &entry.key().0 == container)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, relay)) = self.relays.remove(&key) {
                relay.stop().await;
            }
        }
        self.agents.remove(container);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use crate::helper::{
        HelperService, LearningSwitch, NameResolutionManager, NullFilter, NullResolver, PacketFilter, ResolverProcess,
    };
    use crate::publish::Protocol;
    use crate::mac::MacAddress;
    use crate::naming::BridgeNaming;
    use crate::retry::RetryPolicy;
    use crate::runtime::LoopbackRuntime;
    use crate::transport::{ChannelBinder, LoopbackHub};
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        plane: VmDataPlane,
        runtime: LoopbackRuntime,
        filter: Arc<NullFilter>,
        network: Network,
        stop: CancellationToken,
        _dir: tempfile::TempDir,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.stop.cancel();
        }
    }

    async fn fixture() -> Fixture {
        let hub = LoopbackHub::new();
        let dir = tempfile::tempdir().unwrap();
        let dns = NameResolutionManager::new(
            dir.path(),
            Vec::new(),
            Arc::new(NullResolver::default()) as Arc<dyn ResolverProcess>,
        );
        let filter = Arc::new(NullFilter::default());
        let helper = HelperService::new(
            Arc::new(LearningSwitch::new()),
            Arc::new(hub.binder("helper")),
            Arc::new(dns),
            Arc::clone(&filter) as Arc<dyn PacketFilter>,
            BridgeNaming::default(),
        );
        let config = NetworkConfig::default().with_retry(RetryPolicy {
            initial_delay_ms: 2,
            max_delay_ms: 20,
            max_attempts: 10,
        });
        let listener = hub
            .binder("helper")
            .bind(config.helper.control_port)
            .await
            .unwrap();
        let stop = CancellationToken::new();
        tokio::spawn(helper.serve(listener, stop.clone().cancelled_owned()));

        let runtime = LoopbackRuntime::new(hub.clone());
        let plane = VmDataPlane::new(config, Arc::new(runtime.clone()), Arc::new(hub.channel("helper")));
        let network = Network {
            id: NetworkId::generate(),
            name: "net1".to_string(),
            driver: "bridge".to_string(),
            subnet: "172.30.0.0/24".parse().unwrap(),
            gateway: Ipv4Addr::new(172, 30, 0, 1),
            created: Utc::now(),
            options: Default::default(),
            labels: Default::default(),
            is_default: false,
            bridge: String::new(),
        };
        Fixture {
            plane,
            runtime,
            filter,
            network,
            stop,
            _dir: dir,
        }
    }

    fn attachment(network: &Network, container: &str, last: u8) -> Attachment {
        Attachment {
            container: ContainerId::new(container).unwrap(),
            network: network.id.clone(),
            address: Ipv4Addr::new(172, 30, 0, last),
            prefix_len: 24,
            gateway: network.gateway,
            mac: MacAddress::new([0x02, 0x42, 172, 30, 0, last]),
            device_index: 0,
            aliases: Vec::new(),
            hostname: Some(container.to_string()),
            ports: Vec::new(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn attach_and_detach_round_trip() {
        let f = fixture().await;
        let bridge = f.plane.create_bridge(&f.network).await.unwrap();
        assert!(bridge.starts_with("br-"));

        let web = attachment(&f.network, "web", 2);
        f.runtime.start(&web.container);
        f.plane.attach(&f.network, &web).await.unwrap();

        assert!(f.runtime.has_agent(&web.container));
        let interfaces = f.runtime.interfaces(&web.container).unwrap();
        assert_eq!(interfaces.devices(), vec!["eth0".to_string()]);
        assert_eq!(f.plane.ports().in_use(), 1);
        assert_eq!(f.plane.active_relays(), 1);
        let networks = f.plane.helper().container_networks("web").await.unwrap();
        assert_eq!(networks, vec![f.network.id.to_string()]);

        f.plane.detach(&web).await;
        assert_eq!(f.plane.ports().in_use(), 0);
        assert_eq!(f.plane.active_relays(), 0);
        assert!(interfaces.devices().is_empty());
        assert!(f.plane.helper().container_networks("web").await.unwrap().is_empty());

        // A second detach is harmless.
        f.plane.detach(&web).await;
    }

    #[tokio::test]
    async fn helper_failure_rolls_back_agent_and_ports() {
        let f = fixture().await;
        let web = attachment(&f.network, "web", 2);
        f.runtime.start(&web.container);

        // No bridge was created, so the helper refuses the port.
        assert!(f.plane.attach(&f.network, &web).await.is_err());
        assert!(f.runtime.interfaces(&web.container).unwrap().devices().is_empty());
        assert_eq!(f.plane.ports().in_use(), 0);
        assert_eq!(f.plane.active_relays(), 0);
    }

    #[tokio::test]
    async fn stopped_containers_cannot_attach() {
        let f = fixture().await;
        f.plane.create_bridge(&f.network).await.unwrap();
        let web = attachment(&f.network, "web", 2);
        assert!(!f.plane.container_running(&web.container).await);
        assert!(f.plane.attach(&f.network, &web).await.is_err());
        assert_eq!(f.plane.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn forget_container_stops_its_relays() {
        let f = fixture().await;
        f.plane.create_bridge(&f.network).await.unwrap();
        let web = attachment(&f.network, "web", 2);
        f.runtime.start(&web.container);
        f.plane.attach(&f.network, &web).await.unwrap();

        f.plane.forget_container(&web.container).await;
        assert_eq!(f.plane.active_relays(), 0);
        assert_eq!(f.plane.ports().in_use(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn published_ports_reach_the_helper() {
        let f = fixture().await;
        f.plane.create_bridge(&f.network).await.unwrap();
        let mut web = attachment(&f.network, "web", 2);
        web.ports = vec![PublishedPort::new(Protocol::Tcp, 8080, 80).unwrap()];
        f.runtime.start(&web.container);
        f.plane.attach(&f.network, &web).await.unwrap();

        let forward = |port: &str| format!("forward {} {port} 172.30.0.2", f.network.id);
        assert!(f.filter.rules().contains(&forward("8080:80/tcp")));

        let udp = PublishedPort::new(Protocol::Udp, 5353, 53).unwrap();
        f.plane.publish(&web, udp).await.unwrap();
        assert!(f.filter.rules().contains(&forward("5353:53/udp")));
        f.plane.unpublish(&web, udp).await.unwrap();
        assert!(!f.filter.rules().contains(&forward("5353:53/udp")));

        f.plane.detach(&web).await;
        assert!(!f.filter.rules().iter().any(|rule| rule.starts_with("forward")));
    }
}
