//! In-VM network agent.
//!
//! The agent runs inside each container VM and owns its `ethN` interfaces.
//! For every attachment it creates an interface, configures addressing,
//! listens on the attachment's relay port and pumps frames between the
//! tunnel and the interface.

mod interfaces;
mod service;

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use skiff_common::SkiffResult;

use crate::device::FrameDevice;
use crate::mac::MacAddress;

pub use interfaces::{DEFAULT_RESOLV_CONF, LinuxInterfaces, MemoryInterfaces};
pub use service::AgentService;

/// Desired configuration of one container interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    /// Interface name, `eth{index}`.
    pub device: String,
    /// Device index.
    pub index: u32,
    /// Container address.
    pub address: Ipv4Addr,
    /// Subnet prefix length.
    pub prefix_len: u8,
    /// Network gateway.
    pub gateway: Ipv4Addr,
    /// Interface MAC address.
    pub mac: MacAddress,
    /// Whether to install the default route through `gateway`.
    pub default_route: bool,
}

/// Creates and removes the interfaces the agent pumps frames into.
#[async_trait]
pub trait InterfaceProvisioner: Send + Sync {
    /// Create and configure an interface, returning its frame device.
    async fn create(&self, spec: &InterfaceSpec) -> SkiffResult<Arc<dyn FrameDevice>>;

    /// Remove an interface. Removing a missing interface succeeds.
    async fn remove(&self, device: &str) -> SkiffResult<()>;

    /// Point the container's resolver at `nameserver`.
    async fn write_resolver(&self, nameserver: Ipv4Addr) -> SkiffResult<()>;
}
