//! Network helper.
//!
//! The helper runs in its own VM and owns one virtual switch per network.
//! Every container attachment becomes a switch port whose frames are pumped
//! to and from the attachment's relay tunnel. The helper also serves
//! container names on each network's gateway address, masquerades traffic
//! leaving each subnet and forwards published ports to their containers.

pub mod dns;
mod learning;
pub mod nat;
mod service;
mod switch;

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use skiff_common::SkiffResult;

use crate::device::FrameDevice;
use crate::mac::MacAddress;

pub use dns::{DnsRecord, DnsmasqProcess, NameResolutionManager, NullResolver, ResolverProcess};
pub use learning::LearningSwitch;
pub use nat::{ForwardRule, IptablesFilter, NullFilter, PacketFilter};
pub use service::HelperService;
pub use switch::{LinuxBridgeBackend, OvsBackend};

/// A virtual switch implementation.
///
/// All operations are idempotent: creating an existing bridge or removing a
/// missing one succeeds.
#[async_trait]
pub trait SwitchBackend: Send + Sync {
    /// Short backend name for health reports.
    fn name(&self) -> &'static str;

    /// Create a bridge and give it the gateway address.
    async fn create_bridge(&self, bridge: &str, gateway: Ipv4Addr, prefix_len: u8) -> SkiffResult<()>;

    /// Remove a bridge.
    async fn delete_bridge(&self, bridge: &str) -> SkiffResult<()>;

    /// Create a port on `bridge` for the interface with address `mac` and
    /// return its frame device.
    async fn add_port(&self, bridge: &str, port: &str, mac: MacAddress) -> SkiffResult<Arc<dyn FrameDevice>>;

    /// Remove a port from `bridge`.
    async fn remove_port(&self, bridge: &str, port: &str) -> SkiffResult<()>;

    /// Backend health; an error means the backend is unusable.
    async fn status(&self) -> SkiffResult<String>;
}
