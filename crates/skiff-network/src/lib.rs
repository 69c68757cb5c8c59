//! # skiff-network
//!
//! Docker-style bridge networking for containers that each run in their own
//! micro-VM.
//!
//! No two container VMs share an L2 segment, so every attachment is stitched
//! together from three pieces:
//! - an in-VM agent that owns the container's `ethN` interface ([`agent`])
//! - a helper VM that owns one virtual switch per network ([`helper`])
//! - a host-side relay that shuttles length-prefixed Ethernet frames between
//!   the two over control channels ([`relay`])
//!
//! The [`registry`] is the single source of truth for networks and
//! attachments and drives the other components through the [`dataplane`].

#![warn(missing_docs)]

pub mod agent;
pub mod command;
pub mod config;
pub mod dataplane;
pub mod device;
pub mod frame;
pub mod helper;
pub mod ipam;
pub mod mac;
pub mod naming;
pub mod ports;
pub mod proto;
pub mod publish;
pub mod pump;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod rpc;
pub mod runtime;
pub mod store;
pub mod tap;
pub mod transport;

pub use config::NetworkConfig;
pub use dataplane::{DataPlane, VmDataPlane};
pub use ipam::Ipam;
pub use mac::MacAddress;
pub use ports::{RelayPortAllocator, RelayPortPair};
pub use publish::{Protocol, PublishedPort};
pub use registry::{Attachment, ConnectRequest, CreateNetworkRequest, Network, NetworkRegistry};
pub use relay::{PacketRelay, RelayHandle};
pub use retry::RetryPolicy;
pub use runtime::ContainerRuntime;
pub use transport::{ChannelBinder, ChannelListener, ChannelStream, ControlChannel};
