//! Network subsystem configuration.
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! rpc_timeout_ms = 10000
//!
//! [default_network]
//! name = "bridge"
//! subnet = "172.17.0.0/16"
//!
//! [[address_pools]]
//! base = "172.16.0.0/12"
//! size = 16
//!
//! [relay]
//! port_base = 20000
//! port_count = 10000
//! helper_offset = 10000
//! ```

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};

use crate::naming::BridgeNaming;
use crate::retry::RetryPolicy;

/// Control port the in-VM agent listens on.
pub const DEFAULT_AGENT_PORT: u32 = 5555;

/// Control port the helper listens on.
pub const DEFAULT_HELPER_PORT: u32 = 9999;

fn cidr(octets: [u8; 4], prefix: u8) -> Ipv4Net {
    let addr = Ipv4Addr::from(octets);
    Ipv4Net::new(addr, prefix).unwrap_or_else(|_| Ipv4Net::from(addr))
}

/// Configuration shared by the registry and the data plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// The network created at daemon startup.
    pub default_network: DefaultNetworkConfig,
    /// Pools that automatic subnets are carved from, in order.
    pub address_pools: Vec<AddressPool>,
    /// Relay port range.
    pub relay: RelayConfig,
    /// In-VM agent settings.
    pub agent: AgentConfig,
    /// Helper settings.
    pub helper: HelperConfig,
    /// Bridge name derivation.
    pub bridge_naming: BridgeNaming,
    /// Per-RPC deadline in milliseconds.
    pub rpc_timeout_ms: u64,
    /// First two octets of generated MAC addresses.
    pub mac_prefix: [u8; 2],
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_network: DefaultNetworkConfig::default(),
            address_pools: vec![
                AddressPool::new(cidr([172, 16, 0, 0], 12), 16),
                AddressPool::new(cidr([192, 168, 0, 0], 16), 20),
            ],
            relay: RelayConfig::default(),
            agent: AgentConfig::default(),
            helper: HelperConfig::default(),
            bridge_naming: BridgeNaming::default(),
            rpc_timeout_ms: 10_000,
            mac_prefix: [0x02, 0x42],
        }
    }
}

impl NetworkConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml(content: &str) -> SkiffResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| SkiffError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> SkiffResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] describing the first violation.
    pub fn validate(&self) -> SkiffResult<()> {
        self.relay.validate()?;
        self.bridge_naming.validate()?;
        if self.default_network.name.is_empty() {
            return Err(SkiffError::Config {
                message: "default network name must not be empty".to_string(),
            });
        }
        for pool in &self.address_pools {
            if pool.size < pool.base.prefix_len() || pool.size > 30 {
                return Err(SkiffError::Config {
                    message: format!(
                        "address pool {} cannot be split into /{} subnets",
                        pool.base, pool.size
                    ),
                });
            }
        }
        if self.mac_prefix[0] & 0x01 != 0 {
            return Err(SkiffError::Config {
                message: "mac_prefix must describe a unicast address".to_string(),
            });
        }
        Ok(())
    }

    /// Per-RPC deadline.
    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Replace the relay port range.
    #[must_use]
    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Replace the retry policy used for both agent and helper calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.agent.retry = retry;
        self.helper.retry = retry;
        self
    }

    /// Replace the default network's subnet.
    #[must_use]
    pub fn with_default_subnet(mut self, subnet: Ipv4Net) -> Self {
        self.default_network.subnet = subnet;
        self
    }
}

/// The network every daemon starts with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultNetworkConfig {
    /// Network name (default: `bridge`).
    pub name: String,
    /// Subnet (default: 172.17.0.0/16).
    pub subnet: Ipv4Net,
}

impl Default for DefaultNetworkConfig {
    fn default() -> Self {
        Self {
            name: "bridge".to_string(),
            subnet: cidr([172, 17, 0, 0], 16),
        }
    }
}

/// A range that automatic subnets of a fixed size are taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPool {
    /// The range to split.
    pub base: Ipv4Net,
    /// Prefix length of each subnet handed out.
    pub size: u8,
}

impl AddressPool {
    /// Create a pool.
    #[must_use]
    pub const fn new(base: Ipv4Net, size: u8) -> Self {
        Self { base, size }
    }
}

/// Relay port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// First container-facing port.
    pub port_base: u32,
    /// Number of container-facing ports.
    pub port_count: u32,
    /// Distance from a container-facing port to its helper-facing port.
    pub helper_offset: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port_base: 20_000,
            port_count: 10_000,
            helper_offset: 10_000,
        }
    }
}

impl RelayConfig {
    fn validate(&self) -> SkiffResult<()> {
        if self.port_count == 0 {
            return Err(SkiffError::Config {
                message: "relay.port_count must be positive".to_string(),
            });
        }
        if self.helper_offset < self.port_count {
            return Err(SkiffError::Config {
                message: "relay.helper_offset must not be smaller than relay.port_count".to_string(),
            });
        }
        let last = self
            .port_base
            .checked_add(self.port_count)
            .and_then(|end| end.checked_add(self.helper_offset));
        if last.is_none() {
            return Err(SkiffError::Config {
                message: "relay port range overflows".to_string(),
            });
        }
        Ok(())
    }
}

/// In-VM agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Path of the agent binary inside the container VM.
    pub binary: String,
    /// Control port the agent listens on.
    pub control_port: u32,
    /// Connect and call retry policy.
    pub retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "/sbin/skiff-agent".to_string(),
            control_port: DEFAULT_AGENT_PORT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Helper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Control port the helper listens on.
    pub control_port: u32,
    /// Call retry policy.
    pub retry: RetryPolicy,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_HELPER_PORT,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = NetworkConfig::from_toml("").unwrap();
        assert_eq!(config.default_network.name, "bridge");
        assert_eq!(config.default_network.subnet.to_string(), "172.17.0.0/16");
        assert_eq!(config.agent.control_port, 5555);
        assert_eq!(config.helper.control_port, 9999);
        assert_eq!(config.relay.helper_offset, 10_000);
        assert_eq!(config.address_pools.len(), 2);
    }

    #[test]
    fn sections_override_defaults() {
        let config = NetworkConfig::from_toml(
            r#"
            rpc_timeout_ms = 500

            [default_network]
            subnet = "10.88.0.0/16"

            [relay]
            port_base = 40000
            port_count = 100
            helper_offset = 1000

            [[address_pools]]
            base = "10.200.0.0/16"
            size = 24
            "#,
        )
        .unwrap();
        assert_eq!(config.rpc_timeout(), Duration::from_millis(500));
        assert_eq!(config.default_network.name, "bridge");
        assert_eq!(config.default_network.subnet.to_string(), "10.88.0.0/16");
        assert_eq!(config.relay.port_base, 40_000);
        assert_eq!(config.address_pools[0].size, 24);
    }

    #[test]
    fn overlapping_relay_ranges_are_rejected() {
        let err = NetworkConfig::from_toml(
            r"
            [relay]
            port_count = 20000
            helper_offset = 10000
            ",
        )
        .unwrap_err();
        assert!(matches!(err, SkiffError::Config { .. }));
    }

    #[test]
    fn multicast_mac_prefix_is_rejected() {
        let err = NetworkConfig::from_toml("mac_prefix = [1, 0]").unwrap_err();
        assert!(err.to_string().contains("unicast"));
    }
}
