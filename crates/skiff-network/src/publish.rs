//! Published ports: host ports forwarded to a container endpoint.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};

use crate::proto;

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Lowercase name as `iptables -p` expects it.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = SkiffError;

    /// Case-insensitive; empty means TCP.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(SkiffError::InvalidRequest {
                message: format!("invalid protocol {s:?} (must be tcp or udp)"),
            }),
        }
    }
}

/// A host port forwarded to a port of the container's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublishedPort {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Port on the helper's external interface.
    pub host_port: u16,
    /// Port on the container's address.
    pub container_port: u16,
}

impl PublishedPort {
    /// A validated mapping.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if either port is zero.
    pub fn new(protocol: Protocol, host_port: u16, container_port: u16) -> SkiffResult<Self> {
        if host_port == 0 || container_port == 0 {
            return Err(SkiffError::InvalidRequest {
                message: format!("invalid port mapping {host_port}:{container_port}/{protocol}"),
            });
        }
        Ok(Self {
            protocol,
            host_port,
            container_port,
        })
    }

    /// The `(protocol, host port)` pair that must be unique per helper.
    #[must_use]
    pub const fn host_key(&self) -> (Protocol, u16) {
        (self.protocol, self.host_port)
    }

    /// Parse and validate a wire mapping.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an unknown protocol or out-of-range ports.
    pub fn from_proto(mapping: &proto::PortMapping) -> SkiffResult<Self> {
        let port = |value: u32| {
            u16::try_from(value).map_err(|_| SkiffError::InvalidRequest {
                message: format!("port {value} out of range"),
            })
        };
        Self::new(
            mapping.protocol.parse()?,
            port(mapping.host_port)?,
            port(mapping.container_port)?,
        )
    }

    /// Wire form.
    #[must_use]
    pub fn to_proto(&self) -> proto::PortMapping {
        proto::PortMapping {
            protocol: self.protocol.to_string(),
            host_port: u32::from(self.host_port),
            container_port: u32::from(self.container_port),
        }
    }
}

impl fmt::Display for PublishedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host_port, self.container_port, self.protocol)
    }
}

/// Parse mappings, rejecting two that claim the same host port.
///
/// # Errors
///
/// `InvalidRequest` for a malformed or duplicated mapping.
pub fn parse_mappings(mappings: &[proto::PortMapping]) -> SkiffResult<Vec<PublishedPort>> {
    let mut ports: Vec<PublishedPort> = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let port = PublishedPort::from_proto(mapping)?;
        if ports.iter().any(|p| p.host_key() == port.host_key()) {
            return Err(SkiffError::InvalidRequest {
                message: format!("host port {}/{} published twice", port.host_port, port.protocol),
            });
        }
        ports.push(port);
    }
    Ok(ports)
}
