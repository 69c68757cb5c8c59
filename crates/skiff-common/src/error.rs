//! Error taxonomy for the Skiff network subsystem.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`SkiffError`].
pub type SkiffResult<T> = Result<T, SkiffError>;

/// Errors raised by the registry, the data plane and the VM-side services.
#[derive(Error, Diagnostic, Debug)]
pub enum SkiffError {
    /// No network matches the given id, name or id prefix.
    #[error("Network not found: {id}")]
    #[diagnostic(code(skiff::network::not_found))]
    NetworkNotFound {
        /// The id or name that was looked up.
        id: String,
    },

    /// Another network already uses this name.
    #[error("Network with name {name} already exists")]
    #[diagnostic(code(skiff::network::name_conflict))]
    NetworkNameConflict {
        /// The conflicting name.
        name: String,
    },

    /// The container already has an endpoint on the network.
    #[error("Container {container} is already connected to network {network}")]
    #[diagnostic(code(skiff::endpoint::already_connected))]
    AlreadyConnected {
        /// Container id.
        container: String,
        /// Network id.
        network: String,
    },

    /// The container has no endpoint on the network.
    #[error("Container {container} is not connected to network {network}")]
    #[diagnostic(code(skiff::endpoint::not_connected))]
    NotConnected {
        /// Container id.
        container: String,
        /// Network id.
        network: String,
    },

    /// Every usable address of the subnet is taken.
    #[error("No available addresses in {subnet} (network {network})")]
    #[diagnostic(
        code(skiff::ipam::exhausted),
        help("Disconnect unused containers or create the network with a larger subnet")
    )]
    AddressExhausted {
        /// Network id.
        network: String,
        /// Subnet in CIDR notation.
        subnet: String,
    },

    /// A requested address cannot be handed out.
    #[error("Address {address} is not available: {reason}")]
    #[diagnostic(code(skiff::ipam::conflict))]
    AddressConflict {
        /// The requested address.
        address: String,
        /// Why it was refused.
        reason: String,
    },

    /// The subnet is malformed, too small, or overlaps a live network.
    #[error("Invalid subnet {subnet}: {reason}")]
    #[diagnostic(code(skiff::ipam::invalid_subnet))]
    InvalidSubnet {
        /// Subnet as given.
        subnet: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The network still has endpoints.
    #[error("Network {network} has {endpoints} active endpoint(s)")]
    #[diagnostic(
        code(skiff::network::in_use),
        help("Disconnect the containers first or delete with force")
    )]
    NetworkInUse {
        /// Network id.
        network: String,
        /// Number of attachments.
        endpoints: usize,
    },

    /// A published host port is already bound to another endpoint.
    #[error("Host port {port} is already allocated to container {container}")]
    #[diagnostic(code(skiff::endpoint::port_allocated))]
    PortAllocated {
        /// Host port with protocol, e.g. `8080/tcp`.
        port: String,
        /// Container holding the port.
        container: String,
    },

    /// No relay port pair is free.
    #[error("No relay ports available in range {first}..{last}")]
    #[diagnostic(code(skiff::relay::ports_exhausted))]
    RelayPortsExhausted {
        /// First container-facing port of the range.
        first: u32,
        /// One past the last container-facing port.
        last: u32,
    },

    /// The helper could not create, change or remove a bridge or port.
    #[error("Bridge operation failed: {message}")]
    #[diagnostic(code(skiff::helper::bridge))]
    BridgeOperationFailed {
        /// The error message.
        message: String,
    },

    /// The in-VM agent rejected a request.
    #[error("Network agent in container {container} failed: {message}")]
    #[diagnostic(code(skiff::agent::failed))]
    AgentOperationFailed {
        /// Container id.
        container: String,
        /// The error message.
        message: String,
    },

    /// The in-VM agent could not be reached.
    #[error("Network agent in container {container} is unreachable: {message}")]
    #[diagnostic(code(skiff::agent::unreachable))]
    AgentUnreachable {
        /// Container id.
        container: String,
        /// The underlying failure.
        message: String,
    },

    /// The helper VM could not be reached.
    #[error("Network helper is unreachable: {message}")]
    #[diagnostic(
        code(skiff::helper::unreachable),
        help("Check that the helper VM is running")
    )]
    HelperUnreachable {
        /// The underlying failure.
        message: String,
    },

    /// The operation is refused by policy.
    #[error("Operation not permitted: {operation}")]
    #[diagnostic(code(skiff::not_permitted))]
    OperationNotPermitted {
        /// The refused operation.
        operation: String,
    },

    /// The request itself is malformed.
    #[error("Invalid request: {message}")]
    #[diagnostic(code(skiff::invalid_request))]
    InvalidRequest {
        /// The error message.
        message: String,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(skiff::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(skiff::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(skiff::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(skiff::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(skiff::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl SkiffError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AgentUnreachable { .. } | Self::HelperUnreachable { .. }
        )
    }

    /// HTTP status code the Docker-facing handlers should answer with.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::NetworkNotFound { .. } | Self::NotConnected { .. } => 404,
            Self::NetworkNameConflict { .. }
            | Self::AlreadyConnected { .. }
            | Self::PortAllocated { .. }
            | Self::NetworkInUse { .. } => 409,
            Self::AddressConflict { .. }
            | Self::InvalidSubnet { .. }
            | Self::InvalidRequest { .. }
            | Self::InvalidContainerId { .. } => 400,
            Self::OperationNotPermitted { .. } => 403,
            Self::AddressExhausted { .. }
            | Self::RelayPortsExhausted { .. }
            | Self::BridgeOperationFailed { .. }
            | Self::AgentOperationFailed { .. }
            | Self::AgentUnreachable { .. }
            | Self::HelperUnreachable { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Config { .. }
            | Self::Internal { .. } => 500,
        }
    }
}

impl From<serde_json::Error> for SkiffError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SkiffError::AlreadyConnected {
            container: "web".to_string(),
            network: "net1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Container web is already connected to network net1"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SkiffError = io_err.into();
        assert!(matches!(err, SkiffError::Io(_)));
    }

    #[test]
    fn only_unreachable_errors_are_transient() {
        assert!(
            SkiffError::HelperUnreachable {
                message: "refused".into()
            }
            .is_transient()
        );
        assert!(
            SkiffError::AgentUnreachable {
                container: "c".into(),
                message: "refused".into()
            }
            .is_transient()
        );
        assert!(
            !SkiffError::InvalidRequest {
                message: "bad mac".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn http_mapping() {
        let not_found = SkiffError::NetworkNotFound { id: "x".into() };
        let in_use = SkiffError::NetworkInUse {
            network: "x".into(),
            endpoints: 2,
        };
        let default_net = SkiffError::OperationNotPermitted {
            operation: "delete default network".into(),
        };
        assert_eq!(not_found.http_status(), 404);
        assert_eq!(in_use.http_status(), 409);
        assert_eq!(default_net.http_status(), 403);
        let taken = SkiffError::PortAllocated {
            port: "8080/tcp".into(),
            container: "web".into(),
        };
        assert_eq!(taken.http_status(), 409);
        assert_eq!(
            taken.to_string(),
            "Host port 8080/tcp is already allocated to container web"
        );
    }
}
