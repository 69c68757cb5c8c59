//! Daemon configuration file.
//!
//! ```toml
//! listen = "127.0.0.1:7070"
//!
//! [helper_endpoint]
//! transport = "hybrid-vsock"
//!
//! [launcher]
//! exec = ["skiff-vmctl", "exec", "--detach", "{container}", "--"]
//!
//! [network.default_network]
//! subnet = "172.17.0.0/16"
//! ```
//!
//! Every section is optional.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};
use skiff_network::NetworkConfig;

/// Placeholder in launcher templates replaced by the container id.
pub const CONTAINER_PLACEHOLDER: &str = "{container}";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address of the `NetworkService` gRPC endpoint.
    pub listen: SocketAddr,
    /// Data root; `SKIFF_ROOT` or `/var/lib/skiff` when unset.
    pub root: Option<PathBuf>,
    /// Network subsystem settings.
    pub network: NetworkConfig,
    /// How to reach the helper VM.
    pub helper_endpoint: HelperEndpoint,
    /// How to run commands in container VMs.
    pub launcher: LauncherConfig,
    /// Helper health polling.
    pub watchdog: WatchdogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7070),
            root: None,
            network: NetworkConfig::default(),
            helper_endpoint: HelperEndpoint::default(),
            launcher: LauncherConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl DaemonConfig {
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

    /// Load `path`. A missing file gives the defaults unless `required`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path, required: bool) -> SkiffResult<Self> {
        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| SkiffError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml(&content)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] describing the first violation.
    pub fn validate(&self) -> SkiffResult<()> {
        self.network.validate()?;
        if self.launcher.exec.is_empty() {
            return Err(SkiffError::Config {
                message: "launcher.exec must name a program".to_string(),
            });
        }
        if self.watchdog.interval_ms == 0 {
            return Err(SkiffError::Config {
                message: "watchdog.interval_ms must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Override the listen address.
    #[must_use]
    pub const fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    /// Override the data root.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }
}

/// Where the helper VM's control port is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum HelperEndpoint {
    /// The helper VM's hybrid vsock socket.
    HybridVsock {
        /// Socket path; the runtime directory's `helper/vsock.sock` when unset.
        #[serde(default)]
        socket: Option<PathBuf>,
    },
    /// A helper running on the host network, for development.
    Tcp {
        /// Helper address.
        host: IpAddr,
        /// Added to every channel port.
        #[serde(default)]
        port_offset: i32,
    },
}

impl Default for HelperEndpoint {
    fn default() -> Self {
        Self::HybridVsock { socket: None }
    }
}

/// Commands the daemon runs against container VMs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Starts a detached process in a container. `{container}` is replaced
    /// by the container id and the process's argv is appended. A pid printed
    /// on the first line of output is recorded.
    pub exec: Vec<String>,
    /// Exits successfully when the container runs. When empty, a container
    /// counts as running while its vsock socket exists.
    pub status: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            exec: ["skiff-vmctl", "exec", "--detach", CONTAINER_PLACEHOLDER, "--"]
                .map(String::from)
                .to_vec(),
            status: Vec::new(),
        }
    }
}

/// Helper health polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Whether to poll at all.
    pub enabled: bool,
    /// Poll interval in milliseconds.
    pub interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
        }
    }
}

impl WatchdogConfig {
    /// Poll interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config.listen.port(), 7070);
        assert_eq!(config.helper_endpoint, HelperEndpoint::HybridVsock { socket: None });
        assert_eq!(config.launcher.exec[3], CONTAINER_PLACEHOLDER);
        assert!(config.watchdog.enabled);
        assert_eq!(config.network.default_network.name, "bridge");
    }

    #[test]
    fn parses_sections() {
        let config = DaemonConfig::from_toml(
            r#"
            listen = "0.0.0.0:9000"
            root = "/srv/skiff"

            [helper_endpoint]
            transport = "tcp"
            host = "127.0.0.1"
            port_offset = 30000

            [launcher]
            exec = ["vmctl", "run", "{container}"]
            status = ["vmctl", "alive", "{container}"]

            [watchdog]
            interval_ms = 250

            [network]
            rpc_timeout_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.root, Some(PathBuf::from("/srv/skiff")));
        assert_eq!(
            config.helper_endpoint,
            HelperEndpoint::Tcp {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port_offset: 30000,
            }
        );
        assert_eq!(config.launcher.status.len(), 3);
        assert_eq!(config.watchdog.interval(), Duration::from_millis(250));
        assert_eq!(config.network.rpc_timeout_ms, 1500);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(DaemonConfig::from_toml("[helper_endpoint]\ntransport = \"carrier-pigeon\"").is_err());
        assert!(DaemonConfig::from_toml("[launcher]\nexec = []").is_err());
        assert!(DaemonConfig::from_toml("[watchdog]\ninterval_ms = 0").is_err());
    }

    #[test]
    fn missing_file_is_optional_unless_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skiffd.toml");
        assert!(DaemonConfig::load(&path, false).is_ok());
        assert!(matches!(
            DaemonConfig::load(&path, true),
            Err(SkiffError::Config { .. })
        ));

        std::fs::write(&path, "listen = \"127.0.0.1:7171\"").unwrap();
        assert_eq!(DaemonConfig::load(&path, true).unwrap().listen.port(), 7171);
    }

    #[test]
    fn overrides() {
        let listen: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let config = DaemonConfig::default().with_listen(listen).with_root("/tmp/x");
        assert_eq!(config.listen, listen);
        assert_eq!(config.root, Some(PathBuf::from("/tmp/x")));
    }
}
