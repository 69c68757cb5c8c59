//! Interface provisioners: TAP devices configured with `ip`, and an
//! in-memory variant.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use skiff_common::{SkiffError, SkiffResult};

use super::{InterfaceProvisioner, InterfaceSpec};
use crate::command::{self, CommandError};
use crate::device::{FrameDevice, MemoryDevice};
use crate::tap::TapDevice;

/// Resolver configuration written for device 0.
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

fn command_failed(err: &CommandError) -> SkiffError {
    SkiffError::Internal {
        message: err.to_string(),
    }
}

fn resolver_config(nameserver: Ipv4Addr) -> String {
    format!("# Generated by skiff-agent\nnameserver {nameserver}\n")
}

/// TAP interfaces configured through iproute2.
#[derive(Debug, Clone)]
pub struct LinuxInterfaces {
    resolv_conf: PathBuf,
}

impl LinuxInterfaces {
    /// Provisioner writing the resolver configuration to `resolv_conf`.
    #[must_use]
    pub fn new(resolv_conf: impl Into<PathBuf>) -> Self {
        Self {
            resolv_conf: resolv_conf.into(),
        }
    }

    async fn configure(spec: &InterfaceSpec) -> Result<(), CommandError> {
        let dev = spec.device.as_str();
        let mac = spec.mac.to_string();
        let cidr = format!("{}/{}", spec.address, spec.prefix_len);

        command::run("ip", &["link", "set", "dev", dev, "address", &mac]).await?;
        command::run("ip", &["addr", "flush", "dev", dev]).await?;
        command::run("ip", &["addr", "add", &cidr, "dev", dev]).await?;
        command::run("ip", &["link", "set", "dev", dev, "up"]).await?;
        if spec.default_route {
            let gateway = spec.gateway.to_string();
            command::run(
                "ip",
                &["route", "replace", "default", "via", &gateway, "dev", dev],
            )
            .await?;
        }
        Ok(())
    }
}

impl Default for LinuxInterfaces {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLV_CONF)
    }
}

#[async_trait]
impl InterfaceProvisioner for LinuxInterfaces {
    async fn create(&self, spec: &InterfaceSpec) -> SkiffResult<Arc<dyn FrameDevice>> {
        let tap = TapDevice::open(&spec.device).map_err(|e| SkiffError::Internal {
            message: format!("failed to create TAP device {}: {e}", spec.device),
        })?;
        // The interface vanishes with `tap` if configuration fails.
        Self::configure(spec).await.map_err(|e| command_failed(&e))?;
        tracing::info!(
            device = %spec.device,
            address = %spec.address,
            prefix = spec.prefix_len,
            mac = %spec.mac,
            "Interface configured"
        );
        Ok(Arc::new(tap))
    }

    async fn remove(&self, device: &str) -> SkiffResult<()> {
        match command::run("ip", &["link", "delete", "dev", device]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(command_failed(&e)),
        }
    }

    async fn write_resolver(&self, nameserver: Ipv4Addr) -> SkiffResult<()> {
        tokio::fs::write(&self.resolv_conf, resolver_config(nameserver)).await?;
        tracing::debug!(path = %self.resolv_conf.display(), %nameserver, "Resolver configured");
        Ok(())
    }
}

/// In-memory interfaces, for agents that run without a kernel network stack
/// (in-process deployments and tests).
///
/// Each interface is one end of a [`MemoryDevice`] pair; the other end plays
/// the container's kernel and is available through
/// [`MemoryInterfaces::kernel_side`].
#[derive(Debug, Default, Clone)]
pub struct MemoryInterfaces {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    kernels: HashMap<String, Arc<MemoryDevice>>,
    specs: HashMap<String, InterfaceSpec>,
    nameserver: Option<Ipv4Addr>,
}

impl MemoryInterfaces {
    /// No interfaces yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The container-kernel end of an interface.
    #[must_use]
    pub fn kernel_side(&self, device: &str) -> Option<Arc<MemoryDevice>> {
        self.state.lock().kernels.get(device).cloned()
    }

    /// The configuration an interface was created with.
    #[must_use]
    pub fn spec(&self, device: &str) -> Option<InterfaceSpec> {
        self.state.lock().specs.get(device).cloned()
    }

    /// Names of the current interfaces, sorted.
    #[must_use]
    pub fn devices(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().specs.keys().cloned().collect();
        names.sort();
        names
    }

    /// The last nameserver written.
    #[must_use]
    pub fn nameserver(&self) -> Option<Ipv4Addr> {
        self.state.lock().nameserver
    }
}

#[async_trait]
impl InterfaceProvisioner for MemoryInterfaces {
    async fn create(&self, spec: &InterfaceSpec) -> SkiffResult<Arc<dyn FrameDevice>> {
        let (device, kernel) =
            MemoryDevice::pair(spec.device.clone(), format!("{}-kernel", spec.device));
        let mut state = self.state.lock();
        state.kernels.insert(spec.device.clone(), Arc::new(kernel));
        state.specs.insert(spec.device.clone(), spec.clone());
        Ok(Arc::new(device))
    }

    async fn remove(&self, device: &str) -> SkiffResult<()> {
        let mut state = self.state.lock();
        state.kernels.remove(device);
        state.specs.remove(device);
        Ok(())
    }

    async fn write_resolver(&self, nameserver: Ipv4Addr) -> SkiffResult<()> {
        self.state.lock().nameserver = Some(nameserver);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::MacAddress;

    fn spec(index: u32) -> InterfaceSpec {
        InterfaceSpec {
            device: format!("eth{index}"),
            index,
            address: Ipv4Addr::new(172, 30, 0, 2),
            prefix_len: 24,
            gateway: Ipv4Addr::new(172, 30, 0, 1),
            mac: MacAddress::new([0x02, 0x42, 0, 0, 0, 1]),
            default_route: index == 0,
        }
    }

    #[tokio::test]
    async fn memory_interfaces_expose_the_kernel_side() {
        let interfaces = MemoryInterfaces::new();
        let device = interfaces.create(&spec(0)).await.unwrap();
        let kernel = interfaces.kernel_side("eth0").unwrap();

        device.send_frame(&[7u8; 20]).await.unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(kernel.recv_frame(&mut buf).await.unwrap(), 20);
        assert_eq!(interfaces.devices(), vec!["eth0".to_string()]);

        interfaces.remove("eth0").await.unwrap();
        interfaces.remove("eth0").await.unwrap();
        assert!(interfaces.kernel_side("eth0").is_none());
    }

    #[tokio::test]
    async fn resolver_file_names_the_nameserver() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        LinuxInterfaces::new(&path)
            .write_resolver(Ipv4Addr::new(172, 30, 0, 1))
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.lines().any(|l| l == "nameserver 172.30.0.1"));
    }
}
