//! Kernel switch backends: Linux bridges and Open vSwitch, with TAP ports.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use skiff_common::{SkiffError, SkiffResult};

use super::SwitchBackend;
use crate::command::{CommandError, Tool};
use crate::device::FrameDevice;
use crate::mac::MacAddress;
use crate::tap::TapDevice;

fn bridge_failed(err: &CommandError) -> SkiffError {
    SkiffError::BridgeOperationFailed {
        message: err.to_string(),
    }
}

async fn exec(tool: &Tool, args: &[&str]) -> SkiffResult<String> {
    tool.run(args).await.map_err(|e| bridge_failed(&e))
}

/// Tolerates "does not exist" failures of removals.
async fn exec_remove(tool: &Tool, args: &[&str]) -> SkiffResult<()> {
    match tool.run(args).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(bridge_failed(&e)),
    }
}

async fn link_exists(ip: &Tool, name: &str) -> bool {
    ip.run(&["link", "show", "dev", name]).await.is_ok()
}

async fn address_bridge(ip: &Tool, bridge: &str, gateway: Ipv4Addr, prefix_len: u8) -> SkiffResult<()> {
    let cidr = format!("{gateway}/{prefix_len}");
    exec(ip, &["addr", "replace", &cidr, "dev", bridge]).await?;
    exec(ip, &["link", "set", "dev", bridge, "up"]).await?;
    Ok(())
}

fn open_tap(port: &str) -> SkiffResult<TapDevice> {
    TapDevice::open(port).map_err(|e| SkiffError::BridgeOperationFailed {
        message: format!("failed to create port {port}: {e}"),
    })
}

/// Linux bridges (`ip link ... type bridge`).
#[derive(Debug, Clone)]
pub struct LinuxBridgeBackend {
    ip: Tool,
    bridge: Tool,
}

impl Default for LinuxBridgeBackend {
    fn default() -> Self {
        Self {
            ip: Tool::new("ip"),
            bridge: Tool::new("bridge"),
        }
    }
}

impl LinuxBridgeBackend {
    /// A backend using the kernel bridge driver through `ip` and `bridge`
    /// from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enslave an existing link to `bridge` and pin `mac` to it.
    async fn plug(&self, bridge: &str, port: &str, mac: MacAddress) -> SkiffResult<()> {
        exec(&self.ip, &["link", "set", "dev", port, "master", bridge]).await?;
        exec(&self.ip, &["link", "set", "dev", port, "up"]).await?;
        let mac = mac.to_string();
        if let Err(e) = self
            .bridge
            .run(&["fdb", "replace", &mac, "dev", port, "master", "static"])
            .await
        {
            // The bridge still learns the address from traffic.
            tracing::warn!(bridge, port, %mac, error = %e, "Failed to pin port address");
        }
        Ok(())
    }
}

#[async_trait]
impl SwitchBackend for LinuxBridgeBackend {
    fn name(&self) -> &'static str {
        "linux-bridge"
    }

    async fn create_bridge(&self, bridge: &str, gateway: Ipv4Addr, prefix_len: u8) -> SkiffResult<()> {
        tracing::debug!(bridge, "Creating bridge");
        if !link_exists(&self.ip, bridge).await {
            exec(&self.ip, &["link", "add", "name", bridge, "type", "bridge"]).await?;
        }
        address_bridge(&self.ip, bridge, gateway, prefix_len).await?;
        tracing::info!(bridge, %gateway, "Bridge created");
        Ok(())
    }

    async fn delete_bridge(&self, bridge: &str) -> SkiffResult<()> {
        exec_remove(&self.ip, &["link", "delete", "dev", bridge, "type", "bridge"]).await?;
        tracing::info!(bridge, "Bridge deleted");
        Ok(())
    }

    async fn add_port(&self, bridge: &str, port: &str, mac: MacAddress) -> SkiffResult<Arc<dyn FrameDevice>> {
        let tap = open_tap(port)?;
        self.plug(bridge, port, mac).await?;
        tracing::debug!(bridge, port, %mac, "Port added");
        Ok(Arc::new(tap))
    }

    async fn remove_port(&self, _bridge: &str, port: &str) -> SkiffResult<()> {
        exec_remove(&self.ip, &["link", "delete", "dev", port]).await
    }

    async fn status(&self) -> SkiffResult<String> {
        let out = exec(&self.ip, &["-br", "link", "show", "type", "bridge"]).await?;
        Ok(format!("ok ({} bridges)", out.lines().count()))
    }
}

/// Open vSwitch bridges managed with `ovs-vsctl`.
///
/// Checksum and segmentation offloads are disabled on every port: frames
/// leave the switch through a userspace tunnel and must be complete.
#[derive(Debug, Clone)]
pub struct OvsBackend {
    vsctl: Tool,
    ethtool: Tool,
    ip: Tool,
}

impl Default for OvsBackend {
    fn default() -> Self {
        Self {
            vsctl: Tool::new("ovs-vsctl"),
            ethtool: Tool::new("ethtool"),
            ip: Tool::new("ip"),
        }
    }
}

impl OvsBackend {
    /// A backend using `ovs-vsctl`, `ethtool` and `ip` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn vsctl(&self, args: &[&str]) -> SkiffResult<String> {
        exec(&self.vsctl, args).await
    }

    async fn disable_offloads(&self, port: &str) -> SkiffResult<()> {
        self.ethtool
            .run(&["-K", port, "tx", "off", "rx", "off", "tso", "off", "gso", "off", "gro", "off"])
            .await
            .map(drop)
            .map_err(|e| SkiffError::BridgeOperationFailed {
                message: format!("failed to disable offloads on {port}: {e}"),
            })
    }

    /// Add an existing link to `bridge`; the port is removed again if it
    /// cannot be brought up.
    async fn plug(&self, bridge: &str, port: &str, mac: MacAddress) -> SkiffResult<()> {
        let attached = format!("external_ids:attached-mac={mac}");
        self.vsctl(&["--may-exist", "add-port", bridge, port, "--", "set", "Interface", port, &attached])
            .await?;
        let plugged = async {
            self.disable_offloads(port).await?;
            exec(&self.ip, &["link", "set", "dev", port, "up"]).await
        };
        if let Err(e) = plugged.await {
            if let Err(cleanup) = self.vsctl(&["--if-exists", "del-port", bridge, port]).await {
                tracing::warn!(bridge, port, error = %cleanup, "Failed to remove port");
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl SwitchBackend for OvsBackend {
    fn name(&self) -> &'static str {
        "openvswitch"
    }

    async fn create_bridge(&self, bridge: &str, gateway: Ipv4Addr, prefix_len: u8) -> SkiffResult<()> {
        self.vsctl(&["--may-exist", "add-br", bridge]).await?;
        address_bridge(&self.ip, bridge, gateway, prefix_len).await?;
        tracing::info!(bridge, %gateway, "OVS bridge created");
        Ok(())
    }

    async fn delete_bridge(&self, bridge: &str) -> SkiffResult<()> {
        self.vsctl(&["--if-exists", "del-br", bridge]).await?;
        tracing::info!(bridge, "OVS bridge deleted");
        Ok(())
    }

    async fn add_port(&self, bridge: &str, port: &str, mac: MacAddress) -> SkiffResult<Arc<dyn FrameDevice>> {
        let tap = open_tap(port)?;
        self.plug(bridge, port, mac).await?;
        tracing::debug!(bridge, port, %mac, "OVS port added");
        Ok(Arc::new(tap))
    }

    async fn remove_port(&self, bridge: &str, port: &str) -> SkiffResult<()> {
        self.vsctl(&["--if-exists", "del-port", bridge, port]).await?;
        Ok(())
    }

    async fn status(&self) -> SkiffResult<String> {
        let version = self.vsctl(&["--version"]).await?;
        self.vsctl(&["show"]).await?;
        Ok(version.lines().next().unwrap_or("ok").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeTools;

    const MAC: MacAddress = MacAddress::new([0x02, 0x42, 0x0a, 0, 0, 0x02]);

    #[tokio::test]
    async fn missing_tools_report_unhealthy() {
        let backend = OvsBackend {
            vsctl: Tool::new("/nonexistent/ovs-vsctl"),
            ethtool: Tool::new("/nonexistent/ethtool"),
            ip: Tool::new("/nonexistent/ip"),
        };
        assert!(matches!(
            backend.status().await,
            Err(SkiffError::BridgeOperationFailed { .. })
        ));
        assert!(backend.disable_offloads("tp0").await.is_err());
    }

    #[test]
    fn backend_names() {
        assert_eq!(LinuxBridgeBackend::new().name(), "linux-bridge");
        assert_eq!(OvsBackend::new().name(), "openvswitch");
    }

    #[test_log::test(tokio::test)]
    async fn linux_bridge_created_and_addressed() {
        let fakes = FakeTools::new();
        let backend = LinuxBridgeBackend {
            ip: fakes.tool("ip", Some(("link show", "Device \"br-x\" does not exist."))),
            bridge: fakes.tool("bridge", None),
        };
        backend
            .create_bridge("br-x", Ipv4Addr::new(10, 0, 0, 1), 24)
            .await
            .unwrap();
        assert_eq!(
            fakes.calls(),
            [
                "ip link show dev br-x",
                "ip link add name br-x type bridge",
                "ip addr replace 10.0.0.1/24 dev br-x",
                "ip link set dev br-x up",
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn linux_bridge_plug_pins_address() {
        let fakes = FakeTools::new();
        let backend = LinuxBridgeBackend {
            ip: fakes.tool("ip", None),
            bridge: fakes.tool("bridge", Some(("fdb", "RTNETLINK answers: Operation not supported"))),
        };
        backend.plug("br-x", "tp1", MAC).await.unwrap();
        assert_eq!(
            fakes.calls(),
            [
                "ip link set dev tp1 master br-x",
                "ip link set dev tp1 up",
                "bridge fdb replace 02:42:0a:00:00:02 dev tp1 master static",
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn linux_bridge_removals_tolerate_missing_links() {
        let fakes = FakeTools::new();
        let backend = LinuxBridgeBackend {
            ip: fakes.tool("ip", Some(("delete", "Cannot find device \"br-x\""))),
            bridge: fakes.tool("bridge", None),
        };
        backend.delete_bridge("br-x").await.unwrap();
        backend.remove_port("br-x", "tp1").await.unwrap();

        let failing = LinuxBridgeBackend {
            ip: fakes.tool("ip2", Some(("delete", "RTNETLINK answers: Operation not permitted"))),
            bridge: fakes.tool("bridge", None),
        };
        assert!(matches!(
            failing.delete_bridge("br-x").await,
            Err(SkiffError::BridgeOperationFailed { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn ovs_plug_disables_offloads() {
        let fakes = FakeTools::new();
        let backend = OvsBackend {
            vsctl: fakes.tool("ovs-vsctl", None),
            ethtool: fakes.tool("ethtool", None),
            ip: fakes.tool("ip", None),
        };
        backend.plug("br-x", "tp1", MAC).await.unwrap();
        assert_eq!(
            fakes.calls(),
            [
                "ovs-vsctl --may-exist add-port br-x tp1 -- set Interface tp1 \
                 external_ids:attached-mac=02:42:0a:00:00:02",
                "ethtool -K tp1 tx off rx off tso off gso off gro off",
                "ip link set dev tp1 up",
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn ovs_plug_removes_port_when_offloads_fail() {
        let fakes = FakeTools::new();
        let backend = OvsBackend {
            vsctl: fakes.tool("ovs-vsctl", None),
            ethtool: fakes.tool("ethtool", Some(("-K", "Cannot change tx-checksumming"))),
            ip: fakes.tool("ip", None),
        };
        let err = backend.plug("br-x", "tp1", MAC).await.unwrap_err();
        assert!(err.to_string().contains("offloads"), "{err}");
        assert_eq!(
            fakes.calls(),
            [
                "ovs-vsctl --may-exist add-port br-x tp1 -- set Interface tp1 \
                 external_ids:attached-mac=02:42:0a:00:00:02",
                "ethtool -K tp1 tx off rx off tso off gso off gro off",
                "ovs-vsctl --if-exists del-port br-x tp1",
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn ovs_bridge_lifecycle() {
        let fakes = FakeTools::new();
        let backend = OvsBackend {
            vsctl: fakes.tool("ovs-vsctl", None),
            ethtool: fakes.tool("ethtool", None),
            ip: fakes.tool("ip", None),
        };
        backend
            .create_bridge("br-x", Ipv4Addr::new(10, 1, 0, 1), 16)
            .await
            .unwrap();
        backend.remove_port("br-x", "tp1").await.unwrap();
        backend.delete_bridge("br-x").await.unwrap();
        assert_eq!(backend.status().await.unwrap(), "ok");
        assert_eq!(
            fakes.calls(),
            [
                "ovs-vsctl --may-exist add-br br-x",
                "ip addr replace 10.1.0.1/16 dev br-x",
                "ip link set dev br-x up",
                "ovs-vsctl --if-exists del-port br-x tp1",
                "ovs-vsctl --if-exists del-br br-x",
                "ovs-vsctl --version",
                "ovs-vsctl show",
            ]
        );
    }
}
