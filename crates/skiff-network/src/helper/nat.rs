//! Address translation in the helper VM.
//!
//! Traffic leaving a network's subnet is masqueraded behind the helper's
//! external address, and published ports are forwarded (DNAT) from the
//! helper to the container that publishes them. Every rule carries a
//! `skiff:<network>` comment so it can be told apart from foreign rules.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use skiff_common::{SkiffError, SkiffResult};

use crate::command::{CommandError, Tool};
use crate::publish::PublishedPort;

/// Kernel knob that lets the helper route between bridges and its uplink.
pub const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

/// A published port of one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    /// Network the container is attached to.
    pub network_id: String,
    /// The container's address on that network.
    pub address: Ipv4Addr,
    /// The mapping.
    pub port: PublishedPort,
}

/// Installs and removes translation rules. All operations are idempotent.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Short name for health reports.
    fn name(&self) -> &'static str;

    /// Masquerade traffic from `subnet` to anywhere outside it.
    async fn masquerade(&self, network_id: &str, subnet: Ipv4Net) -> SkiffResult<()>;

    /// Undo [`PacketFilter::masquerade`].
    async fn remove_masquerade(&self, network_id: &str, subnet: Ipv4Net) -> SkiffResult<()>;

    /// Forward a host port to a container.
    async fn forward(&self, rule: &ForwardRule) -> SkiffResult<()>;

    /// Undo [`PacketFilter::forward`].
    async fn remove_forward(&self, rule: &ForwardRule) -> SkiffResult<()>;
}

fn comment(network_id: &str) -> String {
    let short: String = network_id.chars().take(12).collect();
    format!("skiff:{short}")
}

fn masquerade_rule(network_id: &str, subnet: Ipv4Net) -> Vec<String> {
    let subnet = subnet.to_string();
    vec![
        "-s".into(),
        subnet.clone(),
        "!".into(),
        "-d".into(),
        subnet,
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        comment(network_id),
        "-j".into(),
        "MASQUERADE".into(),
    ]
}

fn forward_rule(rule: &ForwardRule) -> Vec<String> {
    vec![
        "-p".into(),
        rule.port.protocol.to_string(),
        "--dport".into(),
        rule.port.host_port.to_string(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        comment(&rule.network_id),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{}:{}", rule.address, rule.port.container_port),
    ]
}

fn filter_failed(err: &CommandError) -> SkiffError {
    SkiffError::BridgeOperationFailed {
        message: format!("packet filter: {err}"),
    }
}

/// Whether a failed check or delete means the rule is not installed.
fn rule_absent(err: &CommandError) -> bool {
    err.stderr().is_some_and(|stderr| {
        let stderr = stderr.to_ascii_lowercase();
        stderr.contains("does a matching rule exist") || stderr.contains("bad rule")
    })
}

/// Rules in the `nat` table managed with `iptables`.
#[derive(Debug, Clone)]
pub struct IptablesFilter {
    iptables: Tool,
    forwarding: PathBuf,
}

impl Default for IptablesFilter {
    fn default() -> Self {
        Self {
            iptables: Tool::new("iptables"),
            forwarding: PathBuf::from(IP_FORWARD_SYSCTL),
        }
    }
}

impl IptablesFilter {
    /// A filter using `iptables` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn on IPv4 forwarding.
    ///
    /// # Errors
    ///
    /// The sysctl could not be written.
    pub async fn enable_forwarding(&self) -> SkiffResult<()> {
        tokio::fs::write(&self.forwarding, b"1\n").await?;
        tracing::debug!(path = %self.forwarding.display(), "IPv4 forwarding enabled");
        Ok(())
    }

    async fn nat(&self, op: &str, chain: &str, rule: &[String]) -> Result<String, CommandError> {
        let args: Vec<&str> = ["-w", "-t", "nat", op, chain]
            .into_iter()
            .chain(rule.iter().map(String::as_str))
            .collect();
        self.iptables.run(&args).await
    }

    async fn ensure(&self, chain: &str, rule: &[String]) -> SkiffResult<()> {
        match self.nat("-C", chain, rule).await {
            Ok(_) => return Ok(()),
            Err(e) if rule_absent(&e) => {}
            Err(e) => return Err(filter_failed(&e)),
        }
        self.nat("-A", chain, rule).await.map_err(|e| filter_failed(&e))?;
        Ok(())
    }

    async fn delete(&self, chain: &str, rule: &[String]) -> SkiffResult<()> {
        match self.nat("-D", chain, rule).await {
            Ok(_) => Ok(()),
            Err(e) if rule_absent(&e) => Ok(()),
            Err(e) => Err(filter_failed(&e)),
        }
    }
}

#[async_trait]
impl PacketFilter for IptablesFilter {
    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn masquerade(&self, network_id: &str, subnet: Ipv4Net) -> SkiffResult<()> {
        self.ensure("POSTROUTING", &masquerade_rule(network_id, subnet)).await?;
        tracing::info!(network = network_id, %subnet, "Masquerading enabled");
        Ok(())
    }

    async fn remove_masquerade(&self, network_id: &str, subnet: Ipv4Net) -> SkiffResult<()> {
        self.delete("POSTROUTING", &masquerade_rule(network_id, subnet)).await?;
        tracing::info!(network = network_id, %subnet, "Masquerading removed");
        Ok(())
    }

    async fn forward(&self, rule: &ForwardRule) -> SkiffResult<()> {
        self.ensure("PREROUTING", &forward_rule(rule)).await?;
        tracing::info!(network = %rule.network_id, port = %rule.port, address = %rule.address, "Port forwarded");
        Ok(())
    }

    async fn remove_forward(&self, rule: &ForwardRule) -> SkiffResult<()> {
        self.delete("PREROUTING", &forward_rule(rule)).await?;
        tracing::info!(network = %rule.network_id, port = %rule.port, "Port forward removed");
        Ok(())
    }
}

/// A filter that only remembers which rules would be installed.
#[derive(Debug, Default)]
pub struct NullFilter {
    rules: Mutex<BTreeSet<String>>,
}

impl NullFilter {
    /// Installed rules, rendered as `masquerade <network> <subnet>` or
    /// `forward <network> <mapping> <address>`.
    #[must_use]
    pub fn rules(&self) -> Vec<String> {
        self.rules.lock().iter().cloned().collect()
    }
}

fn render_forward(rule: &ForwardRule) -> String {
    format!("forward {} {} {}", rule.network_id, rule.port, rule.address)
}

#[async_trait]
impl PacketFilter for NullFilter {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn masquerade(&self, network_id: &str, subnet: Ipv4Net) -> SkiffResult<()> {
        self.rules.lock().insert(format!("masquerade {network_id} {subnet}"));
        Ok(())
    }

    async fn remove_masquerade(&self, network_id: &str, subnet: Ipv4Net) -> SkiffResult<()> {
        self.rules.lock().remove(&format!("masquerade {network_id} {subnet}"));
        Ok(())
    }

    async fn forward(&self, rule: &ForwardRule) -> SkiffResult<()> {
        self.rules.lock().insert(render_forward(rule));
        Ok(())
    }

    async fn remove_forward(&self, rule: &ForwardRule) -> SkiffResult<()> {
        self.rules.lock().remove(&render_forward(rule));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeTools;
    use crate::publish::Protocol;

    const NO_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";
    const NET: &str = "4e6574776f726b31aabbccdd";

    fn subnet() -> Ipv4Net {
        "172.30.0.0/24".parse().unwrap()
    }

    fn web_8080() -> ForwardRule {
        ForwardRule {
            network_id: NET.to_string(),
            address: Ipv4Addr::new(172, 30, 0, 2),
            port: PublishedPort::new(Protocol::Tcp, 8080, 80).unwrap(),
        }
    }

    fn filter(fakes: &FakeTools, fail: Option<(&str, &str)>) -> IptablesFilter {
        IptablesFilter {
            iptables: fakes.tool("iptables", fail),
            forwarding: fakes.path("ip_forward"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn missing_rules_are_appended() {
        let fakes = FakeTools::new();
        let filter = filter(&fakes, Some(("-C", NO_RULE)));
        filter.masquerade(NET, subnet()).await.unwrap();
        filter.forward(&web_8080()).await.unwrap();
        assert_eq!(
            fakes.calls(),
            [
                "iptables -w -t nat -C POSTROUTING -s 172.30.0.0/24 ! -d 172.30.0.0/24 \
                 -m comment --comment skiff:4e6574776f72 -j MASQUERADE",
                "iptables -w -t nat -A POSTROUTING -s 172.30.0.0/24 ! -d 172.30.0.0/24 \
                 -m comment --comment skiff:4e6574776f72 -j MASQUERADE",
                "iptables -w -t nat -C PREROUTING -p tcp --dport 8080 \
                 -m comment --comment skiff:4e6574776f72 -j DNAT --to-destination 172.30.0.2:80",
                "iptables -w -t nat -A PREROUTING -p tcp --dport 8080 \
                 -m comment --comment skiff:4e6574776f72 -j DNAT --to-destination 172.30.0.2:80",
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn present_rules_are_not_duplicated() {
        let fakes = FakeTools::new();
        let filter = filter(&fakes, None);
        filter.forward(&web_8080()).await.unwrap();
        let calls = fakes.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("iptables -w -t nat -C PREROUTING"));
    }

    #[tokio::test]
    async fn removing_missing_rules_succeeds() {
        let fakes = FakeTools::new();
        let filter = filter(&fakes, Some(("-D", NO_RULE)));
        filter.remove_masquerade(NET, subnet()).await.unwrap();
        filter.remove_forward(&web_8080()).await.unwrap();
        assert_eq!(fakes.calls().len(), 2);
    }

    #[tokio::test]
    async fn other_failures_are_reported() {
        let fakes = FakeTools::new();
        let filter = filter(
            &fakes,
            Some(("PREROUTING", "iptables v1.8.9: Table does not exist (do you need to insmod?)")),
        );
        let err = filter.forward(&web_8080()).await.unwrap_err();
        assert!(err.to_string().contains("packet filter"), "{err}");
        assert!(filter.remove_forward(&web_8080()).await.is_err());
        assert_eq!(fakes.calls().len(), 2);
    }

    #[tokio::test]
    async fn forwarding_sysctl_is_written() {
        let fakes = FakeTools::new();
        let filter = filter(&fakes, None);
        filter.enable_forwarding().await.unwrap();
        assert_eq!(std::fs::read_to_string(fakes.path("ip_forward")).unwrap(), "1\n");
    }

    #[tokio::test]
    async fn null_filter_tracks_rules() {
        let filter = NullFilter::default();
        filter.masquerade(NET, subnet()).await.unwrap();
        filter.forward(&web_8080()).await.unwrap();
        filter.forward(&web_8080()).await.unwrap();
        assert_eq!(
            filter.rules(),
            [
                format!("forward {NET} 8080:80/tcp 172.30.0.2"),
                format!("masquerade {NET} 172.30.0.0/24"),
            ]
        );
        filter.remove_forward(&web_8080()).await.unwrap();
        filter.remove_masquerade(NET, subnet()).await.unwrap();
        assert!(filter.rules().is_empty());
    }
}
