//! Container name resolution.
//!
//! Each network gets a zone of container records served by dnsmasq on the
//! network's gateway address. Every change rewrites the configuration
//! directory, validates it and restarts the resolver; with no zones left the
//! resolver is stopped.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use skiff_common::{SkiffError, SkiffResult};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::command;

/// Name of the global configuration file.
pub const GLOBAL_CONF: &str = "00-skiff.conf";

/// Default dnsmasq executable.
pub const DEFAULT_DNSMASQ: &str = "/usr/sbin/dnsmasq";

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// One container's names on one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// Primary name.
    pub hostname: String,
    /// Container address on the network.
    pub address: Ipv4Addr,
    /// Additional names.
    pub aliases: Vec<String>,
}

impl DnsRecord {
    fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.hostname.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// Check a name against RFC 1123 host name syntax.
///
/// # Errors
///
/// `InvalidRequest` describing the offending name.
pub fn validate_hostname(name: &str) -> SkiffResult<()> {
    let invalid = |reason: &str| SkiffError::InvalidRequest {
        message: format!("invalid hostname '{name}': {reason}"),
    };
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return Err(invalid("length must be 1-253"));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid("labels must be 1-63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels must not start or end with '-'"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("only letters, digits and '-' are allowed"));
        }
    }
    Ok(())
}

/// The resolver daemon.
#[async_trait]
pub trait ResolverProcess: Send + Sync {
    /// Check the configuration in `conf_dir` without applying it.
    async fn validate(&self, conf_dir: &Path) -> SkiffResult<()>;

    /// (Re)start the resolver on the configuration in `conf_dir`.
    async fn restart(&self, conf_dir: &Path) -> SkiffResult<()>;

    /// Stop the resolver if it runs.
    async fn stop(&self) -> SkiffResult<()>;

    /// Whether the resolver is running.
    fn is_running(&self) -> bool;
}

/// Runs dnsmasq in the foreground as a child process.
#[derive(Debug)]
pub struct DnsmasqProcess {
    binary: PathBuf,
    child: SyncMutex<Option<Child>>,
}

impl DnsmasqProcess {
    /// Use the dnsmasq executable at `binary`.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            child: SyncMutex::new(None),
        }
    }

    fn conf_dir_arg(conf_dir: &Path) -> String {
        format!("--conf-dir={},*.conf", conf_dir.display())
    }
}

impl Default for DnsmasqProcess {
    fn default() -> Self {
        Self::new(DEFAULT_DNSMASQ)
    }
}

#[async_trait]
impl ResolverProcess for DnsmasqProcess {
    async fn validate(&self, conf_dir: &Path) -> SkiffResult<()> {
        let binary = self.binary.to_string_lossy();
        command::run(&binary, &["--test", &Self::conf_dir_arg(conf_dir)])
            .await
            .map(drop)
            .map_err(|e| SkiffError::BridgeOperationFailed {
                message: format!("resolver configuration rejected: {e}"),
            })
    }

    async fn restart(&self, conf_dir: &Path) -> SkiffResult<()> {
        self.stop().await?;
        let child = Command::new(&self.binary)
            .arg("--keep-in-foreground")
            .arg(Self::conf_dir_arg(conf_dir))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SkiffError::BridgeOperationFailed {
                message: format!("failed to start {}: {e}", self.binary.display()),
            })?;
        tracing::info!(pid = ?child.id(), "Resolver started");
        *self.child.lock() = Some(child);
        Ok(())
    }

    async fn stop(&self) -> SkiffResult<()> {
        let previous = self.child.lock().take();
        if let Some(mut child) = previous {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to stop resolver");
            }
            tracing::debug!("Resolver stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        let mut child = self.child.lock();
        match child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                tracing::warn!(%status, "Resolver exited");
                *child = None;
                false
            }
            Some(Err(_)) | None => false,
        }
    }
}

/// A resolver that only records whether it would be running.
#[derive(Debug, Default)]
pub struct NullResolver {
    running: AtomicBool,
}

#[async_trait]
impl ResolverProcess for NullResolver {
    async fn validate(&self, _conf_dir: &Path) -> SkiffResult<()> {
        Ok(())
    }

    async fn restart(&self, _conf_dir: &Path) -> SkiffResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> SkiffResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct Zone {
    gateway: Ipv4Addr,
    records: BTreeMap<String, DnsRecord>,
}

/// Per-network container name zones backed by a [`ResolverProcess`].
pub struct NameResolutionManager {
    conf_dir: PathBuf,
    upstreams: Vec<IpAddr>,
    resolver: Arc<dyn ResolverProcess>,
    zones: Mutex<BTreeMap<String, Zone>>,
}

impl NameResolutionManager {
    /// Manage configuration in `conf_dir`, forwarding unknown names to
    /// `upstreams`.
    #[must_use]
    pub fn new(
        conf_dir: impl Into<PathBuf>,
        upstreams: Vec<IpAddr>,
        resolver: Arc<dyn ResolverProcess>,
    ) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            upstreams,
            resolver,
            zones: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a network served on `gateway`. Re-registering keeps its
    /// records.
    ///
    /// # Errors
    ///
    /// Configuration write, validation or restart failures.
    pub async fn add_zone(&self, network_id: &str, gateway: Ipv4Addr) -> SkiffResult<()> {
        let mut zones = self.zones.lock().await;
        let mut next = zones.clone();
        next.entry(network_id.to_string())
            .and_modify(|zone| zone.gateway = gateway)
            .or_insert_with(|| Zone {
                gateway,
                records: BTreeMap::new(),
            });
        self.commit(&mut zones, next).await
    }

    /// Drop a network and its records. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Configuration write, validation or restart failures.
    pub async fn remove_zone(&self, network_id: &str) -> SkiffResult<bool> {
        let mut zones = self.zones.lock().await;
        if !zones.contains_key(network_id) {
            return Ok(false);
        }
        let mut next = zones.clone();
        next.remove(network_id);
        self.commit(&mut zones, next).await?;
        Ok(true)
    }

    /// Add or replace a container's record on a network.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for bad names, `NetworkNotFound` for an unknown
    /// zone, or configuration failures.
    pub async fn add_record(
        &self,
        network_id: &str,
        container_id: &str,
        record: DnsRecord,
    ) -> SkiffResult<()> {
        for name in record.names() {
            validate_hostname(name)?;
        }
        let mut zones = self.zones.lock().await;
        let mut next = zones.clone();
        let zone = next
            .get_mut(network_id)
            .ok_or_else(|| SkiffError::NetworkNotFound {
                id: network_id.to_string(),
            })?;
        tracing::debug!(network = network_id, hostname = %record.hostname, address = %record.address, "DNS record added");
        zone.records.insert(container_id.to_string(), record);
        self.commit(&mut zones, next).await
    }

    /// Remove a container's record. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Configuration write, validation or restart failures.
    pub async fn remove_record(&self, network_id: &str, container_id: &str) -> SkiffResult<bool> {
        let mut zones = self.zones.lock().await;
        let exists = zones
            .get(network_id)
            .is_some_and(|zone| zone.records.contains_key(container_id));
        if !exists {
            return Ok(false);
        }
        let mut next = zones.clone();
        if let Some(zone) = next.get_mut(network_id) {
            zone.records.remove(container_id);
        }
        self.commit(&mut zones, next).await?;
        tracing::debug!(network = network_id, container = container_id, "DNS record removed");
        Ok(true)
    }

    /// Look a name up on the given networks (every network when empty).
    /// Names match case-insensitively, hostname or alias.
    pub async fn resolve(&self, name: &str, networks: &[String]) -> Option<(Ipv4Addr, String)> {
        let zones = self.zones.lock().await;
        zones
            .iter()
            .filter(|(id, _)| networks.is_empty() || networks.iter().any(|n| n == *id))
            .find_map(|(id, zone)| {
                zone.records
                    .values()
                    .find(|record| record.names().any(|n| n.eq_ignore_ascii_case(name)))
                    .map(|record| (record.address, id.clone()))
            })
    }

    /// Whether the resolver process is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.resolver.is_running()
    }

    /// Stop the resolver and forget every zone.
    ///
    /// # Errors
    ///
    /// Resolver stop failures.
    pub async fn shutdown(&self) -> SkiffResult<()> {
        self.zones.lock().await.clear();
        self.resolver.stop().await
    }

    /// Apply `next`; on failure restore the files for `current` and keep it.
    async fn commit(
        &self,
        current: &mut BTreeMap<String, Zone>,
        next: BTreeMap<String, Zone>,
    ) -> SkiffResult<()> {
        match self.apply(&next).await {
            Ok(()) => {
                *current = next;
                Ok(())
            }
            Err(e) => {
                if let Err(restore) = self.write_config(current).await {
                    tracing::error!(error = %restore, "Failed to restore resolver configuration");
                }
                Err(e)
            }
        }
    }

    async fn apply(&self, zones: &BTreeMap<String, Zone>) -> SkiffResult<()> {
        self.write_config(zones).await?;
        if zones.is_empty() {
            return self.resolver.stop().await;
        }
        self.resolver.validate(&self.conf_dir).await?;
        self.resolver.restart(&self.conf_dir).await
    }

    async fn write_config(&self, zones: &BTreeMap<String, Zone>) -> SkiffResult<()> {
        tokio::fs::create_dir_all(&self.conf_dir).await?;
        tokio::fs::write(self.conf_dir.join(GLOBAL_CONF), self.render_global()).await?;

        let mut entries = tokio::fs::read_dir(&self.conf_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stale = name
                .strip_suffix(".conf")
                .is_some_and(|id| name != GLOBAL_CONF && !zones.contains_key(id));
            if stale {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }

        for (id, zone) in zones {
            tokio::fs::write(self.conf_dir.join(format!("{id}.conf")), render_zone(zone)).await?;
        }
        Ok(())
    }

    fn render_global(&self) -> String {
        let mut out = String::from(
            "# Generated by skiff-helper\nbind-dynamic\ndomain-needed\nbogus-priv\nno-hosts\n",
        );
        if !self.upstreams.is_empty() {
            out.push_str("no-resolv\n");
            for server in &self.upstreams {
                out.push_str(&format!("server={server}\n"));
            }
        }
        out
    }
}

fn render_zone(zone: &Zone) -> String {
    let mut out = format!("listen-address={}\n", zone.gateway);
    for record in zone.records.values() {
        let names: Vec<&str> = record.names().collect();
        out.push_str(&format!("host-record={},{}\n", names.join(","), record.address));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET: &str = "aa11";

    fn record(hostname: &str, last: u8, aliases: &[&str]) -> DnsRecord {
        DnsRecord {
            hostname: hostname.to_string(),
            address: Ipv4Addr::new(172, 30, 0, last),
            aliases: aliases.iter().map(ToString::to_string).collect(),
        }
    }

    fn manager(dir: &Path) -> (NameResolutionManager, Arc<NullResolver>) {
        let resolver = Arc::new(NullResolver::default());
        let manager = NameResolutionManager::new(
            dir,
            vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))],
            Arc::clone(&resolver) as Arc<dyn ResolverProcess>,
        );
        (manager, resolver)
    }

    #[test]
    fn hostname_rules() {
        assert!(validate_hostname("web").is_ok());
        assert!(validate_hostname("db-1.internal").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("-web").is_err());
        assert!(validate_hostname("web_1").is_err());
        assert!(validate_hostname("a..b").is_err());
        assert!(validate_hostname(&"x".repeat(64)).is_err());
    }

    #[tokio::test]
    async fn zones_render_records_and_resolver_follows() {
        let dir = tempfile::tempdir().unwrap();
        let (dns, resolver) = manager(dir.path());

        dns.add_zone(NET, Ipv4Addr::new(172, 30, 0, 1)).await.unwrap();
        dns.add_record(NET, "c1", record("web", 2, &["frontend"])).await.unwrap();
        assert!(resolver.is_running());

        let zone = std::fs::read_to_string(dir.path().join("aa11.conf")).unwrap();
        assert!(zone.contains("listen-address=172.30.0.1"));
        assert!(zone.contains("host-record=web,frontend,172.30.0.2"));

        let global = std::fs::read_to_string(dir.path().join(GLOBAL_CONF)).unwrap();
        for line in ["bind-dynamic", "domain-needed", "no-resolv", "server=1.1.1.1"] {
            assert!(global.lines().any(|l| l == line), "missing {line}");
        }

        assert_eq!(
            dns.resolve("FRONTEND", &[]).await,
            Some((Ipv4Addr::new(172, 30, 0, 2), NET.to_string()))
        );
        assert_eq!(dns.resolve("web", &["other".to_string()]).await, None);

        assert!(dns.remove_record(NET, "c1").await.unwrap());
        assert!(!dns.remove_record(NET, "c1").await.unwrap());
        assert!(dns.remove_zone(NET).await.unwrap());
        assert!(!dir.path().join("aa11.conf").exists());
        assert!(!resolver.is_running());
    }

    #[tokio::test]
    async fn records_need_a_zone_and_valid_names() {
        let dir = tempfile::tempdir().unwrap();
        let (dns, _) = manager(dir.path());
        assert!(matches!(
            dns.add_record(NET, "c1", record("web", 2, &[])).await,
            Err(SkiffError::NetworkNotFound { .. })
        ));
        dns.add_zone(NET, Ipv4Addr::new(172, 30, 0, 1)).await.unwrap();
        assert!(matches!(
            dns.add_record(NET, "c1", record("bad_name", 2, &[])).await,
            Err(SkiffError::InvalidRequest { .. })
        ));
    }

    struct RejectingResolver;

    #[async_trait]
    impl ResolverProcess for RejectingResolver {
        async fn validate(&self, _conf_dir: &Path) -> SkiffResult<()> {
            Err(SkiffError::BridgeOperationFailed {
                message: "syntax error".into(),
            })
        }
        async fn restart(&self, _conf_dir: &Path) -> SkiffResult<()> {
            Ok(())
        }
        async fn stop(&self) -> SkiffResult<()> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn rejected_configuration_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let dns = NameResolutionManager::new(dir.path(), Vec::new(), Arc::new(RejectingResolver));
        assert!(dns.add_zone(NET, Ipv4Addr::new(10, 0, 0, 1)).await.is_err());
        assert!(!dir.path().join("aa11.conf").exists());
        assert_eq!(dns.resolve("anything", &[]).await, None);
    }
}
