//! skiff-helper - network control service of the helper VM.
//!
//! Owns one virtual switch per network, pumps relay tunnels into switch
//! ports and serves container names on each network's gateway.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use skiff_network::config::DEFAULT_HELPER_PORT;
use skiff_network::helper::{
    DnsmasqProcess, HelperService, IptablesFilter, LearningSwitch, LinuxBridgeBackend, NameResolutionManager,
    NullFilter, NullResolver, OvsBackend, PacketFilter, ResolverProcess, SwitchBackend,
};
use skiff_network::helper::dns::DEFAULT_DNSMASQ;
use skiff_network::naming::BridgeNaming;
use skiff_network::transport::{TcpBinder, VsockBinder};
use skiff_network::ChannelBinder;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// AF_VSOCK, the normal case inside the helper VM.
    Vsock,
    /// Plain TCP, for running outside a VM.
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Kernel bridges managed with `ip`.
    LinuxBridge,
    /// Open vSwitch bridges managed with `ovs-vsctl`.
    Ovs,
    /// In-process learning switch; needs no privileges.
    Learning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Control port to listen on
    #[arg(long, env = "SKIFF_HELPER_PORT", default_value_t = DEFAULT_HELPER_PORT)]
    port: u32,

    /// Transport for the control and relay ports
    #[arg(long, value_enum, default_value_t = Transport::Vsock)]
    transport: Transport,

    /// Address to listen on with the TCP transport
    #[arg(long, default_value = "127.0.0.1")]
    tcp_addr: IpAddr,

    /// Switch implementation
    #[arg(long, env = "SKIFF_HELPER_BACKEND", value_enum, default_value_t = Backend::LinuxBridge)]
    backend: Backend,

    /// Directory for the resolver configuration
    #[arg(long, env = "SKIFF_DNS_DIR", default_value = "/run/skiff-helper/dns")]
    dns_dir: PathBuf,

    /// Upstream servers for names outside the container zones
    #[arg(long, value_delimiter = ',')]
    upstream_dns: Vec<IpAddr>,

    /// Path of the dnsmasq binary
    #[arg(long, default_value = DEFAULT_DNSMASQ)]
    dnsmasq: PathBuf,

    /// Do not run a resolver; names are only answered over RPC
    #[arg(long)]
    no_dns: bool,

    /// Do not install masquerade or published-port rules
    #[arg(long)]
    no_nat: bool,

    /// Prefix of generated bridge names
    #[arg(long, default_value = "br-")]
    bridge_prefix: String,

    /// Hex characters of the network id hash in bridge names
    #[arg(long, default_value_t = 12)]
    bridge_hash_len: usize,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot watch SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn backend(kind: Backend) -> Arc<dyn SwitchBackend> {
    match kind {
        Backend::LinuxBridge => Arc::new(LinuxBridgeBackend::new()),
        Backend::Ovs => Arc::new(OvsBackend::new()),
        Backend::Learning => Arc::new(LearningSwitch::new()),
    }
}

async fn packet_filter(kind: Backend, no_nat: bool) -> Arc<dyn PacketFilter> {
    if no_nat || kind == Backend::Learning {
        return Arc::new(NullFilter::default());
    }
    let filter = IptablesFilter::new();
    if let Err(e) = filter.enable_forwarding().await {
        tracing::warn!(error = %e, "Cannot enable IPv4 forwarding");
    }
    Arc::new(filter)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let naming = BridgeNaming::new(args.bridge_prefix.clone(), args.bridge_hash_len)?;
    let backend = backend(args.backend);
    match backend.status().await {
        Ok(status) => tracing::info!(backend = backend.name(), %status, "Switch backend ready"),
        Err(e) => tracing::warn!(backend = backend.name(), error = %e, "Switch backend is not usable yet"),
    }

    let resolver: Arc<dyn ResolverProcess> = if args.no_dns {
        Arc::new(NullResolver::default())
    } else {
        Arc::new(DnsmasqProcess::new(&args.dnsmasq))
    };
    std::fs::create_dir_all(&args.dns_dir)?;
    let dns = NameResolutionManager::new(&args.dns_dir, args.upstream_dns.clone(), resolver);

    let binder: Arc<dyn ChannelBinder> = match args.transport {
        Transport::Vsock => Arc::new(VsockBinder::new()),
        Transport::Tcp => Arc::new(TcpBinder::new(args.tcp_addr)),
    };
    let listener = binder.bind(args.port).await?;
    let filter = packet_filter(args.backend, args.no_nat).await;
    let helper = HelperService::new(backend, binder, Arc::new(dns), filter, naming);

    tracing::info!(
        port = args.port,
        transport = ?args.transport,
        backend = ?args.backend,
        nat = !args.no_nat,
        dns_dir = %args.dns_dir.display(),
        "skiff-helper started"
    );
    helper.serve(listener, shutdown_signal()).await?;
    tracing::info!("skiff-helper stopped");
    Ok(())
}
