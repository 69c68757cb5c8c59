//! skiff-agent - network agent inside a container VM.
//!
//! Launched by the daemon through the container runtime. It owns the
//! container's `ethN` interfaces and tunnels their frames to the host relay.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use skiff_network::agent::{AgentService, DEFAULT_RESOLV_CONF, LinuxInterfaces};
use skiff_network::config::DEFAULT_AGENT_PORT;
use skiff_network::transport::{TcpBinder, VsockBinder};
use skiff_network::ChannelBinder;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// AF_VSOCK, the normal case inside a VM.
    Vsock,
    /// Plain TCP, for running outside a VM.
    Tcp,
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
    #[arg(long, env = "SKIFF_AGENT_PORT", default_value_t = DEFAULT_AGENT_PORT)]
    port: u32,

    /// Transport for the control and relay ports
    #[arg(long, value_enum, default_value_t = Transport::Vsock)]
    transport: Transport,

    /// Address to listen on with the TCP transport
    #[arg(long, default_value = "127.0.0.1")]
    tcp_addr: IpAddr,

    /// Resolver configuration updated with the network's DNS server
    #[arg(long, env = "SKIFF_RESOLV_CONF", default_value = DEFAULT_RESOLV_CONF)]
    resolv_conf: PathBuf,

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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let binder: Arc<dyn ChannelBinder> = match args.transport {
        Transport::Vsock => Arc::new(VsockBinder::new()),
        Transport::Tcp => Arc::new(TcpBinder::new(args.tcp_addr)),
    };
    let listener = binder.bind(args.port).await?;
    let agent = AgentService::new(Arc::new(LinuxInterfaces::new(&args.resolv_conf)), binder);

    tracing::info!(
        port = args.port,
        transport = ?args.transport,
        resolv_conf = %args.resolv_conf.display(),
        "skiff-agent started"
    );
    agent.serve(listener, shutdown_signal()).await?;
    tracing::info!("skiff-agent stopped");
    Ok(())
}
