//! skiffd - Skiff host daemon.
//!
//! Owns the network registry, drives container agents and the helper VM,
//! and serves `NetworkService` over gRPC.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use skiff_common::SkiffPaths;
use skiff_network::store::RegistryStore;
use skiff_network::transport::{HybridVsockChannel, TcpChannel};
use skiff_network::{ControlChannel, DataPlane, NetworkRegistry, VmDataPlane};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod grpc;
mod runtime;
mod watchdog;

use config::{DaemonConfig, HelperEndpoint};
use runtime::CommandRuntime;
use watchdog::{HelperState, HelperWatchdog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, env = "SKIFF_CONFIG", default_value = "/etc/skiff/skiffd.toml")]
    config: PathBuf,

    /// Fail when the configuration file is missing
    #[arg(long)]
    require_config: bool,

    /// gRPC listen address (overrides the configuration file)
    #[arg(long, env = "SKIFF_LISTEN")]
    listen: Option<SocketAddr>,

    /// Data root (overrides the configuration file)
    #[arg(long)]
    root: Option<PathBuf>,

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

fn helper_channel(endpoint: &HelperEndpoint, paths: &SkiffPaths) -> Arc<dyn ControlChannel> {
    match endpoint {
        HelperEndpoint::HybridVsock { socket } => Arc::new(HybridVsockChannel::new(
            socket.clone().unwrap_or_else(|| paths.helper_vsock()),
        )),
        HelperEndpoint::Tcp { host, port_offset } => {
            Arc::new(TcpChannel::new(*host).with_port_offset(*port_offset))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let mut config = DaemonConfig::load(&args.config, args.require_config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config = config.with_listen(listen);
    }
    if let Some(root) = args.root {
        config = config.with_root(root);
    }

    let paths = config
        .root
        .as_ref()
        .map_or_else(SkiffPaths::new, SkiffPaths::with_root);
    paths.create_dirs().context("creating data directories")?;

    let runtime = Arc::new(CommandRuntime::new(paths.clone(), config.launcher.clone()));
    let helper = helper_channel(&config.helper_endpoint, &paths);
    tracing::info!(helper = %helper.describe(), root = %paths.root.display(), "Starting skiffd");

    let plane = Arc::new(VmDataPlane::new(config.network.clone(), runtime, helper));
    let store = RegistryStore::new(paths.network_state());
    let registry = Arc::new(
        NetworkRegistry::load(
            config.network.clone(),
            Arc::clone(&plane) as Arc<dyn DataPlane>,
            store,
        )
        .context("loading network state")?,
    );

    let watchdog = HelperWatchdog::new(
        Arc::clone(&registry),
        plane.helper().clone(),
        config.watchdog.interval(),
    );
    let initial = match watchdog.recover().await {
        Ok(replumbed) => {
            tracing::info!(replumbed, "Network state restored");
            watchdog.probe().await
        }
        Err(e) => {
            tracing::warn!(error = %e, "Helper not ready, networks will be restored when it is");
            HelperState::Unreachable
        }
    };

    let stop = CancellationToken::new();
    let watchdog_task = config
        .watchdog
        .enabled
        .then(|| tokio::spawn(watchdog.run(initial, stop.clone())));

    tracing::info!(listen = %config.listen, "NetworkService listening");
    let served = tonic::transport::Server::builder()
        .add_service(grpc::NetworkServiceImpl::new(Arc::clone(&registry)).into_server())
        .serve_with_shutdown(config.listen, shutdown_signal())
        .await;

    stop.cancel();
    if let Some(task) = watchdog_task {
        let _ = task.await;
    }
    served.context("gRPC server failed")?;
    tracing::info!(networks = registry.list_networks().len(), "skiffd stopped");
    Ok(())
}
