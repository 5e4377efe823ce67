//! cogs daemon
//!
//! Tracks the node's accelerators and brokers exclusive claims on them.

use anyhow::{bail, Context};
use clap::Parser;
use cogs_api::{bind_unix, serve_tcp, serve_unix, Api, AppState};
use cogs_broker::{ClaimBroker, StateStore, Wait};
use cogs_core::{DaemonConfig, EventBus};
use cogs_identity::{ContainerRuntime, DockerClient, Identify, IdentityResolver};
use cogs_monitor::{Monitor, SmiSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// cogsd - node-local GPU claim broker
#[derive(Parser, Debug)]
#[command(name = "cogsd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, env = "COGS_CONFIG")]
    config: Option<PathBuf>,

    /// Unix socket to listen on, empty to disable
    #[arg(long, env = "COGS_UDS_SOCKET")]
    listen_uds: Option<String>,

    /// TCP address to listen on (`:port` for all interfaces), empty to disable
    #[arg(long, env = "COGS_TCP_SOCKET")]
    listen_tcp: Option<String>,

    /// Docker Engine API socket
    #[arg(long, env = "DOCKER_SOCKET")]
    docker: Option<PathBuf>,

    /// nvidia-smi executable
    #[arg(long)]
    smi: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the configuration file, then apply flag overrides
    fn load_config(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if let Some(path) = &self.listen_uds {
            config.api.uds_path = path.clone();
        }
        if let Some(address) = &self.listen_tcp {
            config.api.tcp_address = address.clone();
        }
        if let Some(socket) = &self.docker {
            config.identity.docker_socket = socket.clone();
        }
        if let Some(smi) = &self.smi {
            config.monitor.smi_path = smi.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }

        Ok(config)
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("Starting cogs daemon v{}", env!("CARGO_PKG_VERSION"));

    let bus = Arc::new(EventBus::new());

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerClient::new(config.identity.docker_socket.clone())
            .with_timeout(Duration::from_millis(config.identity.runtime_timeout_ms)),
    );
    let identity: Arc<dyn Identify> = Arc::new(IdentityResolver::new(runtime, &config.identity));

    let monitor = Monitor::new(Arc::new(SmiSource::new(config.monitor.clone())), bus.clone());
    let devices = monitor
        .enumerate()
        .await
        .context("device enumeration failed")?;
    if devices.is_empty() {
        warn!("No devices found, every claim will be rejected");
    }

    let store = Arc::new(StateStore::new(devices.clone(), identity.clone()));
    let broker = Arc::new(ClaimBroker::new(store.clone(), &config.broker));
    cogs_broker::subscribe(&bus, store.clone(), broker.clone()).await;

    let feeds = monitor
        .start(&devices)
        .await
        .context("failed to start telemetry feeds")?;

    let api = Api::new(Arc::new(AppState {
        store,
        broker: broker.clone(),
        identity,
        default_wait: Wait::from_secs(config.broker.default_wait_secs),
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = Vec::new();

    let uds_path = config.api.uds_bind_path();
    if let Some(path) = &uds_path {
        let listener =
            bind_unix(path).with_context(|| format!("failed to bind {}", path.display()))?;
        servers.push(tokio::spawn(serve_unix(
            listener,
            api.clone(),
            shutdown_rx.clone(),
        )));
    }

    if let Some(address) = config.api.tcp_bind_address() {
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {}", address))?;
        servers.push(tokio::spawn(serve_tcp(
            listener,
            api.clone(),
            shutdown_rx.clone(),
        )));
    }

    if servers.is_empty() {
        bail!("no listener configured");
    }

    let sweeper = broker.spawn_sweeper(shutdown_rx);

    shutdown_signal().await;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    for server in servers {
        let _ = server.await;
    }
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    for feed in feeds {
        feed.abort();
    }

    if let Some(path) = uds_path {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove socket");
        }
    }

    info!("cogs daemon stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = args.load_config();

    let level = config
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&level);

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
