//! varbusd: the varbus variable server daemon.
//!
//! Startup order: configuration (TOML file, then CLI overrides), runtime
//! directory and status file, transports, metrics endpoint, dispatcher.
//! The status file publishes the server's process identity so clients can
//! locate and probe the daemon; it and the socket are removed on orderly
//! shutdown.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use varbus_core::DaemonConfig;
use varbus_daemon::metrics::MetricsRegistry;
use varbus_daemon::state::ServerContext;
use varbus_daemon::transport::local::LocalTransport;
use varbus_daemon::transport::tcp::TcpTransport;

/// Dispatcher input queue depth.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// varbusd, the publish/subscribe variable server
#[derive(Parser, Debug)]
#[command(name = "varbusd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Runtime directory holding the socket and status file
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// TCP port for the connection-oriented transport
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Disable the TCP transport
    #[arg(long)]
    no_tcp: bool,

    /// Disable the metrics endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Log filter (overrides RUST_LOG), e.g. "varbus_daemon=debug"
    #[arg(long)]
    log: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => DaemonConfig::default(),
        };
        if let Some(runtime_dir) = self.runtime_dir {
            config.runtime_dir = runtime_dir;
        }
        if let Some(port) = self.tcp_port {
            config.tcp_port = port;
        }
        if self.no_tcp {
            config.tcp_enabled = false;
        }
        if self.no_metrics {
            config.metrics_enabled = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log = args.log.clone();
    init_tracing(log.as_deref());
    let config = args.into_config()?;

    std::fs::create_dir_all(&config.runtime_dir).with_context(|| {
        format!("creating runtime directory {}", config.runtime_dir.display())
    })?;

    // Publish the server's process identity for clients to discover.
    let status_path = config.status_path();
    std::fs::write(&status_path, format!("{}\n", std::process::id()))
        .with_context(|| format!("writing status file {}", status_path.display()))?;

    let registry = Arc::new(MetricsRegistry::new().context("registering metrics")?);
    let metrics = registry.daemon_metrics();

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let socket_path = config.socket_path();
    let local = LocalTransport::bind(&socket_path)
        .with_context(|| format!("binding local socket {}", socket_path.display()))?;
    tokio::spawn(local.serve(events_tx.clone()));

    if config.tcp_enabled {
        let tcp = TcpTransport::bind(config.tcp_port)
            .await
            .with_context(|| format!("binding tcp port {}", config.tcp_port))?;
        tokio::spawn(tcp.serve(events_tx.clone()));
    }

    if config.metrics_enabled {
        serve_metrics(registry, config.metrics_port).await?;
    }

    let ctx = ServerContext::new(config, metrics);
    let dispatcher = tokio::spawn(ctx.run(events_rx));
    drop(events_tx);

    info!(pid = std::process::id(), "varbusd running");
    wait_for_shutdown().await?;

    // Orderly shutdown: unpublish, then let the process exit. Blocked
    // clients hold no server-side resources worth draining.
    if let Err(err) = std::fs::remove_file(&socket_path) {
        error!(error = %err, "failed to remove socket");
    }
    if let Err(err) = std::fs::remove_file(&status_path) {
        error!(error = %err, "failed to remove status file");
    }
    dispatcher.abort();
    info!("varbusd stopped");
    Ok(())
}

async fn serve_metrics(registry: Arc<MetricsRegistry>, port: u16) -> Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let registry = registry.clone();
            async move {
                registry.encode_text().unwrap_or_else(|err| {
                    error!(error = %err, "metrics encoding failed");
                    String::new()
                })
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .with_context(|| format!("binding metrics port {port}"))?;
    info!(port, "metrics endpoint listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "metrics server failed");
        }
    });
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT; shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM; shutting down"),
    }
    Ok(())
}
