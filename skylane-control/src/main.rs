//! Skylane Control
//!
//! Watches cluster services and endpoints, keeps the data plane's route table
//! in step with the routing intents it is given, and serves the control API.

#![deny(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use skylane_admin::logging::{self, LogFormat};
use skylane_control::api::{self, ControlState};
use skylane_control::discovery::k8s::KubeWatch;
use skylane_control::discovery::Reconciler;
use skylane_control::{DataPlaneClient, RouteSynchronizer, TopologyCache};

#[derive(Debug, Parser)]
#[clap(name = "skylane-control", about = "Skylane control plane")]
struct Args {
    #[clap(long, default_value = "skylane=info,warn", env = "SKYLANE_LOG")]
    log_level: String,

    #[clap(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    #[clap(long, default_value = "0.0.0.0:9090")]
    addr: SocketAddr,

    /// Base URL of the data plane admin API.
    #[clap(long, default_value = "http://localhost:8080")]
    dataplane_url: String,

    /// Timeout for each data plane request.
    #[clap(long, default_value = "10000")]
    publish_timeout_ms: u64,

    /// Delay before a failed or closed watch is reopened.
    #[clap(long, default_value = "5")]
    watch_backoff_secs: u64,

    /// How often intents are re-resolved against the topology; 0 disables.
    #[clap(long, default_value = "30")]
    resync_interval_secs: u64,

    /// Only watch this namespace. All namespaces are watched by default.
    #[clap(long)]
    namespace: Option<String>,

    /// How long open API connections may keep running after a shutdown signal.
    #[clap(long, default_value = "10")]
    shutdown_grace_secs: u64,
}

/// The primary entrypoint for the Skylane control plane.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, args.log_format)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Skylane control plane");

    // Fails only if a provider was already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let dataplane = DataPlaneClient::new(args.dataplane_url.clone(), Duration::from_millis(args.publish_timeout_ms))
        .context("failed to build data plane client")?;
    match dataplane.health_check().await {
        Ok(()) => tracing::info!(url = %args.dataplane_url, "Data plane is healthy"),
        Err(error) => tracing::warn!(url = %args.dataplane_url, %error, "Data plane health check failed"),
    }

    let topology = Arc::new(TopologyCache::new());
    let synchronizer = Arc::new(RouteSynchronizer::new(topology.clone(), dataplane.clone()));
    let shutdown = CancellationToken::new();
    let backoff = Duration::from_secs(args.watch_backoff_secs);
    let namespace = args.namespace.as_deref();

    let mut tasks = JoinSet::new();

    let services = KubeWatch::<Service>::new(client.clone(), namespace);
    tasks.spawn(Reconciler::new("services", services, topology.clone(), backoff).run(shutdown.clone()));
    let endpoints = KubeWatch::<Endpoints>::new(client, namespace);
    tasks.spawn(Reconciler::new("endpoints", endpoints, topology.clone(), backoff).run(shutdown.clone()));

    if args.resync_interval_secs > 0 {
        let period = Duration::from_secs(args.resync_interval_secs);
        let synchronizer = synchronizer.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match synchronizer.resync().await {
                    Ok(true) => tracing::info!("Resync published an updated route table"),
                    Ok(false) => tracing::debug!("Resync found no changes"),
                    Err(error) => tracing::warn!(%error, "Resync failed"),
                }
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    let state = Arc::new(ControlState {
        synchronizer,
        topology,
        dataplane,
    });
    let api_shutdown = shutdown.clone();
    let grace = Duration::from_secs(args.shutdown_grace_secs);
    tasks.spawn(async move {
        if let Err(error) = api::serve(listener, state, api_shutdown, grace).await {
            tracing::error!(%error, "Control API failed");
        }
    });

    skylane_admin::signal::shutdown().await;
    tracing::info!("Shutting down");
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    tracing::info!("Shutdown complete");
    Ok(())
}
