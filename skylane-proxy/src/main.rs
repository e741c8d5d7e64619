//! Skylane Proxy
//!
//! The data plane: HTTP and HTTPS listeners that route requests against the
//! route table pushed by the control plane, plus the admin API it pushes to.

#![deny(missing_docs)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use skylane_admin::logging::{self, LogFormat};
use skylane_admin::AdminState;
use skylane_core::{CertificateStore, Metrics, Router};

mod pipeline;
mod server;
mod tls;

/// Upstream connection reuse.
mod connection_pool {
    pub mod pool;
}

use crate::connection_pool::pool::ConnectionPool;
use crate::pipeline::Proxy;

#[derive(Debug, Parser)]
#[clap(name = "skylane-proxy", about = "Skylane data plane")]
struct Args {
    #[clap(long, default_value = "skylane=info,warn", env = "SKYLANE_LOG")]
    log_level: String,

    #[clap(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    #[clap(long, default_value = "0.0.0.0:80")]
    http_addr: SocketAddr,

    /// Enables the HTTPS listener.
    #[clap(long)]
    https_addr: Option<SocketAddr>,

    #[clap(long, default_value = "0.0.0.0:8080")]
    admin_addr: SocketAddr,

    /// Upstream connect timeout.
    #[clap(long, default_value = "5000")]
    connect_timeout_ms: u64,

    /// Longest a client may take to complete the TLS handshake.
    #[clap(long, default_value = "10000")]
    tls_handshake_timeout_ms: u64,

    /// How long open connections may keep running after a shutdown signal.
    #[clap(long, default_value = "10")]
    shutdown_grace_secs: u64,

    /// PEM certificate chain loaded into the certificate store at startup.
    #[clap(long, requires_all = ["default_key", "default_cert_domain"])]
    default_cert: Option<PathBuf>,

    /// PEM private key for `--default-cert`.
    #[clap(long, requires = "default_cert")]
    default_key: Option<PathBuf>,

    /// Domain the startup certificate is stored under.
    #[clap(long, requires = "default_cert")]
    default_cert_domain: Option<String>,
}

/// The primary entrypoint for the Skylane data plane.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, args.log_format)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Skylane data plane");

    let router = Arc::new(Router::new());
    let certificates = Arc::new(CertificateStore::new());
    let metrics = Arc::new(Metrics::new());
    let connections = Arc::new(AtomicI64::new(0));
    let shutdown = CancellationToken::new();
    let grace = Duration::from_secs(args.shutdown_grace_secs);

    if let (Some(cert), Some(key), Some(domain)) =
        (&args.default_cert, &args.default_key, &args.default_cert_domain)
    {
        tls::load_default_certificate(&certificates, domain, cert, key)
            .with_context(|| format!("failed to load certificate {}", cert.display()))?;
    }

    let pool = ConnectionPool::new(Duration::from_millis(args.connect_timeout_ms));
    let ctx = server::Context {
        proxy: Arc::new(Proxy::new(router.clone(), metrics.clone(), pool)),
        connections: connections.clone(),
        shutdown: shutdown.clone(),
        tls_handshake_timeout: Duration::from_millis(args.tls_handshake_timeout_ms),
    };

    let mut tasks = JoinSet::new();

    let http = bind(args.http_addr).await?;
    tasks.spawn(server::serve(http, None, ctx.clone(), grace));

    if let Some(addr) = args.https_addr {
        let listener = bind(addr).await?;
        let acceptor = tls::acceptor(certificates.clone()).context("failed to build TLS config")?;
        tasks.spawn(server::serve(listener, Some(acceptor), ctx.clone(), grace));
    }

    let admin = bind(args.admin_addr).await?;
    let state = Arc::new(AdminState {
        router,
        certificates,
        metrics,
        connections,
    });
    let admin_shutdown = shutdown.clone();
    tasks.spawn(async move {
        if let Err(error) = skylane_admin::serve(admin, state, admin_shutdown, grace).await {
            tracing::error!(%error, "Admin server failed");
        }
    });

    skylane_admin::signal::shutdown().await;
    tracing::info!("Shutting down");
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))
}
