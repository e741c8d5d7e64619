//! Listener loops for the HTTP and HTTPS proxy ports.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::pipeline::Proxy;

/// Shared handles every connection task needs.
#[derive(Debug, Clone)]
pub struct Context {
    /// The request pipeline.
    pub proxy: Arc<Proxy>,
    /// Open client connections, reported by the admin API.
    pub connections: Arc<AtomicI64>,
    /// Fires when the process starts shutting down.
    pub shutdown: CancellationToken,
    /// Longest a client may take to complete the TLS handshake.
    pub tls_handshake_timeout: Duration,
}

/// A RAII guard that counts one open client connection.
struct ConnectionGuard {
    connections: Arc<AtomicI64>,
}

impl ConnectionGuard {
    fn new(connections: Arc<AtomicI64>) -> Self {
        connections.fetch_add(1, Ordering::Relaxed);
        Self { connections }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Accepts connections on `listener` until shutdown, terminating TLS when an
/// acceptor is given, then waits up to `grace` for open connections to drain.
pub async fn serve(
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    ctx: Context,
    grace: Duration,
) {
    let scheme = if tls_acceptor.is_some() { "https" } else { "http" };
    let local = listener.local_addr().ok();
    tracing::info!(addr = ?local, %scheme, "Proxy listening");
    let tracker = TaskTracker::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(%scheme, %error, "Failed to accept connection");
                    continue;
                }
            },
        };
        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(%peer, %error, "Failed to set TCP_NODELAY");
        }
        let guard = ConnectionGuard::new(ctx.connections.clone());
        let ctx = ctx.clone();

        match &tls_acceptor {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                tracker.spawn(async move {
                    let _guard = guard;
                    let handshake = tokio::time::timeout(ctx.tls_handshake_timeout, acceptor.accept(stream));
                    match handshake.await {
                        Ok(Ok(tls_stream)) => {
                            let server_name = tls_stream.get_ref().1.server_name().map(str::to_string);
                            serve_connection(tls_stream, peer, server_name, ctx).await;
                        }
                        Ok(Err(error)) => tracing::debug!(%peer, %error, "TLS handshake failed"),
                        Err(_) => tracing::debug!(%peer, "TLS handshake timed out"),
                    }
                });
            }
            None => {
                tracker.spawn(async move {
                    let _guard = guard;
                    serve_connection(stream, peer, None, ctx).await;
                });
            }
        }
    }

    drop(listener);
    tracker.close();
    tracing::info!(%scheme, open = tracker.len(), "Listener stopped, draining connections");
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        tracing::warn!(%scheme, "Connections did not drain within the grace period");
    }
}

async fn serve_connection<I>(io: I, peer: SocketAddr, server_name: Option<String>, ctx: Context)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let proxy = ctx.proxy.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        let server_name = server_name.clone();
        async move { Ok::<_, Infallible>(proxy.handle(req, server_name.as_deref()).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = ctx.shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(error) = result {
        tracing::debug!(%peer, %error, "Connection error");
    }
}
