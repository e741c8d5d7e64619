//! Lock-free pool of upstream HTTP/1.1 connections using DashMap and SegQueue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::pipeline::ForwardError;

/// Idle senders kept per upstream address; extras are dropped on check-in.
const MAX_IDLE_PER_UPSTREAM: usize = 64;

/// Caches idle upstream connections per backend socket address.
///
/// A sender is checked out for one request and checked back in once the
/// response body has been read to the end. Senders whose connection is not
/// yet ready for another request stay queued and are skipped.
#[derive(Debug)]
pub struct ConnectionPool<B = Incoming> {
    idle: Arc<DashMap<SocketAddr, Arc<SegQueue<SendRequest<B>>>>>,
    connect_timeout: Duration,
}

impl<B> Clone for ConnectionPool<B> {
    fn clone(&self) -> Self {
        Self {
            idle: self.idle.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

impl<B> ConnectionPool<B>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    /// Creates an empty pool that gives up dialing after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            idle: Arc::new(DashMap::new()),
            connect_timeout,
        }
    }

    /// Returns a sender ready to take a request to `addr`, reusing an idle
    /// connection when one is available.
    pub async fn checkout(&self, addr: SocketAddr) -> Result<SendRequest<B>, ForwardError> {
        if let Some(sender) = self.take_ready(&addr) {
            tracing::trace!(%addr, "Reusing pooled upstream connection");
            return Ok(sender);
        }
        self.connect(addr).await
    }

    /// Returns a sender to the pool for reuse.
    pub fn checkin(&self, addr: SocketAddr, sender: SendRequest<B>) {
        if sender.is_closed() {
            return;
        }

        let queue = self
            .idle
            .entry(addr)
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .value()
            .clone();
        if queue.len() >= MAX_IDLE_PER_UPSTREAM {
            return;
        }
        queue.push(sender);
        tracing::trace!(%addr, idle = queue.len(), "Upstream connection returned to pool");
    }

    #[cfg(test)]
    fn idle_len(&self, addr: &SocketAddr) -> usize {
        self.idle.get(addr).map(|queue| queue.len()).unwrap_or(0)
    }

    fn take_ready(&self, addr: &SocketAddr) -> Option<SendRequest<B>> {
        let queue = self.idle.get(addr)?.value().clone();

        let mut busy = Vec::new();
        let mut ready = None;
        while let Some(sender) = queue.pop() {
            if sender.is_closed() {
                continue;
            }
            if sender.is_ready() {
                ready = Some(sender);
                break;
            }
            busy.push(sender);
        }
        for sender in busy {
            queue.push(sender);
        }
        ready
    }

    async fn connect(&self, addr: SocketAddr) -> Result<SendRequest<B>, ForwardError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ForwardError::Timeout(addr))?
            .map_err(|source| ForwardError::Connect { addr, source })?;
        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(%addr, %error, "Failed to set TCP_NODELAY on upstream connection");
        }

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ForwardError::Handshake)?;
        tokio::spawn(async move {
            if let Err(error) = conn.await {
                tracing::debug!(%addr, %error, "Upstream connection closed with error");
            }
        });
        tracing::debug!(%addr, "Dialed upstream");
        Ok(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Empty};
    use hyper::body::Bytes;
    use hyper::server::conn::http1 as server_http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    type TestBody = Empty<Bytes>;

    /// Spawns an upstream that answers every request with `ok` and counts
    /// accepted connections.
    async fn upstream() -> (SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let service = service_fn(|_req| async {
                        Ok::<_, Infallible>(Response::new(http_body_util::Full::new(Bytes::from("ok"))))
                    });
                    let _ = server_http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, accepted)
    }

    async fn get(sender: &mut SendRequest<TestBody>, addr: SocketAddr) -> Bytes {
        let req = Request::builder()
            .uri("/")
            .header(hyper::header::HOST, addr.to_string())
            .body(Empty::new())
            .unwrap();
        let rsp = sender.send_request(req).await.unwrap();
        rsp.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn reuses_idle_connection() {
        let (addr, accepted) = upstream().await;
        let pool = ConnectionPool::<TestBody>::new(Duration::from_secs(1));

        let mut sender = pool.checkout(addr).await.unwrap();
        assert_eq!(get(&mut sender, addr).await, "ok");
        sender.ready().await.unwrap();
        pool.checkin(addr, sender);
        assert_eq!(pool.idle_len(&addr), 1);

        let mut sender = pool.checkout(addr).await.unwrap();
        assert_eq!(pool.idle_len(&addr), 0);
        assert_eq!(get(&mut sender, addr).await, "ok");
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = ConnectionPool::<TestBody>::new(Duration::from_secs(1));
        let err = pool.checkout(addr).await.unwrap_err();
        assert!(matches!(err, ForwardError::Connect { .. }));
    }
}
