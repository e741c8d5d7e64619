//! The request pipeline: resolve a route, pick an upstream, forward, record.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderMap, CONTENT_LENGTH, HOST};
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, StatusCode, Uri};

use skylane_core::metrics::DomainSample;
use skylane_core::{select_upstream, Metrics, RouteRule, SharedRouter, Upstream};

use crate::connection_pool::pool::ConnectionPool;

/// Body type of every proxied response.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Ways forwarding to an upstream can fail. Each one is answered with 502.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The upstream address is not an IP address.
    #[error("invalid upstream address {0:?}")]
    InvalidAddress(String),

    /// Dialing did not complete within the connect timeout.
    #[error("timed out connecting to {0}")]
    Timeout(SocketAddr),

    /// Dialing failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Dialed address.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP/1.1 handshake failed.
    #[error("upstream handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    /// Sending the request or reading the response head failed.
    #[error("upstream request failed: {0}")]
    Send(#[source] hyper::Error),

    /// The request URI could not be rewritten for the upstream.
    #[error("invalid request uri: {0}")]
    Uri(#[from] hyper::http::Error),
}

/// Handles inbound requests against the current route table.
#[derive(Debug, Clone)]
pub struct Proxy {
    router: SharedRouter,
    metrics: Arc<Metrics>,
    pool: ConnectionPool,
}

impl Proxy {
    /// Creates a pipeline reading routes from `router` and recording into `metrics`.
    pub fn new(router: SharedRouter, metrics: Arc<Metrics>, pool: ConnectionPool) -> Self {
        Self {
            router,
            metrics,
            pool,
        }
    }

    /// Handle one inbound request end to end.
    ///
    /// `server_name` is the SNI of the TLS session, when there is one; it takes
    /// precedence over the `Host` header.
    pub async fn handle(&self, req: Request<Incoming>, server_name: Option<&str>) -> Response<ProxyBody> {
        let started = Instant::now();
        let _active = self.metrics.start_request();
        let bytes_in = content_length(req.headers());

        let host = match server_name {
            Some(name) => name.to_string(),
            None => routing_host(&req),
        };
        let path = req.uri().path().to_string();
        tracing::debug!(method = %req.method(), %host, %path, "Proxying request");

        let table = self.router.snapshot();
        let Some(rule) = table.resolve(&host, &path).cloned() else {
            tracing::warn!(%host, %path, "No route for request");
            let rsp = plain(StatusCode::NOT_FOUND, "no route found");
            self.record(None, started, bytes_in, &rsp);
            return rsp;
        };
        drop(table);

        let (rsp, lease) = match self.route(&rule, req).await {
            Ok(forwarded) => forwarded,
            Err(rsp) => {
                self.record(Some(&rule.domain), started, bytes_in, &rsp);
                return rsp;
            }
        };

        // The per-domain sample waits for the body so streamed responses are counted.
        let status = rsp.status();
        let latency = started.elapsed();
        self.metrics.record_status(status.as_u16());
        self.metrics.record_latency(latency);
        let sample = PendingSample {
            metrics: self.metrics.clone(),
            domain: rule.domain.clone(),
            success: status.as_u16() < 400,
            latency,
            bytes_in,
        };
        rsp.map(|body| MeteredBody::new(body, Some(sample), Some(lease)).boxed_unsync())
    }

    async fn route(
        &self,
        rule: &RouteRule,
        req: Request<Incoming>,
    ) -> Result<(Response<Incoming>, Lease), Response<ProxyBody>> {
        let upstream = select_upstream(rule, req.headers()).map_err(|error| {
            tracing::warn!(domain = %rule.domain, path = %rule.path, %error, "No upstream available");
            plain(StatusCode::SERVICE_UNAVAILABLE, "no upstream available")
        })?;
        let addr = upstream_addr(upstream).map_err(|error| bad_gateway(upstream, error))?;

        let (rsp, lease) = self
            .forward(addr, req)
            .await
            .map_err(|error| bad_gateway(upstream, error))?;
        tracing::debug!(upstream = %upstream.name, %addr, status = %rsp.status(), "Upstream responded");
        Ok((rsp, lease))
    }

    /// Sends the request on a pooled connection. The connection travels with
    /// the response body and is checked back in once the body is read.
    async fn forward(
        &self,
        addr: SocketAddr,
        req: Request<Incoming>,
    ) -> Result<(Response<Incoming>, Lease), ForwardError> {
        let req = to_origin_form(req)?;
        let mut sender = self.pool.checkout(addr).await?;
        let rsp = sender.send_request(req).await.map_err(ForwardError::Send)?;
        let lease = Lease {
            pool: self.pool.clone(),
            addr,
            sender,
        };
        Ok((rsp, lease))
    }

    fn record(&self, domain: Option<&str>, started: Instant, bytes_in: u64, rsp: &Response<ProxyBody>) {
        let status = rsp.status();
        let latency = started.elapsed();
        self.metrics.record_status(status.as_u16());
        self.metrics.record_latency(latency);

        if let Some(domain) = domain {
            self.metrics.record_domain(
                domain,
                DomainSample {
                    success: status.as_u16() < 400,
                    latency,
                    bytes_in,
                    bytes_out: rsp.body().size_hint().exact().unwrap_or(0),
                },
            );
        }
    }
}

/// An upstream connection on loan to one response body.
pub struct Lease {
    pool: ConnectionPool,
    addr: SocketAddr,
    sender: SendRequest<Incoming>,
}

struct PendingSample {
    metrics: Arc<Metrics>,
    domain: String,
    success: bool,
    latency: Duration,
    bytes_in: u64,
}

/// A response body that counts the bytes it yields.
///
/// On drop it records the per-domain sample with the counted bytes and, if
/// the body was read to the end, returns its upstream connection to the pool.
pub struct MeteredBody<B: Body = Incoming> {
    inner: B,
    bytes: u64,
    finished: bool,
    sample: Option<PendingSample>,
    lease: Option<Box<Lease>>,
}

impl<B: Body> MeteredBody<B> {
    fn new(inner: B, sample: Option<PendingSample>, lease: Option<Lease>) -> Self {
        Self {
            inner,
            bytes: 0,
            finished: false,
            sample,
            lease: lease.map(Box::new),
        }
    }
}

impl<B> Body for MeteredBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
            }
            Poll::Ready(None) => this.finished = true,
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for MeteredBody<B> {
    fn drop(&mut self) {
        if let Some(sample) = self.sample.take() {
            sample.metrics.record_domain(
                &sample.domain,
                DomainSample {
                    success: sample.success,
                    latency: sample.latency,
                    bytes_in: sample.bytes_in,
                    bytes_out: self.bytes,
                },
            );
        }
        if let Some(lease) = self.lease.take() {
            // A half-read body leaves the connection mid-response.
            if self.finished || self.inner.is_end_stream() {
                lease.pool.checkin(lease.addr, lease.sender);
            }
        }
    }
}

/// The host a plain HTTP request is routed by: the `Host` header, else the
/// URI authority, with any port removed.
pub fn routing_host<B>(req: &Request<B>) -> String {
    let header = req.headers().get(HOST).and_then(|value| value.to_str().ok());
    strip_port(header.or_else(|| req.uri().host()).unwrap_or(""))
}

/// Remove a `:port` suffix, keeping bracketed IPv6 literals intact.
pub fn strip_port(raw: &str) -> String {
    if raw.starts_with('[') {
        if let Some(end) = raw.find(']') {
            return raw[..=end].to_string();
        }
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => raw.to_string(),
    }
}

/// The backend socket address of an upstream: its first address and its port.
fn upstream_addr(upstream: &Upstream) -> Result<SocketAddr, ForwardError> {
    let address = upstream.primary_address().unwrap_or_default();
    let ip: IpAddr = address
        .parse()
        .map_err(|_| ForwardError::InvalidAddress(address.to_string()))?;
    Ok(SocketAddr::new(ip, upstream.port))
}

fn to_origin_form(req: Request<Incoming>) -> Result<Request<Incoming>, ForwardError> {
    let (mut parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::builder().path_and_query(path).build()?;
    Ok(Request::from_parts(parts, body))
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn bad_gateway(upstream: &Upstream, error: ForwardError) -> Response<ProxyBody> {
    tracing::error!(upstream = %upstream.name, %error, "Upstream unreachable");
    plain(StatusCode::BAD_GATEWAY, "upstream unreachable")
}

fn plain(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut rsp = Response::new(
        Full::new(Bytes::from_static(message.as_bytes()))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *rsp.status_mut() = status;
    rsp
}
