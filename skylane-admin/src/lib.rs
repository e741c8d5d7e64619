//! Skylane Admin
//!
//! The data plane's admin HTTP API. The control plane pushes complete route
//! tables here, manages TLS certificates and reads metrics.
//!
//! Also home to the pieces both binaries share: the JSON-over-HTTP helpers in
//! [`http`], subscriber setup in [`logging`] and the shutdown [`signal`].

pub mod http;
pub mod logging;
pub mod signal;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use hyper::body::Body;
use hyper::{Method, Request, Response, StatusCode};

use skylane_core::api::{
    CertificateListResponse, CertificateUpload, HealthResponse, MetricsReport, MetricsResponse,
    RouteListResponse, RouteUpdateRequest, RouteUpdateResponse,
};
use skylane_core::{CertificateStore, Metrics, SharedRouter};

use self::http::AdminBody;

/// State the admin API reads and mutates.
#[derive(Debug, Clone)]
pub struct AdminState {
    /// The data plane's route table.
    pub router: SharedRouter,
    /// TLS credentials served by the HTTPS listener.
    pub certificates: Arc<CertificateStore>,
    /// Request metrics.
    pub metrics: Arc<Metrics>,
    /// Open client connections on the proxy listeners.
    pub connections: Arc<AtomicI64>,
}

/// Route one admin request.
pub async fn handle<B>(state: Arc<AdminState>, req: Request<B>) -> Response<AdminBody>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    tracing::debug!(%method, %path, "Admin request");

    match (&method, http::segments(&path).as_slice()) {
        (&Method::PUT, ["api", "v1", "routes"]) => update_routes(&state, req).await,
        (&Method::GET, ["api", "v1", "routes"]) => list_routes(&state),
        (&Method::GET, ["api", "v1", "certificates"]) => list_certificates(&state),
        (&Method::POST, ["api", "v1", "certificates"]) => add_certificate(&state, req).await,
        (&Method::DELETE, ["api", "v1", "certificates", domain]) => {
            remove_certificate(&state, &http::decode_segment(domain))
        }
        (&Method::GET, ["api", "v1", "metrics"]) => metrics(&state),
        (&Method::POST, ["api", "v1", "metrics", "reset"]) => {
            state.metrics.reset();
            http::ok("metrics reset")
        }
        (&Method::GET, ["api", "v1", "health"]) => {
            http::json(StatusCode::OK, &HealthResponse::healthy("dataplane"))
        }
        _ => http::error(StatusCode::NOT_FOUND, format!("no such endpoint: {} {}", method, path)),
    }
}

async fn update_routes<B>(state: &AdminState, req: Request<B>) -> Response<AdminBody>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let update: RouteUpdateRequest = match http::read_json(req).await {
        Ok(update) => update,
        Err(error) => return http::error(StatusCode::BAD_REQUEST, error.to_string()),
    };

    let count = update.routes.len();
    tracing::info!(count, "Received route table update");
    state.router.publish(update.routes);

    http::json(
        StatusCode::OK,
        &RouteUpdateResponse {
            success: true,
            message: "route table replaced".to_string(),
            count,
        },
    )
}

fn list_routes(state: &AdminState) -> Response<AdminBody> {
    let table = state.router.snapshot();
    let routes: Vec<_> = table.rules().map(|rule| (**rule).clone()).collect();
    http::json(
        StatusCode::OK,
        &RouteListResponse {
            success: true,
            count: routes.len(),
            routes,
            version: table.version(),
        },
    )
}

fn list_certificates(state: &AdminState) -> Response<AdminBody> {
    http::json(
        StatusCode::OK,
        &CertificateListResponse {
            success: true,
            certificates: state.certificates.list().into_iter().map(Into::into).collect(),
        },
    )
}

async fn add_certificate<B>(state: &AdminState, req: Request<B>) -> Response<AdminBody>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let upload: CertificateUpload = match http::read_json(req).await {
        Ok(upload) => upload,
        Err(error) => return http::error(StatusCode::BAD_REQUEST, error.to_string()),
    };
    if upload.domain.is_empty() {
        return http::error(StatusCode::BAD_REQUEST, "domain must not be empty");
    }

    match state.certificates.insert_pem(
        &upload.domain,
        upload.certificate.as_bytes(),
        upload.private_key.as_bytes(),
    ) {
        Ok(()) => http::ok(format!("certificate added for {}", upload.domain)),
        Err(error) => {
            tracing::warn!(domain = %upload.domain, %error, "Rejected certificate");
            http::error(StatusCode::BAD_REQUEST, error.to_string())
        }
    }
}

fn remove_certificate(state: &AdminState, domain: &str) -> Response<AdminBody> {
    if state.certificates.remove(domain) {
        http::ok(format!("certificate removed for {}", domain))
    } else {
        http::error(StatusCode::NOT_FOUND, format!("no certificate for {}", domain))
    }
}

fn metrics(state: &AdminState) -> Response<AdminBody> {
    let report = MetricsReport::capture(
        state.metrics.stats(),
        state.connections.load(Ordering::Relaxed),
    );
    http::json(
        StatusCode::OK,
        &MetricsResponse {
            success: true,
            metrics: report,
        },
    )
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AdminState>,
    shutdown: tokio_util::sync::CancellationToken,
    grace: std::time::Duration,
) -> std::io::Result<()> {
    http::serve(listener, shutdown, grace, move |req| handle(state.clone(), req)).await
}
