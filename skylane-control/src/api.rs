//! The control plane's REST API.
//!
//! Route mutations go through the [`RouteSynchronizer`]; route listings,
//! metrics and certificates are relayed to the data plane; services and
//! endpoints are served from the topology cache.

use std::sync::Arc;
use std::time::Duration;

use hyper::body::Body;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use skylane_admin::http::{self, AdminBody};
use skylane_core::api::{CertificateUpload, HealthResponse};

use crate::client::DataPlaneClient;
use crate::discovery::{EndpointRecord, ServiceRecord, TopologyCache};
use crate::error::Error;
use crate::synchronizer::{RouteIntent, RouteSynchronizer, StoredIntent};

/// Everything the control API serves from.
#[derive(Debug)]
pub struct ControlState {
    /// Owner of the routing intents.
    pub synchronizer: Arc<RouteSynchronizer<DataPlaneClient>>,
    /// Mirror of cluster services and endpoints.
    pub topology: Arc<TopologyCache>,
    /// Client for relayed data plane calls.
    pub dataplane: DataPlaneClient,
}

#[derive(Serialize)]
struct IntentResponse {
    success: bool,
    message: &'static str,
    route: StoredIntent,
}

#[derive(Serialize)]
struct IntentListResponse {
    success: bool,
    intents: Vec<StoredIntent>,
    count: usize,
}

#[derive(Serialize)]
struct ServiceListResponse {
    success: bool,
    services: Vec<ServiceRecord>,
    count: usize,
}

#[derive(Serialize)]
struct EndpointListResponse {
    success: bool,
    endpoints: Vec<EndpointRecord>,
    count: usize,
}

#[derive(Serialize)]
struct MetricsRelay {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<String>,
    metrics: serde_json::Value,
}

/// Route one control API request.
pub async fn handle<B>(state: Arc<ControlState>, req: Request<B>) -> Response<AdminBody>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let domain_filter = query_param(req.uri().query(), "domain");
    tracing::debug!(%method, %path, "Control request");

    match (&method, http::segments(&path).as_slice()) {
        (&Method::GET, ["api", "v1", "routes"]) => match state.dataplane.get_routes().await {
            Ok(routes) => http::json(StatusCode::OK, &routes),
            Err(error) => failure(error),
        },
        (&Method::POST, ["api", "v1", "routes"]) => match http::read_json::<RouteIntent, _>(req).await {
            Ok(intent) => match state.synchronizer.create(intent).await {
                Ok(route) => intent_response(StatusCode::CREATED, "route created", route),
                Err(error) => failure(error),
            },
            Err(error) => http::error(StatusCode::BAD_REQUEST, error.to_string()),
        },
        (&Method::PUT, ["api", "v1", "routes", id]) => {
            let id = id.to_string();
            match http::read_json::<RouteIntent, _>(req).await {
                Ok(intent) => match state.synchronizer.update(&id, intent).await {
                    Ok(route) => intent_response(StatusCode::OK, "route updated", route),
                    Err(error) => failure(error),
                },
                Err(error) => http::error(StatusCode::BAD_REQUEST, error.to_string()),
            }
        }
        (&Method::DELETE, ["api", "v1", "routes", id]) => match state.synchronizer.delete(&http::decode_segment(id)).await {
            Ok(route) => intent_response(StatusCode::OK, "route deleted", route),
            Err(error) => failure(error),
        },
        (&Method::GET, ["api", "v1", "intents"]) => {
            let intents = state.synchronizer.list().await;
            http::json(
                StatusCode::OK,
                &IntentListResponse {
                    success: true,
                    count: intents.len(),
                    intents,
                },
            )
        }
        (&Method::GET, ["api", "v1", "services"]) => {
            let services: Vec<_> = state.topology.services().into_values().collect();
            http::json(
                StatusCode::OK,
                &ServiceListResponse {
                    success: true,
                    count: services.len(),
                    services,
                },
            )
        }
        (&Method::GET, ["api", "v1", "endpoints"]) => {
            let endpoints: Vec<_> = state.topology.endpoints().into_values().collect();
            http::json(
                StatusCode::OK,
                &EndpointListResponse {
                    success: true,
                    count: endpoints.len(),
                    endpoints,
                },
            )
        }
        (&Method::GET, ["api", "v1", "metrics"]) => match state.dataplane.get_metrics().await {
            Ok(metrics) => http::json(
                StatusCode::OK,
                &MetricsRelay {
                    success: true,
                    domain: None,
                    metrics,
                },
            ),
            Err(error) => failure(error),
        },
        (&Method::GET, ["api", "v1", "metrics", "domains"]) => {
            domain_metrics(&state, domain_filter).await
        }
        (&Method::GET, ["api", "v1", "certificates"]) => {
            match state.dataplane.list_certificates().await {
                Ok(list) => http::json(StatusCode::OK, &list),
                Err(error) => failure(error),
            }
        }
        (&Method::POST, ["api", "v1", "certificates"]) => {
            match http::read_json::<CertificateUpload, _>(req).await {
                Ok(upload) => match state.dataplane.add_certificate(&upload).await {
                    Ok(message) => http::json(StatusCode::OK, &message),
                    Err(error) => failure(error),
                },
                Err(error) => http::error(StatusCode::BAD_REQUEST, error.to_string()),
            }
        }
        (&Method::DELETE, ["api", "v1", "certificates", domain]) => {
            match state.dataplane.delete_certificate(&http::decode_segment(domain)).await {
                Ok(message) => http::json(StatusCode::OK, &message),
                Err(error) => failure(error),
            }
        }
        (&Method::GET, ["api", "v1", "health"]) => {
            http::json(StatusCode::OK, &HealthResponse::healthy("controlplane"))
        }
        _ => http::error(StatusCode::NOT_FOUND, format!("no such endpoint: {} {}", method, path)),
    }
}

async fn domain_metrics(state: &ControlState, domain: Option<String>) -> Response<AdminBody> {
    let metrics = match state.dataplane.get_metrics().await {
        Ok(metrics) => metrics,
        Err(error) => return failure(error),
    };
    let domains = metrics
        .get("domains")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    match domain {
        Some(domain) => match domains.get(&domain) {
            Some(stats) => http::json(
                StatusCode::OK,
                &MetricsRelay {
                    success: true,
                    metrics: stats.clone(),
                    domain: Some(domain),
                },
            ),
            None => http::error(StatusCode::NOT_FOUND, format!("no metrics for {}", domain)),
        },
        None => http::json(
            StatusCode::OK,
            &MetricsRelay {
                success: true,
                domain: None,
                metrics: domains,
            },
        ),
    }
}

fn intent_response(status: StatusCode, message: &'static str, route: StoredIntent) -> Response<AdminBody> {
    http::json(
        status,
        &IntentResponse {
            success: true,
            message,
            route,
        },
    )
}

fn failure(error: Error) -> Response<AdminBody> {
    let status = match &error {
        Error::MalformedServiceReference(_) | Error::UnresolvedService(_) => StatusCode::BAD_REQUEST,
        Error::IntentNotFound(_) => StatusCode::NOT_FOUND,
        Error::PublishRejected(_) => StatusCode::BAD_GATEWAY,
        Error::DataPlane { status, .. } => status
            .and_then(|status| StatusCode::from_u16(status).ok())
            .unwrap_or(StatusCode::BAD_GATEWAY),
    };
    if status.is_server_error() {
        tracing::warn!(%error, "Control request failed");
    }
    http::error(status, error.to_string())
}

/// The first non-empty value of `name` in a URL-encoded query string.
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Serve the control API until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ControlState>,
    shutdown: CancellationToken,
    grace: Duration,
) -> std::io::Result<()> {
    http::serve(listener, shutdown, grace, move |req| handle(state.clone(), req)).await
}
