//! Small JSON-over-HTTP helpers shared by the admin APIs of both planes.

use std::borrow::Cow;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use skylane_core::api::StatusMessage;

/// Largest request body an admin endpoint accepts.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Response body type of every admin endpoint.
pub type AdminBody = Full<Bytes>;

/// Errors raised while decoding an admin request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The body could not be read or was too large.
    #[error("failed to read request body: {0}")]
    Body(String),

    /// The body was not the expected JSON.
    #[error("invalid request body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize `body` as a JSON response.
pub fn json<T: Serialize>(status: StatusCode, body: &T) -> Response<AdminBody> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut rsp = Response::new(Full::new(Bytes::from(bytes)));
            *rsp.status_mut() = status;
            rsp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            rsp
        }
        Err(error) => {
            tracing::error!(%error, "Failed to encode response");
            let mut rsp = Response::new(Full::new(Bytes::from_static(b"internal error")));
            *rsp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            rsp
        }
    }
}

/// A `{"success": false, "message": ...}` response.
pub fn error(status: StatusCode, message: impl Into<String>) -> Response<AdminBody> {
    json(status, &StatusMessage::error(message))
}

/// A `{"success": true, "message": ...}` response.
pub fn ok(message: impl Into<String>) -> Response<AdminBody> {
    json(StatusCode::OK, &StatusMessage::ok(message))
}

/// Read and decode a JSON request body.
pub async fn read_json<T, B>(req: Request<B>) -> Result<T, Error>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| Error::Body(e.to_string()))?
        .to_bytes();
    Ok(serde_json::from_slice(&body)?)
}

/// Split a request path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Percent-decode one path segment taken from [`segments`].
pub fn decode_segment(segment: &str) -> Cow<'_, str> {
    percent_encoding::percent_decode_str(segment).decode_utf8_lossy()
}

/// Serves `handler` over HTTP/1.1 until `shutdown` fires, then waits up to
/// `grace` for open connections to finish.
pub async fn serve<H, F>(
    listener: TcpListener,
    shutdown: CancellationToken,
    grace: Duration,
    handler: H,
) -> std::io::Result<()>
where
    H: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Response<AdminBody>> + Send + 'static,
{
    let local: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(addr = ?local, "Admin API listening");
    let graceful = GracefulShutdown::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(%error, "Failed to accept admin connection");
                    continue;
                }
            },
        };

        let handler = handler.clone();
        let service = service_fn(move |req| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler(req).await) }
        });
        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        let conn = graceful.watch(conn);
        tokio::spawn(async move {
            if let Err(error) = conn.await {
                tracing::debug!(%peer, %error, "Admin connection error");
            }
        });
    }

    if tokio::time::timeout(grace, graceful.shutdown()).await.is_err() {
        tracing::warn!("Admin connections did not drain in time");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_percent_encoded_segments() {
        assert_eq!(decode_segment("x.com"), "x.com");
        assert_eq!(decode_segment("%2A.x%2Ecom"), "*.x.com");
        assert_eq!(decode_segment("a%2Fb"), "a/b");
    }

    #[test]
    fn segments_skip_empty_parts() {
        assert_eq!(segments("/api/v1/routes/"), vec!["api", "v1", "routes"]);
        assert!(segments("/").is_empty());
    }

    #[tokio::test]
    async fn read_json_rejects_invalid_bodies() {
        let req = Request::new(Full::new(Bytes::from_static(b"{not json")));
        let res: Result<serde_json::Value, _> = read_json(req).await;
        assert!(matches!(res, Err(Error::Json(_))));

        let big = vec![b' '; MAX_BODY_BYTES + 1];
        let req = Request::new(Full::new(Bytes::from(big)));
        let res: Result<serde_json::Value, _> = read_json(req).await;
        assert!(matches!(res, Err(Error::Body(_))));
    }

    #[test]
    fn json_sets_status_and_content_type() {
        let rsp = error(StatusCode::NOT_FOUND, "nope");
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
        assert_eq!(rsp.headers()[CONTENT_TYPE], "application/json");
    }
}
