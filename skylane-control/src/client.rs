//! HTTP client for the data plane's admin API.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use skylane_core::api::{
    CertificateListResponse, CertificateUpload, RouteListResponse, RouteUpdateRequest,
    RouteUpdateResponse, StatusMessage,
};
use skylane_core::RouteRule;

use crate::error::Error;
use crate::synchronizer::Publish;

/// Talks to one data plane admin endpoint.
#[derive(Debug, Clone)]
pub struct DataPlaneClient {
    http: reqwest::Client,
    base: String,
}

#[derive(Deserialize)]
struct MetricsEnvelope {
    metrics: serde_json::Value,
}

impl DataPlaneClient {
    /// Creates a client for the admin API at `base_url`. Every request is
    /// bounded by `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport)?;
        Ok(Self {
            http,
            base: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base, path)
    }

    /// The URL of one certificate, with `domain` percent-encoded as a path segment.
    fn certificate_url(&self, domain: &str) -> Result<reqwest::Url, Error> {
        let mut url = reqwest::Url::parse(&self.url("certificates")).map_err(|error| Error::DataPlane {
            status: None,
            message: format!("invalid data plane URL: {}", error),
        })?;
        url.path_segments_mut()
            .map_err(|()| Error::DataPlane {
                status: None,
                message: format!("data plane URL cannot take a path: {}", self.base),
            })?
            .push(domain);
        Ok(url)
    }

    /// Replace the data plane's route table. Returns the accepted rule count.
    pub async fn update_routes(&self, rules: Vec<RouteRule>) -> Result<usize, Error> {
        let rsp = self
            .http
            .put(self.url("routes"))
            .json(&RouteUpdateRequest { routes: rules })
            .send()
            .await
            .map_err(|error| Error::PublishRejected(error.to_string()))?;

        let status = rsp.status();
        if !status.is_success() {
            return Err(Error::PublishRejected(failure_message(status, rsp).await));
        }
        let update: RouteUpdateResponse = rsp
            .json()
            .await
            .map_err(|error| Error::PublishRejected(error.to_string()))?;
        if !update.success {
            return Err(Error::PublishRejected(update.message));
        }
        Ok(update.count)
    }

    /// The data plane's current route table.
    pub async fn get_routes(&self) -> Result<RouteListResponse, Error> {
        let rsp = self.http.get(self.url("routes")).send().await.map_err(transport)?;
        decode(rsp).await
    }

    /// The data plane's metrics report as raw JSON.
    pub async fn get_metrics(&self) -> Result<serde_json::Value, Error> {
        let rsp = self.http.get(self.url("metrics")).send().await.map_err(transport)?;
        let envelope: MetricsEnvelope = decode(rsp).await?;
        Ok(envelope.metrics)
    }

    /// Succeeds if the data plane answers its health endpoint.
    pub async fn health_check(&self) -> Result<(), Error> {
        let rsp = self.http.get(self.url("health")).send().await.map_err(transport)?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(Error::DataPlane {
                status: Some(status.as_u16()),
                message: failure_message(status, rsp).await,
            });
        }
        Ok(())
    }

    /// Certificates loaded on the data plane.
    pub async fn list_certificates(&self) -> Result<CertificateListResponse, Error> {
        let rsp = self
            .http
            .get(self.url("certificates"))
            .send()
            .await
            .map_err(transport)?;
        decode(rsp).await
    }

    /// Upload a certificate to the data plane.
    pub async fn add_certificate(&self, upload: &CertificateUpload) -> Result<StatusMessage, Error> {
        let rsp = self
            .http
            .post(self.url("certificates"))
            .json(upload)
            .send()
            .await
            .map_err(transport)?;
        decode(rsp).await
    }

    /// Remove the certificate served for `domain`.
    pub async fn delete_certificate(&self, domain: &str) -> Result<StatusMessage, Error> {
        let rsp = self
            .http
            .delete(self.certificate_url(domain)?)
            .send()
            .await
            .map_err(transport)?;
        decode(rsp).await
    }
}

#[async_trait::async_trait]
impl Publish for DataPlaneClient {
    async fn publish(&self, rules: Vec<RouteRule>) -> Result<(), Error> {
        self.update_routes(rules).await.map(drop)
    }
}

fn transport(error: reqwest::Error) -> Error {
    Error::DataPlane {
        status: error.status().map(|status| status.as_u16()),
        message: error.to_string(),
    }
}

async fn decode<T: DeserializeOwned>(rsp: Response) -> Result<T, Error> {
    let status = rsp.status();
    if !status.is_success() {
        return Err(Error::DataPlane {
            status: Some(status.as_u16()),
            message: failure_message(status, rsp).await,
        });
    }
    rsp.json().await.map_err(|error| Error::DataPlane {
        status: Some(status.as_u16()),
        message: format!("invalid response: {}", error),
    })
}

/// The data plane's own error message, or the status line if the body has none.
async fn failure_message(status: StatusCode, rsp: Response) -> String {
    match rsp.json::<StatusMessage>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skylane_admin::AdminState;
    use skylane_core::{CertificateStore, Metrics, Router, Upstream};
    use std::sync::atomic::AtomicI64;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Runs a real data plane admin API on an ephemeral port.
    async fn dataplane() -> (Arc<AdminState>, DataPlaneClient, CancellationToken) {
        let state = Arc::new(AdminState {
            router: Arc::new(Router::new()),
            certificates: Arc::new(CertificateStore::new()),
            metrics: Arc::new(Metrics::new()),
            connections: Arc::new(AtomicI64::new(0)),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(skylane_admin::serve(
            listener,
            state.clone(),
            shutdown.clone(),
            Duration::from_secs(1),
        ));
        let client = DataPlaneClient::new(format!("http://{}/", addr), Duration::from_secs(5)).unwrap();
        (state, client, shutdown)
    }

    #[tokio::test]
    async fn publishes_and_reads_back_routes() {
        let (state, client, shutdown) = dataplane().await;

        let rule = RouteRule::new(
            "a.com",
            "/",
            vec![Upstream::new("default/app", vec!["10.0.0.1".into()], 8080, 1)],
        );
        assert_eq!(client.update_routes(vec![rule.clone()]).await.unwrap(), 1);
        assert_eq!(state.router.snapshot().len(), 1);

        let listed = client.get_routes().await.unwrap();
        assert_eq!(listed.routes, vec![rule]);
        assert_eq!(listed.version, 1);

        client.health_check().await.unwrap();
        let metrics = client.get_metrics().await.unwrap();
        assert_eq!(metrics["connection_count"], 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn relays_data_plane_errors() {
        let (_state, client, shutdown) = dataplane().await;

        match client.delete_certificate("missing.com").await {
            Err(Error::DataPlane { status, message }) => {
                assert_eq!(status, Some(404));
                assert!(message.contains("missing.com"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
        match client.delete_certificate("a/b.com").await {
            Err(Error::DataPlane { status, message }) => {
                assert_eq!(status, Some(404));
                assert!(message.contains("a/b.com"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }

        let upload = CertificateUpload {
            domain: "a.com".into(),
            certificate: "not a certificate".into(),
            private_key: "nor a key".into(),
        };
        assert!(matches!(
            client.add_certificate(&upload).await,
            Err(Error::DataPlane { status: Some(400), .. })
        ));
        assert!(client.list_certificates().await.unwrap().certificates.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unreachable_data_plane_rejects_publish() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = DataPlaneClient::new(format!("http://{}", addr), Duration::from_secs(1)).unwrap();
        assert!(matches!(client.publish(vec![]).await, Err(Error::PublishRejected(_))));
        assert!(matches!(client.health_check().await, Err(Error::DataPlane { status: None, .. })));
    }
}
