//! JSON bodies exchanged between the control plane and the data plane admin API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::rule::RouteRule;
use crate::metrics::MetricsSnapshot;
use crate::tls::CertificateInfo;

/// `PUT /api/v1/routes` request: the complete replacement rule set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteUpdateRequest {
    /// Every rule of the new table.
    pub routes: Vec<RouteRule>,
}

/// `PUT /api/v1/routes` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteUpdateResponse {
    /// Whether the table was replaced.
    pub success: bool,
    /// Human readable outcome.
    pub message: String,
    /// Number of rules accepted.
    pub count: usize,
}

/// `GET /api/v1/routes` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteListResponse {
    /// Always true on a 200.
    pub success: bool,
    /// Rules of the current table, in key order.
    pub routes: Vec<RouteRule>,
    /// Number of rules.
    pub count: usize,
    /// Version of the table that was read.
    pub version: u64,
}

/// `POST /api/v1/certificates` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateUpload {
    /// Domain to serve the credential for.
    pub domain: String,
    /// PEM encoded certificate chain.
    pub certificate: String,
    /// PEM encoded private key.
    pub private_key: String,
}

/// `GET /api/v1/certificates` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateListResponse {
    /// Always true on a 200.
    pub success: bool,
    /// Stored credentials.
    pub certificates: Vec<CertificateEntry>,
}

/// One certificate listing entry on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateEntry {
    /// Served domain.
    pub domain: String,
    /// When the credential was added.
    pub added_at: DateTime<Utc>,
}

impl From<CertificateInfo> for CertificateEntry {
    fn from(info: CertificateInfo) -> Self {
        Self {
            domain: info.domain,
            added_at: info.added_at,
        }
    }
}

/// `GET /api/v1/metrics` payload.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    /// The aggregator snapshot, flattened into the report.
    #[serde(flatten)]
    pub stats: MetricsSnapshot,
    /// Open client connections on the proxy listeners.
    pub connection_count: i64,
    /// Unix time the snapshot was taken.
    pub timestamp: i64,
}

impl MetricsReport {
    /// Stamp a snapshot with the current time.
    pub fn capture(stats: MetricsSnapshot, connection_count: i64) -> Self {
        Self {
            stats,
            connection_count,
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// `GET /api/v1/metrics` response.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    /// Always true on a 200.
    pub success: bool,
    /// The report.
    pub metrics: MetricsReport,
}

/// `GET /api/v1/health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `healthy` while the process serves.
    pub status: String,
    /// Unix time of the check.
    pub timestamp: i64,
    /// Which plane answered.
    pub service: String,
}

impl HealthResponse {
    /// A healthy response for `service`.
    pub fn healthy(service: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: Utc::now().timestamp(),
            service: service.to_string(),
        }
    }
}

/// Generic `{"success", "message"}` body used for errors and simple acknowledgements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human readable outcome.
    pub message: String,
}

impl StatusMessage {
    /// A success acknowledgement.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// A failure report.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
