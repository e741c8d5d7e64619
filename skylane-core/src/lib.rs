//! Skylane Core functionality.
//!
//! This crate contains the routing model shared by both planes: route rules and
//! the lock-free route table, upstream selection, the TLS certificate store and
//! the request metrics aggregator.

pub mod api;
pub mod error;
pub mod metrics;
pub mod tls;

/// Routing domain models.
pub mod domain {
    pub mod routing;
    pub mod rule;
    pub mod upstream;
}

/// Upstream selection.
pub mod load_balancer {
    pub mod selector;
}

pub use domain::routing::{RouteTable, Router, SharedRouter};
pub use domain::rule::{RouteKey, RouteRule};
pub use domain::upstream::Upstream;
pub use error::Error;
pub use load_balancer::selector::{select_upstream, select_upstream_with};
pub use metrics::{Metrics, MetricsSnapshot};
pub use tls::CertificateStore;
