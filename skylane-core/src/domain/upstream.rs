//! Upstream backend models.

use serde::{Deserialize, Serialize};

/// A named, weighted backend target embedded in a [`RouteRule`](super::rule::RouteRule).
///
/// Once an upstream has been placed into a published route table it is never
/// mutated; a new table carrying a new upstream replaces it instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    /// Logical service name, conventionally `namespace/name`.
    pub name: String,
    /// Ready backend addresses (pod IPs) serving this upstream.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Port the backends listen on.
    pub port: u16,
    /// Relative weight used by weighted selection.
    #[serde(default)]
    pub weight: u32,
    /// Whether the upstream had ready endpoints when it was resolved.
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

impl Upstream {
    /// Create a healthy upstream.
    pub fn new(name: impl Into<String>, addresses: Vec<String>, port: u16, weight: u32) -> Self {
        Self {
            name: name.into(),
            addresses,
            port,
            weight,
            healthy: true,
        }
    }

    /// Check whether requests can be sent to this upstream at all.
    pub fn is_available(&self) -> bool {
        self.healthy && !self.addresses.is_empty()
    }

    /// The backend address requests are forwarded to.
    ///
    /// Only the first address is used; balancing happens between upstreams,
    /// not between the addresses of one upstream.
    pub fn primary_address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_requires_addresses_and_health() {
        let mut upstream = Upstream::new("default/web", vec!["10.0.0.1".into()], 8080, 1);
        assert!(upstream.is_available());

        upstream.healthy = false;
        assert!(!upstream.is_available());

        let empty = Upstream::new("default/web", vec![], 8080, 1);
        assert!(!empty.is_available());
        assert_eq!(empty.primary_address(), None);
    }

    #[test]
    fn healthy_defaults_to_true_when_missing() {
        let upstream: Upstream =
            serde_json::from_str(r#"{"name":"a/b","addresses":["10.0.0.2"],"port":80}"#).unwrap();
        assert!(upstream.healthy);
        assert_eq!(upstream.weight, 0);
        assert_eq!(upstream.primary_address(), Some("10.0.0.2"));
    }
}
