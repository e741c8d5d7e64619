//! Route rules and their routing keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::upstream::Upstream;

/// The `(domain, path)` pair a rule is stored under.
///
/// Ordering is lexicographic on domain, then path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteKey {
    /// Request host the rule applies to.
    pub domain: String,
    /// Request path the rule applies to.
    pub path: String,
}

impl RouteKey {
    /// Build a key from its parts.
    pub fn new(domain: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.domain, self.path)
    }
}

/// A single routing rule: where traffic for one domain and path goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Host this rule matches.
    pub domain: String,
    /// Path this rule matches.
    pub path: String,
    /// Header predicates (name to expected value) that pin a request to the
    /// upstream whose name equals the header value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Candidate upstreams in declaration order.
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    /// When the rule was first created.
    pub created_at: DateTime<Utc>,
    /// When the rule was last changed.
    pub updated_at: DateTime<Utc>,
}

impl RouteRule {
    /// Create a rule with no header predicates, stamped with the current time.
    pub fn new(domain: impl Into<String>, path: impl Into<String>, upstreams: Vec<Upstream>) -> Self {
        let now = Utc::now();
        Self {
            domain: domain.into(),
            path: path.into(),
            headers: BTreeMap::new(),
            upstreams,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a header predicate.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The key this rule is published under.
    pub fn key(&self) -> RouteKey {
        RouteKey::new(self.domain.clone(), self.path.clone())
    }
}
