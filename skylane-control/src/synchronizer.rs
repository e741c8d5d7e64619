//! Turns routing intents into complete route tables and publishes them.
//!
//! Every accepted intent is kept under an id. Any change rebuilds the whole
//! rule list from all intents and pushes it to the data plane as one batch;
//! the change is committed locally only once the push succeeds, so the local
//! intent set always matches the last table the data plane accepted.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use skylane_core::{RouteKey, RouteRule, Upstream};

use crate::discovery::TopologyCache;
use crate::error::Error;

/// A request to route a domain and path to a cluster service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteIntent {
    /// Host to match.
    pub domain: String,
    /// Path to match.
    #[serde(default = "default_path")]
    pub path: String,
    /// Header predicates; a matching value names the upstream to use.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Target service as `namespace/name`.
    pub service: String,
    /// Backend port.
    pub port: u16,
    /// Relative weight against other intents on the same domain and path.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_weight() -> u32 {
    1
}

/// An accepted intent and the upstream it last resolved to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredIntent {
    /// Intent id.
    pub id: String,
    /// What was asked for.
    #[serde(flatten)]
    pub intent: RouteIntent,
    /// The resolved backend set.
    pub upstream: Upstream,
    /// When the intent was created.
    pub created_at: DateTime<Utc>,
    /// When the intent was last changed or re-resolved.
    pub updated_at: DateTime<Utc>,
}

/// A parsed `namespace/name` service reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    /// Namespace.
    pub namespace: String,
    /// Service name.
    pub name: String,
}

impl FromStr for ServiceRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => Ok(Self {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            _ => Err(Error::MalformedServiceReference(s.to_string())),
        }
    }
}

/// Pushes complete rule sets to the data plane.
#[async_trait::async_trait]
pub trait Publish: Send + Sync {
    /// Replace the data plane's route table with `rules`.
    async fn publish(&self, rules: Vec<RouteRule>) -> Result<(), Error>;
}

#[async_trait::async_trait]
impl<P: Publish + ?Sized> Publish for Arc<P> {
    async fn publish(&self, rules: Vec<RouteRule>) -> Result<(), Error> {
        (**self).publish(rules).await
    }
}

/// Owns the routing intents and keeps the data plane's table in step with them.
#[derive(Debug)]
pub struct RouteSynchronizer<P> {
    topology: Arc<TopologyCache>,
    publisher: P,
    intents: Mutex<BTreeMap<String, StoredIntent>>,
}

impl<P: Publish> RouteSynchronizer<P> {
    /// Creates a synchronizer with no intents.
    pub fn new(topology: Arc<TopologyCache>, publisher: P) -> Self {
        Self {
            topology,
            publisher,
            intents: Mutex::new(BTreeMap::new()),
        }
    }

    /// Accept a new intent and publish the resulting table.
    pub async fn create(&self, intent: RouteIntent) -> Result<StoredIntent, Error> {
        let upstream = self.resolve(&intent)?;
        let now = Utc::now();
        let stored = StoredIntent {
            id: uuid::Uuid::new_v4().to_string(),
            intent,
            upstream,
            created_at: now,
            updated_at: now,
        };

        let mut intents = self.intents.lock().await;
        let mut next = intents.clone();
        next.insert(stored.id.clone(), stored.clone());
        self.commit(&mut intents, next).await?;
        tracing::info!(id = %stored.id, domain = %stored.intent.domain, path = %stored.intent.path, "Route created");
        Ok(stored)
    }

    /// Replace the intent stored under `id`.
    pub async fn update(&self, id: &str, intent: RouteIntent) -> Result<StoredIntent, Error> {
        let mut intents = self.intents.lock().await;
        let existing = intents
            .get(id)
            .ok_or_else(|| Error::IntentNotFound(id.to_string()))?;
        let upstream = self.resolve(&intent)?;
        let stored = StoredIntent {
            id: id.to_string(),
            intent,
            upstream,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };

        let mut next = intents.clone();
        next.insert(id.to_string(), stored.clone());
        self.commit(&mut intents, next).await?;
        tracing::info!(%id, "Route updated");
        Ok(stored)
    }

    /// Remove the intent stored under `id`.
    pub async fn delete(&self, id: &str) -> Result<StoredIntent, Error> {
        let mut intents = self.intents.lock().await;
        let mut next = intents.clone();
        let removed = next
            .remove(id)
            .ok_or_else(|| Error::IntentNotFound(id.to_string()))?;
        self.commit(&mut intents, next).await?;
        tracing::info!(%id, "Route deleted");
        Ok(removed)
    }

    /// Every stored intent, oldest first.
    pub async fn list(&self) -> Vec<StoredIntent> {
        let mut intents: Vec<_> = self.intents.lock().await.values().cloned().collect();
        intents.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        intents
    }

    /// Re-resolve every intent against the current topology and publish if
    /// any upstream changed. A service whose endpoints drained or vanished is
    /// published with no addresses and marked unhealthy, so the data plane
    /// answers 503 instead of forwarding to stale pods. Returns whether a
    /// table was published.
    pub async fn resync(&self) -> Result<bool, Error> {
        let mut intents = self.intents.lock().await;
        let mut next = intents.clone();
        let mut changed = false;

        for stored in next.values_mut() {
            let upstream = match self.current_upstream(&stored.intent) {
                Ok(upstream) => upstream,
                Err(error) => {
                    tracing::warn!(id = %stored.id, %error, "Keeping last resolved upstream");
                    continue;
                }
            };
            if upstream == stored.upstream {
                continue;
            }
            if upstream.is_available() {
                tracing::info!(id = %stored.id, service = %stored.intent.service, "Upstream changed");
            } else {
                tracing::warn!(id = %stored.id, service = %stored.intent.service, "Service has no ready endpoints");
            }
            stored.upstream = upstream;
            stored.updated_at = Utc::now();
            changed = true;
        }

        if !changed {
            return Ok(false);
        }
        self.commit(&mut intents, next).await?;
        Ok(true)
    }

    /// Resolve an intent that is about to be accepted. Services without ready
    /// endpoints are rejected.
    fn resolve(&self, intent: &RouteIntent) -> Result<Upstream, Error> {
        let upstream = self.current_upstream(intent)?;
        if !upstream.is_available() {
            return Err(Error::UnresolvedService(intent.service.clone()));
        }
        Ok(upstream)
    }

    /// The upstream an intent maps to right now. Unknown services yield an
    /// unhealthy upstream with no addresses.
    fn current_upstream(&self, intent: &RouteIntent) -> Result<Upstream, Error> {
        let service: ServiceRef = intent.service.parse()?;
        let endpoints = self.topology.endpoints_for(&service.namespace, &service.name);

        let (addresses, ready) = match endpoints {
            Some(endpoints) => (endpoints.addresses, endpoints.ready),
            None => (Vec::new(), false),
        };
        let mut upstream = Upstream::new(intent.service.clone(), addresses, intent.port, intent.weight);
        upstream.healthy = ready;
        Ok(upstream)
    }

    async fn commit(
        &self,
        current: &mut BTreeMap<String, StoredIntent>,
        next: BTreeMap<String, StoredIntent>,
    ) -> Result<(), Error> {
        let rules = assemble(next.values());
        let count = rules.len();
        self.publisher.publish(rules).await?;
        tracing::debug!(rules = count, intents = next.len(), "Route table published");
        *current = next;
        Ok(())
    }
}

/// Merge intents into one rule per `(domain, path)`.
///
/// Upstreams keep intent creation order, header predicates are unioned with
/// the oldest intent winning a conflict, and the rule's timestamps span its
/// intents.
pub fn assemble<'a>(intents: impl IntoIterator<Item = &'a StoredIntent>) -> Vec<RouteRule> {
    let mut ordered: Vec<_> = intents.into_iter().collect();
    ordered.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

    let mut rules: BTreeMap<RouteKey, RouteRule> = BTreeMap::new();
    for stored in ordered {
        let intent = &stored.intent;
        let rule = rules
            .entry(RouteKey::new(intent.domain.clone(), intent.path.clone()))
            .or_insert_with(|| {
                let mut rule = RouteRule::new(intent.domain.clone(), intent.path.clone(), Vec::new());
                rule.created_at = stored.created_at;
                rule.updated_at = stored.updated_at;
                rule
            });

        rule.upstreams.push(stored.upstream.clone());
        for (name, value) in &intent.headers {
            rule.headers.entry(name.clone()).or_insert_with(|| value.clone());
        }
        rule.created_at = rule.created_at.min(stored.created_at);
        rule.updated_at = rule.updated_at.max(stored.updated_at);
    }
    rules.into_values().collect()
}
