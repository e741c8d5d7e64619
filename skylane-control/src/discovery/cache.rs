//! In-memory mirror of cluster services and endpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::{Apply, Event};

/// A record kept in the topology cache under a `namespace/name` key.
pub trait Record: Clone + Send + Sync + 'static {
    /// The cache key of this record.
    fn key(&self) -> String;
}

/// One declared port of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServicePort {
    /// Port name, empty when unnamed.
    pub name: String,
    /// Service port.
    pub port: i32,
    /// Port on the backing pods.
    pub target_port: i32,
    /// Transport protocol.
    pub protocol: String,
}

/// A cluster service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Cluster-internal virtual IP, if allocated.
    pub cluster_ip: Option<String>,
    /// Declared ports.
    pub ports: Vec<ServicePort>,
    /// Service labels.
    pub labels: BTreeMap<String, String>,
    /// When the record was observed.
    pub updated_at: DateTime<Utc>,
}

impl Record for ServiceRecord {
    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// The ready backends of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointRecord {
    /// Namespace.
    pub namespace: String,
    /// Name of the service the endpoints belong to.
    pub name: String,
    /// Ready backend IP addresses.
    pub addresses: Vec<String>,
    /// Backend ports.
    pub ports: Vec<i32>,
    /// Whether at least one backend address is present.
    pub ready: bool,
    /// When the record was observed.
    pub updated_at: DateTime<Utc>,
}

impl EndpointRecord {
    /// Creates a record, deriving `ready` from the address list.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        addresses: Vec<String>,
        ports: Vec<i32>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ready: !addresses.is_empty(),
            addresses,
            ports,
            updated_at: Utc::now(),
        }
    }
}

impl Record for EndpointRecord {
    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Services and endpoints keyed by `namespace/name`.
///
/// Only the reconcilers write; every other reader gets copies.
#[derive(Debug, Default)]
pub struct TopologyCache {
    services: RwLock<BTreeMap<String, ServiceRecord>>,
    endpoints: RwLock<BTreeMap<String, EndpointRecord>>,
}

impl TopologyCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every known service.
    pub fn services(&self) -> BTreeMap<String, ServiceRecord> {
        self.services.read().clone()
    }

    /// A copy of every known endpoint record.
    pub fn endpoints(&self) -> BTreeMap<String, EndpointRecord> {
        self.endpoints.read().clone()
    }

    /// The endpoints of one service, if known.
    pub fn endpoints_for(&self, namespace: &str, name: &str) -> Option<EndpointRecord> {
        self.endpoints
            .read()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }
}

impl Apply<ServiceRecord> for TopologyCache {
    fn apply(&self, event: Event<ServiceRecord>) {
        apply_to(&self.services, event);
    }
}

impl Apply<EndpointRecord> for TopologyCache {
    fn apply(&self, event: Event<EndpointRecord>) {
        apply_to(&self.endpoints, event);
    }
}

fn apply_to<T: Record>(map: &RwLock<BTreeMap<String, T>>, event: Event<T>) {
    match event {
        Event::Added(record) | Event::Modified(record) => {
            let key = record.key();
            tracing::debug!(%key, "Upserted");
            map.write().insert(key, record);
        }
        Event::Deleted(record) => {
            let key = record.key();
            tracing::debug!(%key, "Deleted");
            map.write().remove(&key);
        }
        Event::Restarted(records) => {
            let fresh: BTreeMap<_, _> = records.into_iter().map(|r| (r.key(), r)).collect();
            tracing::info!(count = fresh.len(), "Relisted");
            *map.write() = fresh;
        }
    }
}
