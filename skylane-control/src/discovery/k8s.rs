//! Kubernetes watch sources for services and endpoints.

use std::fmt::Debug;

use chrono::Utc;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;

use super::{EndpointRecord, Event, EventStream, ServicePort, ServiceRecord, Subscribe, WatchError};

/// Server-side watch timeout; the API server caps it just below five minutes.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// A Kubernetes resource mirrored into the topology cache.
pub trait Watched: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static {
    /// The cache record built from the resource.
    type Record: Send + 'static;

    /// Convert the resource into its cache record.
    fn to_record(&self) -> Self::Record;
}

impl Watched for Service {
    type Record = ServiceRecord;

    fn to_record(&self) -> ServiceRecord {
        let spec = self.spec.as_ref();
        let ports = spec
            .and_then(|spec| spec.ports.as_ref())
            .into_iter()
            .flatten()
            .map(|port| ServicePort {
                name: port.name.clone().unwrap_or_default(),
                port: port.port,
                target_port: match &port.target_port {
                    Some(IntOrString::Int(target)) => *target,
                    _ => port.port,
                },
                protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            })
            .collect();

        ServiceRecord {
            namespace: self.metadata.namespace.clone().unwrap_or_default(),
            name: self.metadata.name.clone().unwrap_or_default(),
            cluster_ip: spec.and_then(|spec| spec.cluster_ip.clone()),
            ports,
            labels: self.metadata.labels.clone().unwrap_or_default(),
            updated_at: Utc::now(),
        }
    }
}

impl Watched for Endpoints {
    type Record = EndpointRecord;

    fn to_record(&self) -> EndpointRecord {
        let subsets = self.subsets.iter().flatten();
        // Only ready addresses are listed under `addresses`.
        let addresses = subsets
            .clone()
            .flat_map(|subset| subset.addresses.iter().flatten())
            .map(|address| address.ip.clone())
            .collect();
        let ports = subsets
            .flat_map(|subset| subset.ports.iter().flatten())
            .map(|port| port.port)
            .collect();

        EndpointRecord::new(
            self.metadata.namespace.clone().unwrap_or_default(),
            self.metadata.name.clone().unwrap_or_default(),
            addresses,
            ports,
        )
    }
}

/// Lists and then watches one resource kind through the Kubernetes API.
#[derive(Clone)]
pub struct KubeWatch<K> {
    api: Api<K>,
}

impl<K> KubeWatch<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    /// Watches `namespace`, or every namespace when `None`.
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        let api = match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        Self { api }
    }
}

#[async_trait::async_trait]
impl<K: Watched> Subscribe for KubeWatch<K> {
    type Record = K::Record;

    async fn subscribe(&self) -> Result<EventStream<K::Record>, WatchError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|error| WatchError::Open(Box::new(error)))?;
        let version = list.metadata.resource_version.clone().unwrap_or_default();
        let initial: Vec<_> = list.items.iter().map(Watched::to_record).collect();
        tracing::debug!(%version, count = initial.len(), "Listed");

        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let updates = self
            .api
            .watch(&params, &version)
            .await
            .map_err(|error| WatchError::Open(Box::new(error)))?
            .filter_map(|event| async move {
                match event {
                    Ok(WatchEvent::Added(resource)) => Some(Ok(Event::Added(resource.to_record()))),
                    Ok(WatchEvent::Modified(resource)) => Some(Ok(Event::Modified(resource.to_record()))),
                    Ok(WatchEvent::Deleted(resource)) => Some(Ok(Event::Deleted(resource.to_record()))),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(status)) => Some(Err(WatchError::Api(format!("{:?}", status)))),
                    Err(error) => Some(Err(WatchError::Api(error.to_string()))),
                }
            });

        Ok(stream::once(async move { Ok(Event::Restarted(initial)) })
            .chain(updates)
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, ServicePort as KubeServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn address(ip: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            ..Default::default()
        }
    }

    fn endpoint_port(port: i32) -> EndpointPort {
        EndpointPort {
            port,
            ..Default::default()
        }
    }

    #[test]
    fn service_ports_fall_back_to_service_port() {
        let service = Service {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..meta("prod", "web")
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.7".to_string()),
                ports: Some(vec![
                    KubeServicePort {
                        name: Some("http".to_string()),
                        port: 80,
                        target_port: Some(IntOrString::Int(8080)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                    KubeServicePort {
                        port: 443,
                        target_port: Some(IntOrString::String("https".to_string())),
                        protocol: Some("UDP".to_string()),
                        ..Default::default()
                    },
                    KubeServicePort {
                        port: 9090,
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let record = service.to_record();
        assert_eq!(record.namespace, "prod");
        assert_eq!(record.name, "web");
        assert_eq!(record.cluster_ip.as_deref(), Some("10.96.0.7"));
        assert_eq!(record.labels["app"], "web");

        let ports: Vec<_> = record
            .ports
            .iter()
            .map(|p| (p.name.as_str(), p.port, p.target_port, p.protocol.as_str()))
            .collect();
        assert_eq!(
            ports,
            vec![
                ("http", 80, 8080, "TCP"),
                ("", 443, 443, "UDP"),
                ("", 9090, 9090, "TCP"),
            ]
        );
    }

    #[test]
    fn bare_service_maps_to_empty_record() {
        let record = Service::default().to_record();
        assert_eq!(record.namespace, "");
        assert_eq!(record.name, "");
        assert_eq!(record.cluster_ip, None);
        assert!(record.ports.is_empty());
        assert!(record.labels.is_empty());
    }

    #[test]
    fn endpoints_use_only_ready_addresses() {
        let endpoints = Endpoints {
            metadata: meta("prod", "web"),
            subsets: Some(vec![
                EndpointSubset {
                    addresses: Some(vec![address("10.0.0.1"), address("10.0.0.2")]),
                    not_ready_addresses: Some(vec![address("10.0.0.99")]),
                    ports: Some(vec![endpoint_port(8080)]),
                },
                EndpointSubset {
                    addresses: Some(vec![address("10.0.1.1")]),
                    not_ready_addresses: None,
                    ports: Some(vec![endpoint_port(9090)]),
                },
            ]),
        };

        let record = endpoints.to_record();
        assert_eq!(record.namespace, "prod");
        assert_eq!(record.name, "web");
        assert_eq!(record.addresses, vec!["10.0.0.1", "10.0.0.2", "10.0.1.1"]);
        assert_eq!(record.ports, vec![8080, 9090]);
        assert!(record.ready);
    }

    #[test]
    fn endpoints_with_only_unready_addresses_are_not_ready() {
        let endpoints = Endpoints {
            metadata: meta("prod", "web"),
            subsets: Some(vec![EndpointSubset {
                addresses: None,
                not_ready_addresses: Some(vec![address("10.0.0.99")]),
                ports: Some(vec![endpoint_port(8080)]),
            }]),
        };

        let record = endpoints.to_record();
        assert!(record.addresses.is_empty());
        assert!(!record.ready);
        assert_eq!(record.ports, vec![8080]);

        assert!(!Endpoints::default().to_record().ready);
    }
}
