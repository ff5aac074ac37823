//! In-memory topology index fed by the watch loops
//!
//! The [`Index`] is the single source of truth read by the downstream
//! discovery layer. It owns its synchronization: every kind lives behind its
//! own [`RwLock`], so readers of one kind never wait on writers of another,
//! and all accessors hand out clones so no guard escapes.

use std::{collections::BTreeMap, fmt, sync::Arc};

use ahash::AHashMap;
use k8s_openapi::api::core::v1::{EndpointAddress, Endpoints, Node, Pod, Service};
use parking_lot::RwLock;

use crate::resource::ResourceKind;

/// Well-known node label carrying the availability zone
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
/// Well-known node label carrying the region
pub const LABEL_REGION: &str = "topology.kubernetes.io/region";
/// Legacy spelling of [`LABEL_ZONE`]
pub const LEGACY_LABEL_ZONE: &str = "failure-domain.beta.kubernetes.io/zone";
/// Legacy spelling of [`LABEL_REGION`]
pub const LEGACY_LABEL_REGION: &str = "failure-domain.beta.kubernetes.io/region";

/// Label or annotation mapping as stored in the index
pub type Labels = BTreeMap<String, String>;

/// Identity of a namespaced object
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ObjectKey {
    /// Build a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Topology view of a node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeRecord {
    /// Node name
    pub name: String,
    /// Full label mapping of the node
    pub labels: Labels,
}

impl NodeRecord {
    /// Derive the record from a node object
    #[must_use]
    pub fn from_node(node: &Node) -> Self {
        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
        }
    }

    /// Availability zone of the node, if labelled
    #[must_use]
    pub fn zone(&self) -> Option<&str> {
        self.label_with_fallback(LABEL_ZONE, LEGACY_LABEL_ZONE)
    }

    /// Region of the node, if labelled
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.label_with_fallback(LABEL_REGION, LEGACY_LABEL_REGION)
    }

    fn label_with_fallback(&self, key: &str, legacy: &str) -> Option<&str> {
        self.labels
            .get(key)
            .or_else(|| self.labels.get(legacy))
            .map(String::as_str)
    }
}

/// Topology view of a pod, keyed in the index by its IP
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodRecord {
    /// Namespace of the pod
    pub namespace: String,
    /// Name of the pod
    pub name: String,
    /// The pod IP this record is indexed under
    pub ip: String,
    /// IP of the node hosting the pod
    pub host_ip: Option<String>,
    /// Name of the node the pod is scheduled on
    pub node_name: Option<String>,
    /// Lifecycle phase, e.g. `Running`
    pub phase: Option<String>,
    /// Pod labels
    pub labels: Labels,
    /// Pod annotations
    pub annotations: Labels,
}

impl PodRecord {
    /// Derive the record from a pod object
    ///
    /// Returns `None` when the pod has no IP assigned yet, which is the common
    /// case for pending pods. Such pods are not indexed.
    #[must_use]
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let status = pod.status.as_ref()?;
        let ip = status.pod_ip.as_deref().filter(|ip| !ip.is_empty())?;
        Some(Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            ip: ip.to_string(),
            host_ip: status.host_ip.clone(),
            node_name: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
            phase: status.phase.clone(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            annotations: pod.metadata.annotations.clone().unwrap_or_default(),
        })
    }

    /// Namespace and name of the pod that owns this record
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// A named port exposed by a service or endpoints object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortRecord {
    /// Port name, required when more than one port is exposed
    pub name: Option<String>,
    /// Port number
    pub port: i32,
    /// `TCP`, `UDP` or `SCTP`
    pub protocol: Option<String>,
}

/// Topology view of a service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Namespace and name of the service
    pub key: ObjectKey,
    /// Service labels
    pub labels: Labels,
    /// Virtual IP, `None` for headless or external-name services
    pub cluster_ip: Option<String>,
    /// Exposed ports
    pub ports: Vec<PortRecord>,
}

impl ServiceRecord {
    /// Derive the record from a service object
    #[must_use]
    pub fn from_service(svc: &Service) -> Self {
        let spec = svc.spec.as_ref();
        Self {
            key: ObjectKey::new(
                svc.metadata.namespace.clone().unwrap_or_default(),
                svc.metadata.name.clone().unwrap_or_default(),
            ),
            labels: svc.metadata.labels.clone().unwrap_or_default(),
            cluster_ip: spec
                .and_then(|spec| spec.cluster_ip.clone())
                .filter(|ip| !ip.is_empty() && ip != "None"),
            ports: spec
                .and_then(|spec| spec.ports.as_ref())
                .map(|ports| {
                    ports
                        .iter()
                        .map(|p| PortRecord {
                            name: p.name.clone(),
                            port: p.port,
                            protocol: p.protocol.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// One backend address of an endpoints object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressRecord {
    /// Backend IP
    pub ip: String,
    /// Name of the object (usually a pod) behind the address
    pub target: Option<String>,
    /// Node hosting the backend
    pub node_name: Option<String>,
}

impl From<&EndpointAddress> for AddressRecord {
    fn from(addr: &EndpointAddress) -> Self {
        Self {
            ip: addr.ip.clone(),
            target: addr.target_ref.as_ref().and_then(|target| target.name.clone()),
            node_name: addr.node_name.clone(),
        }
    }
}

/// Topology view of an endpoints object
///
/// Readiness of a pod is only visible through which list its IP appears in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointsRecord {
    /// Namespace and name, matching the service it belongs to
    pub key: ObjectKey,
    /// Endpoints labels
    pub labels: Labels,
    /// Addresses ready to receive traffic
    pub ready: Vec<AddressRecord>,
    /// Addresses that exist but are not ready
    pub not_ready: Vec<AddressRecord>,
    /// Ports served by the addresses, deduplicated across subsets
    pub ports: Vec<PortRecord>,
}

impl EndpointsRecord {
    /// Derive the record from an endpoints object, flattening its subsets
    #[must_use]
    pub fn from_endpoints(ep: &Endpoints) -> Self {
        let mut record = Self {
            key: ObjectKey::new(
                ep.metadata.namespace.clone().unwrap_or_default(),
                ep.metadata.name.clone().unwrap_or_default(),
            ),
            labels: ep.metadata.labels.clone().unwrap_or_default(),
            ..Self::default()
        };
        for subset in ep.subsets.iter().flatten() {
            record
                .ready
                .extend(subset.addresses.iter().flatten().map(AddressRecord::from));
            record
                .not_ready
                .extend(subset.not_ready_addresses.iter().flatten().map(AddressRecord::from));
            for port in subset.ports.iter().flatten() {
                let port = PortRecord {
                    name: port.name.clone(),
                    port: port.port,
                    protocol: port.protocol.clone(),
                };
                if !record.ports.contains(&port) {
                    record.ports.push(port);
                }
            }
        }
        record
    }

    /// Whether `ip` is currently a ready backend
    #[must_use]
    pub fn is_ready(&self, ip: &str) -> bool {
        self.ready.iter().any(|addr| addr.ip == ip)
    }
}

#[derive(Debug, Default)]
struct Maps {
    nodes: RwLock<AHashMap<String, NodeRecord>>,
    pods: RwLock<AHashMap<String, PodRecord>>,
    services: RwLock<AHashMap<ObjectKey, ServiceRecord>>,
    endpoints: RwLock<AHashMap<ObjectKey, EndpointsRecord>>,
}

/// Concurrency-safe topology index
///
/// Cloning produces another handle to the same backing maps.
///
/// The index is queryable at any time, including while the initial sync is
/// still running, so readers may observe a partially populated view. There is
/// no atomicity across kinds.
#[derive(Clone, Debug, Default)]
pub struct Index {
    maps: Arc<Maps>,
}

impl Index {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record of a node
    pub fn upsert_node(&self, record: NodeRecord) {
        self.maps.nodes.write().insert(record.name.clone(), record);
    }

    /// Labels of the named node
    #[must_use]
    pub fn get_node_labels(&self, name: &str) -> Option<Labels> {
        self.maps.nodes.read().get(name).map(|node| node.labels.clone())
    }

    /// The full record of the named node
    #[must_use]
    pub fn get_node(&self, name: &str) -> Option<NodeRecord> {
        self.maps.nodes.read().get(name).cloned()
    }

    /// Remove a node, returning its record if it was indexed
    pub fn remove_node(&self, name: &str) -> Option<NodeRecord> {
        self.maps.nodes.write().remove(name)
    }

    /// Insert or replace the record indexed under the pod's IP
    pub fn upsert_pod(&self, record: PodRecord) {
        self.maps.pods.write().insert(record.ip.clone(), record);
    }

    /// The record of the pod currently holding `ip`
    #[must_use]
    pub fn get_pod(&self, ip: &str) -> Option<PodRecord> {
        self.maps.pods.read().get(ip).cloned()
    }

    /// Remove the record under `ip`, but only if it still belongs to `owner`
    ///
    /// IPs are recycled, so a late delete of an old pod must not evict the
    /// record of a newer pod that picked up the same address.
    pub fn remove_pod(&self, ip: &str, owner: &ObjectKey) -> Option<PodRecord> {
        let mut pods = self.maps.pods.write();
        let owned = pods
            .get(ip)
            .is_some_and(|record| record.namespace == owner.namespace && record.name == owner.name);
        if owned {
            pods.remove(ip)
        } else {
            None
        }
    }

    /// All indexed pod IPs, in no particular order
    #[must_use]
    pub fn pod_ips(&self) -> Vec<String> {
        self.maps.pods.read().keys().cloned().collect()
    }

    /// Insert or replace a service record
    pub fn upsert_service(&self, record: ServiceRecord) {
        self.maps.services.write().insert(record.key.clone(), record);
    }

    /// The record of a service
    #[must_use]
    pub fn get_service(&self, key: &ObjectKey) -> Option<ServiceRecord> {
        self.maps.services.read().get(key).cloned()
    }

    /// Remove a service record
    pub fn remove_service(&self, key: &ObjectKey) -> Option<ServiceRecord> {
        self.maps.services.write().remove(key)
    }

    /// Insert or replace an endpoints record
    pub fn upsert_endpoints(&self, record: EndpointsRecord) {
        self.maps.endpoints.write().insert(record.key.clone(), record);
    }

    /// The record of an endpoints object
    #[must_use]
    pub fn get_endpoints(&self, key: &ObjectKey) -> Option<EndpointsRecord> {
        self.maps.endpoints.read().get(key).cloned()
    }

    /// Remove an endpoints record
    pub fn remove_endpoints(&self, key: &ObjectKey) -> Option<EndpointsRecord> {
        self.maps.endpoints.write().remove(key)
    }

    /// Replace every node record with `records`
    pub fn replace_nodes(&self, records: impl IntoIterator<Item = NodeRecord>) {
        let fresh = records.into_iter().map(|r| (r.name.clone(), r)).collect();
        *self.maps.nodes.write() = fresh;
    }

    /// Replace every pod record with `records`
    pub fn replace_pods(&self, records: impl IntoIterator<Item = PodRecord>) {
        let fresh = records.into_iter().map(|r| (r.ip.clone(), r)).collect();
        *self.maps.pods.write() = fresh;
    }

    /// Replace every service record with `records`
    pub fn replace_services(&self, records: impl IntoIterator<Item = ServiceRecord>) {
        let fresh = records.into_iter().map(|r| (r.key.clone(), r)).collect();
        *self.maps.services.write() = fresh;
    }

    /// Replace every endpoints record with `records`
    pub fn replace_endpoints(&self, records: impl IntoIterator<Item = EndpointsRecord>) {
        let fresh = records.into_iter().map(|r| (r.key.clone(), r)).collect();
        *self.maps.endpoints.write() = fresh;
    }

    /// Number of records currently indexed for `kind`
    #[must_use]
    pub fn len(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Node => self.maps.nodes.read().len(),
            ResourceKind::Pod => self.maps.pods.read().len(),
            ResourceKind::Service => self.maps.services.read().len(),
            ResourceKind::Endpoints => self.maps.endpoints.read().len(),
        }
    }

    /// Whether nothing at all is indexed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        ResourceKind::ALL.iter().all(|kind| self.len(*kind) == 0)
    }
}
