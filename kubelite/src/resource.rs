//! The tracked resource kinds and the objects decoded for them

use std::fmt;

use k8s_openapi::{
    api::core::v1::{Endpoints, Node, Pod, Service},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::Resource;

/// One of the four cluster resource kinds the index tracks
///
/// The kind decides which handler an object is dispatched to and which watch
/// stream (and therefore which cursor) an event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Cluster-scoped `v1/Node`
    Node,
    /// `v1/Pod`, across all namespaces
    Pod,
    /// `v1/Service`, across all namespaces
    Service,
    /// `v1/Endpoints`, across all namespaces
    Endpoints,
}

impl ResourceKind {
    /// Every tracked kind, in bootstrap order
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Node,
        ResourceKind::Pod,
        ResourceKind::Service,
        ResourceKind::Endpoints,
    ];

    /// The `kind` name as the apiserver spells it
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Node => "Node",
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::Endpoints => "Endpoints",
        }
    }

    pub(crate) fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an object reached a handler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Delivered by a full listing (bootstrap or relist)
    Sync,
    /// Watch `ADDED`
    Added,
    /// Watch `MODIFIED`
    Modified,
    /// Watch `DELETED`
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventType::Sync => "sync",
            EventType::Added => "added",
            EventType::Modified => "modified",
            EventType::Deleted => "deleted",
        })
    }
}

/// A decoded orchestrator object
///
/// Each variant carries the typed object for one [`ResourceKind`], so handlers
/// match exhaustively instead of probing an untyped payload.
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterObject {
    /// A node
    Node(Node),
    /// A pod
    Pod(Pod),
    /// A service
    Service(Service),
    /// An endpoints object
    Endpoints(Endpoints),
}

impl ClusterObject {
    /// The kind this object decoded as
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            ClusterObject::Node(_) => ResourceKind::Node,
            ClusterObject::Pod(_) => ResourceKind::Pod,
            ClusterObject::Service(_) => ResourceKind::Service,
            ClusterObject::Endpoints(_) => ResourceKind::Endpoints,
        }
    }

    /// The object metadata
    #[must_use]
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ClusterObject::Node(o) => o.meta(),
            ClusterObject::Pod(o) => o.meta(),
            ClusterObject::Service(o) => o.meta(),
            ClusterObject::Endpoints(o) => o.meta(),
        }
    }

    /// The object's `metadata.resourceVersion`, when set and non-empty
    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref().filter(|rv| !rv.is_empty())
    }

    /// The object's name, or an empty string if the apiserver omitted it
    #[must_use]
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// The object's namespace; `None` for cluster-scoped kinds
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }
}

impl From<Node> for ClusterObject {
    fn from(node: Node) -> Self {
        ClusterObject::Node(node)
    }
}

impl From<Pod> for ClusterObject {
    fn from(pod: Pod) -> Self {
        ClusterObject::Pod(pod)
    }
}

impl From<Service> for ClusterObject {
    fn from(svc: Service) -> Self {
        ClusterObject::Service(svc)
    }
}

impl From<Endpoints> for ClusterObject {
    fn from(ep: Endpoints) -> Self {
        ClusterObject::Endpoints(ep)
    }
}
