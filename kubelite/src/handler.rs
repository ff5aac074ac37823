//! Per-kind event handlers translating objects into index mutations

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service};
use tracing::{trace, warn};

use crate::{
    index::{EndpointsRecord, Index, NodeRecord, PodRecord, ServiceRecord},
    metrics::Metrics,
    resource::{ClusterObject, EventType, ResourceKind},
};

/// Applies decoded objects to an [`Index`]
///
/// Shared by the synchronizer and every watch loop; cloning is cheap.
#[derive(Clone, Debug)]
pub struct Handlers {
    index: Index,
    metrics: Arc<Metrics>,
    prune_on_delete: bool,
}

impl Handlers {
    /// Handlers writing into `index`, removing entries on delete events
    #[must_use]
    pub fn new(index: Index, metrics: Arc<Metrics>) -> Self {
        Self {
            index,
            metrics,
            prune_on_delete: true,
        }
    }

    /// Whether `Deleted` events remove the matching index entry
    ///
    /// When disabled, deletes are only logged and entries linger until the
    /// identity is reused or the kind is relisted.
    #[must_use]
    pub fn prune_on_delete(mut self, enabled: bool) -> Self {
        self.prune_on_delete = enabled;
        self
    }

    /// The index these handlers write to
    #[must_use]
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The metrics these handlers record to
    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Apply one object received on the `kind` stream
    ///
    /// Returns `false` if the object did not decode as `kind`; such objects are
    /// dropped and counted as an anomaly, never surfaced as an error.
    pub fn apply(&self, kind: ResourceKind, event: EventType, obj: &ClusterObject) -> bool {
        if obj.kind() != kind {
            self.metrics.record_decode_mismatch();
            warn!(
                expected = %kind,
                actual = %obj.kind(),
                name = obj.name(),
                %event,
                "dropping object of unexpected kind"
            );
            return false;
        }
        self.metrics.record_applied(kind);
        match obj {
            ClusterObject::Node(node) => self.on_node(event, node),
            ClusterObject::Pod(pod) => self.on_pod(event, pod),
            ClusterObject::Service(svc) => self.on_service(event, svc),
            ClusterObject::Endpoints(ep) => self.on_endpoints(event, ep),
        }
        true
    }

    /// Reset every entry of `kind` to exactly the objects in `objs`
    ///
    /// Used after a relist: anything not present in the listing is assumed
    /// deleted. Mismatched objects are dropped as in [`Handlers::apply`].
    pub fn replace(&self, kind: ResourceKind, objs: &[ClusterObject]) {
        let objs = objs.iter().filter(|obj| {
            let matches = obj.kind() == kind;
            if !matches {
                self.metrics.record_decode_mismatch();
                warn!(expected = %kind, actual = %obj.kind(), name = obj.name(), "dropping object of unexpected kind");
            }
            matches
        });
        match kind {
            ResourceKind::Node => self.index.replace_nodes(objs.filter_map(|obj| match obj {
                ClusterObject::Node(node) => Some(NodeRecord::from_node(node)),
                _ => None,
            })),
            ResourceKind::Pod => self.index.replace_pods(objs.filter_map(|obj| match obj {
                ClusterObject::Pod(pod) => PodRecord::from_pod(pod),
                _ => None,
            })),
            ResourceKind::Service => self.index.replace_services(objs.filter_map(|obj| match obj {
                ClusterObject::Service(svc) => Some(ServiceRecord::from_service(svc)),
                _ => None,
            })),
            ResourceKind::Endpoints => self.index.replace_endpoints(objs.filter_map(|obj| match obj {
                ClusterObject::Endpoints(ep) => Some(EndpointsRecord::from_endpoints(ep)),
                _ => None,
            })),
        }
    }

    fn on_node(&self, event: EventType, node: &Node) {
        let record = NodeRecord::from_node(node);
        trace!(%event, name = %record.name, labels = ?record.labels, "node");
        if event == EventType::Deleted {
            if self.prune_on_delete {
                self.index.remove_node(&record.name);
            }
            return;
        }
        self.index.upsert_node(record);
    }

    fn on_pod(&self, event: EventType, pod: &Pod) {
        // Pending pods have no IP yet and cannot be indexed
        let Some(record) = PodRecord::from_pod(pod) else {
            trace!(%event, name = ?pod.metadata.name, "pod without ip");
            return;
        };
        trace!(
            %event,
            namespace = %record.namespace,
            name = %record.name,
            ip = %record.ip,
            phase = ?record.phase,
            "pod"
        );
        if event == EventType::Deleted {
            if self.prune_on_delete {
                self.index.remove_pod(&record.ip, &record.key());
            }
            return;
        }
        self.index.upsert_pod(record);
    }

    fn on_service(&self, event: EventType, svc: &Service) {
        let record = ServiceRecord::from_service(svc);
        trace!(%event, key = %record.key, labels = ?record.labels, "svc");
        if event == EventType::Deleted {
            if self.prune_on_delete {
                self.index.remove_service(&record.key);
            }
            return;
        }
        self.index.upsert_service(record);
    }

    fn on_endpoints(&self, event: EventType, ep: &Endpoints) {
        let record = EndpointsRecord::from_endpoints(ep);
        trace!(%event, key = %record.key, ready = record.ready.len(), "ep");
        if event == EventType::Deleted {
            if self.prune_on_delete {
                self.index.remove_endpoints(&record.key);
            }
            return;
        }
        self.index.upsert_endpoints(record);
    }
}
