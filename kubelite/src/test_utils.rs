//! Object builders and a scripted [`ObjectClient`] for unit tests
use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use futures::{channel::mpsc, stream, StreamExt};
use k8s_openapi::{
    api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node, Pod, PodSpec, PodStatus, Service,
        ServicePort, ServiceSpec,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use parking_lot::Mutex;

use crate::{
    client::{ClientError, EventStream, ListPage, ListParams, ObjectClient, WatchEvent, WatchParams},
    resource::{ClusterObject, ResourceKind},
};

fn meta(namespace: Option<&str>, name: &str, rv: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: namespace.map(String::from),
        name: Some(name.to_string()),
        resource_version: Some(rv.to_string()),
        ..ObjectMeta::default()
    }
}

pub fn node(name: &str, labels: &[(&str, &str)], rv: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..meta(None, name, rv)
        },
        ..Node::default()
    }
}

pub fn pod_in_phase(namespace: &str, name: &str, ip: &str, phase: &str, rv: &str) -> Pod {
    let mut pod = pod(namespace, name, Some(ip), rv);
    if let Some(status) = pod.status.as_mut() {
        status.phase = Some(phase.to_string());
    }
    pod
}

pub fn pod(namespace: &str, name: &str, ip: Option<&str>, rv: &str) -> Pod {
    Pod {
        metadata: meta(Some(namespace), name, rv),
        spec: Some(PodSpec {
            node_name: Some("node-a".into()),
            ..PodSpec::default()
        }),
        status: Some(PodStatus {
            pod_ip: ip.map(String::from),
            host_ip: Some("192.168.0.1".into()),
            phase: Some("Running".into()),
            ..PodStatus::default()
        }),
    }
}

pub fn service(namespace: &str, name: &str, cluster_ip: Option<&str>, rv: &str) -> Service {
    Service {
        metadata: meta(Some(namespace), name, rv),
        spec: Some(ServiceSpec {
            cluster_ip: cluster_ip.map(String::from),
            ports: Some(vec![ServicePort {
                name: Some("http-main".into()),
                port: 80,
                protocol: Some("TCP".into()),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

pub fn endpoints(namespace: &str, name: &str, ready: &[&str], not_ready: &[&str], rv: &str) -> Endpoints {
    let addresses = |ips: &[&str]| {
        Some(
            ips.iter()
                .map(|ip| EndpointAddress {
                    ip: ip.to_string(),
                    ..EndpointAddress::default()
                })
                .collect(),
        )
    };
    Endpoints {
        metadata: meta(Some(namespace), name, rv),
        subsets: Some(vec![EndpointSubset {
            addresses: addresses(ready),
            not_ready_addresses: addresses(not_ready),
            ports: Some(vec![EndpointPort {
                name: Some("http-main".into()),
                port: 8080,
                protocol: Some("TCP".into()),
                ..EndpointPort::default()
            }]),
        }]),
    }
}

pub fn gone() -> ClientError {
    ClientError::Api {
        code: 410,
        reason: "Expired".into(),
        message: "too old resource version".into(),
    }
}

pub type EventSender = mpsc::UnboundedSender<Result<WatchEvent, ClientError>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListCall {
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
}

#[derive(Default)]
struct Script {
    lists: HashMap<ResourceKind, VecDeque<Result<ListPage, ClientError>>>,
    collections: HashMap<ResourceKind, (Vec<ClusterObject>, String)>,
    watches: HashMap<ResourceKind, VecDeque<Result<EventStream, ClientError>>>,
    list_calls: HashMap<ResourceKind, Vec<ListCall>>,
    watch_calls: HashMap<ResourceKind, Vec<String>>,
}

/// Scripted cluster
///
/// List requests are answered from the queue filled by [`FakeClient::push_list`]
/// first, then by paging through the collection given to
/// [`FakeClient::serve_collection`] with the offset as continue token.
/// Watch requests pop the next scripted stream; with nothing scripted the
/// watch stays open forever without events.
#[derive(Default)]
pub struct FakeClient {
    script: Mutex<Script>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, kind: ResourceKind, page: Result<ListPage, ClientError>) {
        self.script.lock().lists.entry(kind).or_default().push_back(page);
    }

    pub fn serve_collection(&self, kind: ResourceKind, items: Vec<ClusterObject>, rv: &str) {
        self.script.lock().collections.insert(kind, (items, rv.to_string()));
    }

    /// Script the next watch of `kind`, fed through the returned sender
    ///
    /// Dropping the sender closes the stream.
    pub fn push_watch(&self, kind: ResourceKind) -> EventSender {
        let (tx, rx) = mpsc::unbounded();
        self.script.lock().watches.entry(kind).or_default().push_back(Ok(rx.boxed()));
        tx
    }

    pub fn push_watch_err(&self, kind: ResourceKind, err: ClientError) {
        self.script.lock().watches.entry(kind).or_default().push_back(Err(err));
    }

    pub fn list_calls(&self, kind: ResourceKind) -> Vec<ListCall> {
        self.script.lock().list_calls.get(&kind).cloned().unwrap_or_default()
    }

    /// The resourceVersion every watch of `kind` was opened at, in order
    pub fn watch_calls(&self, kind: ResourceKind) -> Vec<String> {
        self.script.lock().watch_calls.get(&kind).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ObjectClient for FakeClient {
    async fn list(&self, kind: ResourceKind, params: &ListParams) -> Result<ListPage, ClientError> {
        let mut script = self.script.lock();
        script.list_calls.entry(kind).or_default().push(ListCall {
            limit: params.limit,
            continue_token: params.continue_token.clone(),
        });
        if let Some(page) = script.lists.get_mut(&kind).and_then(VecDeque::pop_front) {
            return page;
        }
        let Some((items, rv)) = script.collections.get(&kind) else {
            return Err(ClientError::Transport(format!("no list scripted for {kind}")));
        };
        let offset = params
            .continue_token
            .as_deref()
            .map_or(Ok(0), str::parse::<usize>)
            .map_err(|_| ClientError::Api {
                code: 400,
                reason: "BadRequest".into(),
                message: "malformed continue token".into(),
            })?;
        let end = params
            .limit
            .map_or(items.len(), |limit| items.len().min(offset + limit as usize));
        Ok(ListPage {
            items: items[offset.min(end)..end].to_vec(),
            continue_token: (end < items.len()).then(|| end.to_string()),
            resource_version: Some(rv.clone()),
        })
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        _params: &WatchParams,
        resource_version: &str,
    ) -> Result<EventStream, ClientError> {
        let mut script = self.script.lock();
        script
            .watch_calls
            .entry(kind)
            .or_default()
            .push(resource_version.to_string());
        script
            .watches
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(stream::pending().boxed()))
    }
}
