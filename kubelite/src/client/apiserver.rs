use std::fmt::Debug;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service};
use kube::{
    api::{Api, ListParams, WatchEvent as RawEvent, WatchParams},
    core::ErrorResponse,
    Client,
};
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{ClientError, EventStream, ListPage, ObjectClient, WatchEvent};
use crate::resource::{ClusterObject, ResourceKind};

/// [`ObjectClient`] backed by a [`kube::Client`]
///
/// Every kind is listed and watched cluster-wide.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    /// Wrap an already configured client
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client the way [`connect`] does
    ///
    /// # Errors
    ///
    /// Fails when the inferred configuration cannot produce a client.
    pub async fn try_default() -> Result<Self, kube::Error> {
        Ok(Self::new(connect().await?))
    }
}

/// Server used when neither in-cluster settings nor a kubeconfig are present
pub const LOCAL_APISERVER: &str = "http://localhost:8080";

fn local_config() -> kube::Config {
    kube::Config::new(http::Uri::from_static(LOCAL_APISERVER))
}

/// Configuration from the in-cluster environment or the kubeconfig, else an
/// unauthenticated [`LOCAL_APISERVER`]
pub async fn infer_config() -> kube::Config {
    match kube::Config::infer().await {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, server = LOCAL_APISERVER, "no cluster configuration found, using local apiserver");
            local_config()
        }
    }
}

/// A [`kube::Client`] for [`infer_config`]
///
/// # Errors
///
/// Fails when the configuration cannot produce a client, such as an
/// unreadable TLS identity.
pub async fn connect() -> Result<Client, kube::Error> {
    Client::try_from(infer_config().await)
}

impl From<ErrorResponse> for ClientError {
    fn from(resp: ErrorResponse) -> Self {
        ClientError::Api {
            code: resp.code,
            reason: resp.reason,
            message: resp.message,
        }
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => resp.into(),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

async fn list_as<K>(api: Api<K>, params: &ListParams, wrap: fn(K) -> ClusterObject) -> Result<ListPage, ClientError>
where
    K: Clone + DeserializeOwned + Debug,
{
    let list = api.list(params).await?;
    Ok(ListPage {
        continue_token: list.metadata.continue_.filter(|token| !token.is_empty()),
        resource_version: list.metadata.resource_version,
        items: list.items.into_iter().map(wrap).collect(),
    })
}

async fn watch_as<K>(
    api: Api<K>,
    params: &WatchParams,
    resource_version: &str,
    wrap: fn(K) -> ClusterObject,
) -> Result<EventStream, ClientError>
where
    K: Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = api.watch(params, resource_version).await?;
    Ok(stream
        .map_ok(move |event| match event {
            RawEvent::Added(obj) => WatchEvent::Added(wrap(obj)),
            RawEvent::Modified(obj) => WatchEvent::Modified(wrap(obj)),
            RawEvent::Deleted(obj) => WatchEvent::Deleted(wrap(obj)),
            RawEvent::Bookmark(bookmark) => WatchEvent::Bookmark {
                resource_version: bookmark.metadata.resource_version,
            },
            RawEvent::Error(resp) => WatchEvent::Error(resp.into()),
        })
        .map_err(ClientError::from)
        .boxed())
}

#[async_trait]
impl ObjectClient for KubeClient {
    async fn list(&self, kind: ResourceKind, params: &ListParams) -> Result<ListPage, ClientError> {
        let client = self.client.clone();
        match kind {
            ResourceKind::Node => list_as(Api::<Node>::all(client), params, ClusterObject::Node).await,
            ResourceKind::Pod => list_as(Api::<Pod>::all(client), params, ClusterObject::Pod).await,
            ResourceKind::Service => {
                list_as(Api::<Service>::all(client), params, ClusterObject::Service).await
            }
            ResourceKind::Endpoints => {
                list_as(Api::<Endpoints>::all(client), params, ClusterObject::Endpoints).await
            }
        }
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        params: &WatchParams,
        resource_version: &str,
    ) -> Result<EventStream, ClientError> {
        let client = self.client.clone();
        match kind {
            ResourceKind::Node => {
                watch_as(Api::<Node>::all(client), params, resource_version, ClusterObject::Node).await
            }
            ResourceKind::Pod => {
                watch_as(Api::<Pod>::all(client), params, resource_version, ClusterObject::Pod).await
            }
            ResourceKind::Service => {
                watch_as(
                    Api::<Service>::all(client),
                    params,
                    resource_version,
                    ClusterObject::Service,
                )
                .await
            }
            ResourceKind::Endpoints => {
                watch_as(
                    Api::<Endpoints>::all(client),
                    params,
                    resource_version,
                    ClusterObject::Endpoints,
                )
                .await
            }
        }
    }
}
