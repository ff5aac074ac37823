//! The boundary to the cluster's object store
//!
//! The synchronization engine only needs two primitives from a cluster client:
//! a bounded `List` and a resumable `Watch`. [`ObjectClient`] captures exactly
//! those, so the engine can run against the real apiserver through
//! [`KubeClient`] or against a scripted fake in tests.

mod apiserver;

pub use apiserver::{connect, infer_config, KubeClient, LOCAL_APISERVER};
pub use kube::api::{ListParams, WatchParams};

use crate::resource::{ClusterObject, ResourceKind};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// HTTP status the apiserver uses when a `resourceVersion` or continue token has expired
pub const GONE: u16 = 410;

/// Failure reported by the cluster client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The apiserver answered with a failure status
    #[error("apiserver returned {code} ({reason}): {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Machine readable reason, e.g. `Expired`
        reason: String,
        /// Human readable description
        message: String,
    },

    /// The request or the stream failed below the API layer
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ClientError {
    /// Whether the apiserver reported that the requested version is no longer available
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, ClientError::Api { code: GONE, .. })
    }
}

/// One page returned by [`ObjectClient::list`]
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    /// Objects on this page
    pub items: Vec<ClusterObject>,
    /// Token for the next page; `None` or empty once the collection is exhausted
    pub continue_token: Option<String>,
    /// `metadata.resourceVersion` of the list response
    pub resource_version: Option<String>,
}

/// A single event received from a watch stream
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// Object was added
    Added(ClusterObject),
    /// Object was modified
    Modified(ClusterObject),
    /// Object was deleted
    Deleted(ClusterObject),
    /// Progress marker carrying only a newer `resourceVersion`
    Bookmark {
        /// The version the stream has progressed to
        resource_version: String,
    },
    /// The apiserver reported an error inside the stream
    Error(ClientError),
}

/// Stream of events from one watch request; ends when the server closes it
pub type EventStream = BoxStream<'static, Result<WatchEvent, ClientError>>;

/// The list and watch primitives consumed by the synchronization engine
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// List one page of `kind` across all namespaces
    async fn list(&self, kind: ResourceKind, params: &ListParams) -> Result<ListPage, ClientError>;

    /// Open a watch on `kind` starting after `resource_version`
    async fn watch(
        &self,
        kind: ResourceKind,
        params: &WatchParams,
        resource_version: &str,
    ) -> Result<EventStream, ClientError>;
}
