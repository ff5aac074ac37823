//! Topology index of a Kubernetes cluster, kept in sync by list-then-watch
//!
//! `kubelite` mirrors the nodes, pods, services and endpoints of one cluster
//! into an in-memory [`Index`] that service discovery can query without
//! talking to the apiserver.
//!
//! Synchronization happens in two stages:
//!
//! 1. [`Registry::sync`] lists every kind once, following pagination, and
//!    returns a [`Baseline`] with the `resourceVersion` each listing ended at.
//! 2. [`Registry::start`] spawns one [`WatchLoop`](watcher::WatchLoop) per kind
//!    that watches from the baseline, reconnects with backoff when the stream
//!    ends or fails, and relists the kind when its cursor expires.
//!
//! The index is eventually consistent with the cluster: every kind converges
//! on its own and readers may observe any interleaving of their updates.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod index;
pub mod metrics;
pub mod pager;
pub mod registry;
pub mod resource;
pub mod sync;
pub mod utils;
pub mod watcher;

pub use client::{KubeClient, ObjectClient};
pub use config::{BackoffConfig, Config, ConfigBuilder};
pub use error::{Error, Result};
pub use handler::Handlers;
pub use index::{EndpointsRecord, Index, NodeRecord, ObjectKey, PodRecord, ServiceRecord};
pub use metrics::Metrics;
pub use registry::{Registry, WatchSet};
pub use resource::{ClusterObject, EventType, ResourceKind};
pub use sync::Baseline;

#[cfg(test)]
mod test_utils;
