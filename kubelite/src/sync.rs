//! One-shot listing of every kind before any watch starts
use std::{collections::BTreeMap, sync::Arc};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    client::ObjectClient,
    config::ListConfig,
    error::{Error, Result},
    handler::Handlers,
    pager,
    resource::{EventType, ResourceKind},
    watcher::Cursor,
};

/// Result of a completed bootstrap: where each kind's watch resumes from
///
/// Only [`Synchronizer::sync`] produces one, so watch loops cannot be started
/// before the index has been fully populated once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Baseline {
    cursors: BTreeMap<ResourceKind, String>,
}

impl Baseline {
    /// `resourceVersion` of the final listing page of `kind`
    #[must_use]
    pub fn resource_version(&self, kind: ResourceKind) -> Option<&str> {
        self.cursors.get(&kind).map(String::as_str)
    }

    /// The initial watch cursor of `kind`
    pub(crate) fn cursor(&self, kind: ResourceKind) -> Cursor {
        self.cursors
            .get(&kind)
            .map_or_else(Cursor::from_current_state, |rv| Cursor::new(rv.clone()))
    }
}

/// Lists every tracked kind and feeds the results to the handlers
pub struct Synchronizer<C: ?Sized> {
    client: Arc<C>,
    handlers: Handlers,
    list: ListConfig,
}

impl<C: ObjectClient + ?Sized> Synchronizer<C> {
    /// Synchronizer writing through `handlers`
    pub fn new(client: Arc<C>, handlers: Handlers, list: ListConfig) -> Self {
        Self {
            client,
            handlers,
            list,
        }
    }

    /// List Node, Pod, Service and Endpoints in that order
    ///
    /// Every listed object is applied with [`EventType::Sync`]. The index is
    /// readable throughout, so queries made meanwhile see a partial view.
    ///
    /// # Errors
    ///
    /// The first failed listing stops the bootstrap with [`Error::Bootstrap`];
    /// kinds listed before it stay applied. Cancelling `token` drops the
    /// in-flight request and returns [`Error::Cancelled`].
    pub async fn sync(&self, token: &CancellationToken) -> Result<Baseline> {
        let started = Instant::now();
        let mut cursors = BTreeMap::new();
        for kind in ResourceKind::ALL {
            let listed = tokio::select! {
                biased;
                () = token.cancelled() => return Err(Error::Cancelled),
                listed = pager::list_all(&*self.client, kind, &self.list) => listed,
            };
            let listing = listed.map_err(|source| Error::Bootstrap {
                kind,
                source: Box::new(source),
            })?;
            for obj in &listing.items {
                self.handlers.apply(kind, EventType::Sync, obj);
            }
            info!(
                %kind,
                objects = listing.items.len(),
                pages = listing.pages,
                resource_version = %listing.resource_version,
                "initial sync"
            );
            cursors.insert(kind, listing.resource_version);
        }
        info!(elapsed = ?started.elapsed(), "initial sync complete");
        Ok(Baseline { cursors })
    }
}
