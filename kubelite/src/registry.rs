//! Entry point tying the client, index and watch loops together
use std::{collections::BTreeMap, sync::Arc};

use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{KubeClient, ObjectClient},
    config::Config,
    error::Result,
    handler::Handlers,
    index::Index,
    metrics::Metrics,
    resource::ResourceKind,
    sync::{Baseline, Synchronizer},
    watcher::{WatchLoop, WatchStatus},
};

/// Mirrors cluster topology into an [`Index`]
///
/// Usage is always [`Registry::sync`] first, then [`Registry::start`] with the
/// returned [`Baseline`]:
///
/// ```no_run
/// use kubelite::{Config, Registry};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
/// let client = kube::Client::try_default().await?;
/// let registry = Registry::from_client(client, Config::default());
/// let token = CancellationToken::new();
/// let baseline = registry.sync(&token).await?;
/// let watches = registry.start(baseline, token);
///
/// let index = registry.index().clone();
/// println!("{:?}", index.get_pod("10.0.0.1"));
/// watches.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Registry<C: ?Sized> {
    client: Arc<C>,
    handlers: Handlers,
    config: Config,
}

impl Registry<KubeClient> {
    /// Registry over a connected [`kube::Client`]
    #[must_use]
    pub fn from_client(client: kube::Client, config: Config) -> Self {
        Self::new(Arc::new(KubeClient::new(client)), config)
    }
}

impl<C: ObjectClient + ?Sized + 'static> Registry<C> {
    /// Registry with a fresh, empty index
    pub fn new(client: Arc<C>, config: Config) -> Self {
        let handlers = Handlers::new(Index::new(), Arc::new(Metrics::new()))
            .prune_on_delete(config.prune_on_delete());
        Self {
            client,
            handlers,
            config,
        }
    }

    /// The index fed by this registry
    ///
    /// Readable at any time; before [`Registry::sync`] completes it only holds
    /// the kinds listed so far.
    #[must_use]
    pub fn index(&self) -> &Index {
        self.handlers.index()
    }

    /// Counters shared by bootstrap and all watch loops
    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        self.handlers.metrics()
    }

    /// Populate the index with a full listing of every kind
    ///
    /// # Errors
    ///
    /// See [`Synchronizer::sync`]; any error is meant to be fatal.
    pub async fn sync(&self, token: &CancellationToken) -> Result<Baseline> {
        Synchronizer::new(self.client.clone(), self.handlers.clone(), self.config.list())
            .sync(token)
            .await
    }

    /// Spawn one watch loop per kind, each resuming from `baseline`
    ///
    /// Must be called within a tokio runtime. The loops run until `token` (or
    /// [`WatchSet::shutdown`]) cancels them.
    pub fn start(&self, baseline: Baseline, token: CancellationToken) -> WatchSet {
        let mut tasks = JoinSet::new();
        let mut statuses = BTreeMap::new();
        for kind in ResourceKind::ALL {
            let watch_loop = WatchLoop::new(
                kind,
                self.client.clone(),
                self.handlers.clone(),
                &self.config,
                baseline.cursor(kind),
            );
            statuses.insert(kind, watch_loop.subscribe());
            debug!(%kind, resource_version = ?baseline.resource_version(kind), "starting watch");
            tasks.spawn(watch_loop.run(token.child_token()));
        }
        WatchSet {
            tasks,
            token,
            statuses,
        }
    }
}

/// Handle to the running watch loops
pub struct WatchSet {
    tasks: JoinSet<()>,
    token: CancellationToken,
    statuses: BTreeMap<ResourceKind, watch::Receiver<WatchStatus>>,
}

impl WatchSet {
    /// Latest status published by the loop of `kind`
    #[must_use]
    pub fn status(&self, kind: ResourceKind) -> Option<WatchStatus> {
        self.statuses.get(&kind).map(|rx| rx.borrow().clone())
    }

    /// Follow the status of the loop of `kind`
    #[must_use]
    pub fn subscribe(&self, kind: ResourceKind) -> Option<watch::Receiver<WatchStatus>> {
        self.statuses.get(&kind).cloned()
    }

    /// Cancel every loop and wait for all of them to stop
    pub async fn shutdown(self) {
        self.token.cancel();
        self.join().await;
    }

    /// Wait for every loop to stop
    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(err) = res {
                warn!(error = %err, "watch task failed");
            }
        }
    }
}
