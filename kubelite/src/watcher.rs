//! Per-kind watch loop with cursor tracking, reconnects and relists
//!
//! Each [`WatchLoop`] keeps the index entries of one [`ResourceKind`] in step
//! with the cluster. It is driven as a small state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Watching -> BackingOff -> Connecting -> ...
//!                                              |  ^
//!                         (cursor expired)     v  | (relist failed)
//!                                            Relisting -> Connecting
//! ```
//!
//! There is no terminal state; the loop only stops when its
//! [`CancellationToken`] is cancelled.
use std::sync::Arc;

use educe::Educe;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::{ClientError, EventStream, ObjectClient, WatchEvent, WatchParams},
    config::{Config, ListConfig},
    handler::Handlers,
    pager,
    resource::{ClusterObject, EventType, ResourceKind},
    utils::WatchBackoff,
};

/// Position of a watch in the change history of one kind
///
/// Holds either a `resourceVersion` observed for the kind, or nothing once the
/// server declared the position expired. An expired cursor can only be
/// replaced by a fresh listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor(Option<String>);

impl Cursor {
    /// Version meaning "start from the current state"
    pub const SENTINEL: &'static str = "0";

    /// Cursor at an observed `resourceVersion`
    #[must_use]
    pub fn new(resource_version: impl Into<String>) -> Self {
        Self(Some(resource_version.into()))
    }

    /// Cursor at the [`Cursor::SENTINEL`]
    #[must_use]
    pub fn from_current_state() -> Self {
        Self::new(Self::SENTINEL)
    }

    /// The version to resume from, `None` while expired
    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Whether the cursor can still be used to resume a watch
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0.is_some()
    }

    /// Move to a version carried by an applied event or a bookmark
    pub fn advance(&mut self, resource_version: &str) {
        self.0 = Some(resource_version.to_string());
    }

    /// Forget the position after the server reported it gone
    pub fn invalidate(&mut self) {
        self.0 = None;
    }
}

/// Coarse state of a [`WatchLoop`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Not started, or stopped by cancellation
    Disconnected,
    /// Opening a watch request
    Connecting,
    /// Receiving events
    Watching,
    /// Waiting before the next attempt
    BackingOff,
    /// Listing the whole kind after the cursor expired
    Relisting,
}

/// Snapshot published by a [`WatchLoop`] after every step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchStatus {
    /// Current phase
    pub phase: Phase,
    /// Current cursor, `None` while expired
    pub resource_version: Option<String>,
}

#[derive(Educe)]
#[educe(Debug)]
enum State {
    Disconnected,
    Connecting,
    Watching {
        #[educe(Debug(ignore))]
        stream: EventStream,
    },
    BackingOff,
    Relisting,
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Disconnected => Phase::Disconnected,
            State::Connecting => Phase::Connecting,
            State::Watching { .. } => Phase::Watching,
            State::BackingOff => Phase::BackingOff,
            State::Relisting => Phase::Relisting,
        }
    }
}

/// Keeps one kind of the index converged with the cluster
pub struct WatchLoop<C: ?Sized> {
    kind: ResourceKind,
    client: Arc<C>,
    handlers: Handlers,
    list: ListConfig,
    params: WatchParams,
    backoff: WatchBackoff,
    cursor: Cursor,
    status: watch::Sender<WatchStatus>,
}

impl<C: ObjectClient + ?Sized> WatchLoop<C> {
    /// A loop for `kind` that resumes watching from `cursor`
    pub fn new(kind: ResourceKind, client: Arc<C>, handlers: Handlers, config: &Config, cursor: Cursor) -> Self {
        let (status, _) = watch::channel(WatchStatus {
            phase: Phase::Disconnected,
            resource_version: cursor.resource_version().map(String::from),
        });
        Self {
            kind,
            client,
            handlers,
            list: config.list(),
            params: config.watch_params(),
            backoff: WatchBackoff::new(&config.backoff()),
            cursor,
            status,
        }
    }

    /// Follow the phase and cursor of this loop
    pub fn subscribe(&self) -> watch::Receiver<WatchStatus> {
        self.status.subscribe()
    }

    /// Current cursor
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Drive the loop until `token` is cancelled
    ///
    /// Every await point is raced against the token, so an in-flight watch,
    /// listing or backoff delay is dropped rather than waited out.
    pub async fn run(mut self, token: CancellationToken) {
        let kind = self.kind;
        let mut state = State::Disconnected;
        let mut phase = state.phase();
        loop {
            state = tokio::select! {
                biased;
                () = token.cancelled() => break,
                next = self.step(state) => next,
            };
            if state.phase() != phase {
                phase = state.phase();
                debug!(%kind, ?phase, resource_version = ?self.cursor.resource_version(), "watch state changed");
            }
            self.publish(phase);
        }
        debug!(%kind, "watch loop cancelled");
        self.publish(Phase::Disconnected);
    }

    fn publish(&self, phase: Phase) {
        self.status.send_replace(WatchStatus {
            phase,
            resource_version: self.cursor.resource_version().map(String::from),
        });
    }

    async fn step(&mut self, state: State) -> State {
        match state {
            State::Disconnected => self.after_disconnect(),
            State::Connecting => self.connect().await,
            State::Watching { mut stream } => match stream.next().await {
                Some(Ok(WatchEvent::Added(obj))) => self.dispatch(EventType::Added, &obj, stream),
                Some(Ok(WatchEvent::Modified(obj))) => self.dispatch(EventType::Modified, &obj, stream),
                Some(Ok(WatchEvent::Deleted(obj))) => self.dispatch(EventType::Deleted, &obj, stream),
                Some(Ok(WatchEvent::Bookmark { resource_version })) => {
                    self.backoff.reset();
                    self.cursor.advance(&resource_version);
                    State::Watching { stream }
                }
                Some(Ok(WatchEvent::Error(err)) | Err(err)) => self.fail("watch stream failed", &err),
                None => {
                    debug!(kind = %self.kind, "watch closed by server");
                    State::BackingOff
                }
            },
            State::BackingOff => {
                self.handlers.metrics().record_watch_restart(self.kind);
                let delay = self.backoff.next_delay();
                debug!(kind = %self.kind, ?delay, "backing off");
                tokio::time::sleep(delay).await;
                self.after_disconnect()
            }
            State::Relisting => self.relist().await,
        }
    }

    fn after_disconnect(&self) -> State {
        if self.cursor.is_valid() {
            State::Connecting
        } else {
            State::Relisting
        }
    }

    async fn connect(&mut self) -> State {
        let Some(resource_version) = self.cursor.resource_version().map(String::from) else {
            return State::Relisting;
        };
        match self.client.watch(self.kind, &self.params, &resource_version).await {
            Ok(stream) => {
                debug!(kind = %self.kind, %resource_version, "watch established");
                State::Watching { stream }
            }
            Err(err) => self.fail("failed to start watch", &err),
        }
    }

    /// Apply one object in stream order; the cursor only follows applied objects
    ///
    /// A delivered event restarts the backoff sequence; an accepted request
    /// alone does not.
    fn dispatch(&mut self, event: EventType, obj: &ClusterObject, stream: EventStream) -> State {
        self.backoff.reset();
        if self.handlers.apply(self.kind, event, obj) {
            if let Some(rv) = obj.resource_version() {
                self.cursor.advance(rv);
            }
        }
        State::Watching { stream }
    }

    fn fail(&mut self, what: &'static str, err: &ClientError) -> State {
        if err.is_gone() {
            warn!(kind = %self.kind, error = %err, "{what}, resourceVersion expired");
            self.cursor.invalidate();
        } else {
            warn!(kind = %self.kind, error = %err, "{what}");
        }
        State::BackingOff
    }

    async fn relist(&mut self) -> State {
        match pager::list_all(&*self.client, self.kind, &self.list).await {
            Ok(listing) => {
                self.handlers.replace(self.kind, &listing.items);
                self.handlers.metrics().record_relist(self.kind);
                info!(
                    kind = %self.kind,
                    objects = listing.items.len(),
                    resource_version = %listing.resource_version,
                    "relisted after expiry"
                );
                self.cursor = Cursor::new(listing.resource_version);
                State::Connecting
            }
            Err(err) => {
                warn!(kind = %self.kind, error = %err, "relist failed");
                State::BackingOff
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cursor, Phase, State, WatchLoop};
    use crate::{
        client::{ClientError, WatchEvent},
        config::{BackoffConfig, Config},
        handler::Handlers,
        index::Index,
        metrics::Metrics,
        resource::{ClusterObject, EventType, ResourceKind},
        test_utils::{gone, node, pod, pod_in_phase, FakeClient},
    };
    use std::{sync::Arc, time::Duration};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    const DELAY: Duration = Duration::from_secs(5);

    fn watch_loop(client: &Arc<FakeClient>, kind: ResourceKind, cursor: Cursor) -> (WatchLoop<FakeClient>, Index) {
        watch_loop_with(client, kind, cursor, &BackoffConfig::fixed(DELAY))
    }

    fn watch_loop_with(
        client: &Arc<FakeClient>,
        kind: ResourceKind,
        cursor: Cursor,
        backoff: &BackoffConfig,
    ) -> (WatchLoop<FakeClient>, Index) {
        let index = Index::new();
        let handlers = Handlers::new(index.clone(), Arc::new(Metrics::new()));
        let config = Config::builder().backoff(backoff).finish().unwrap();
        (WatchLoop::new(kind, client.clone(), handlers, &config, cursor), index)
    }

    fn doubling() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: false,
            reset_after: Duration::from_secs(600),
        }
    }

    /// Walk one accepted watch through to its next connect attempt, returning the delay waited
    async fn reconnect_delay(wl: &mut WatchLoop<FakeClient>) -> Duration {
        let mut state = wl.step(State::Connecting).await;
        while state.phase() == Phase::Watching {
            state = wl.step(state).await;
        }
        assert_eq!(state.phase(), Phase::BackingOff);
        let started = Instant::now();
        assert_eq!(wl.step(state).await.phase(), Phase::Connecting);
        started.elapsed()
    }

    #[test]
    fn cursor_expiry() {
        let mut cursor = Cursor::from_current_state();
        assert_eq!(cursor.resource_version(), Some("0"));
        cursor.advance("12");
        assert_eq!(cursor, Cursor::new("12"));
        cursor.invalidate();
        assert!(!cursor.is_valid());
        assert_eq!(cursor.resource_version(), None);
    }

    #[tokio::test]
    async fn disconnected_needs_a_valid_cursor_to_connect() {
        let client = Arc::new(FakeClient::new());
        let (mut wl, _) = watch_loop(&client, ResourceKind::Pod, Cursor::new("5"));
        assert!(matches!(wl.step(State::Disconnected).await, State::Connecting));
        wl.cursor.invalidate();
        assert!(matches!(wl.step(State::Disconnected).await, State::Relisting));
    }

    #[tokio::test]
    async fn connecting_resumes_at_the_cursor() {
        let client = Arc::new(FakeClient::new());
        let _tx = client.push_watch(ResourceKind::Node);
        let (mut wl, _) = watch_loop(&client, ResourceKind::Node, Cursor::new("42"));
        assert_eq!(wl.step(State::Connecting).await.phase(), Phase::Watching);
        assert_eq!(client.watch_calls(ResourceKind::Node), ["42"]);
    }

    #[tokio::test]
    async fn connect_failures_back_off() {
        let client = Arc::new(FakeClient::new());
        client.push_watch_err(ResourceKind::Pod, ClientError::Transport("refused".into()));
        client.push_watch_err(ResourceKind::Pod, gone());
        let (mut wl, _) = watch_loop(&client, ResourceKind::Pod, Cursor::new("7"));

        assert_eq!(wl.step(State::Connecting).await.phase(), Phase::BackingOff);
        assert_eq!(wl.cursor(), &Cursor::new("7"));
        assert_eq!(wl.step(State::Connecting).await.phase(), Phase::BackingOff);
        assert!(!wl.cursor().is_valid());
    }

    #[tokio::test]
    async fn events_advance_the_cursor_in_order() {
        let client = Arc::new(FakeClient::new());
        let tx = client.push_watch(ResourceKind::Pod);
        let (mut wl, index) = watch_loop(&client, ResourceKind::Pod, Cursor::new("1"));
        let mut state = wl.step(State::Connecting).await;

        tx.unbounded_send(Ok(WatchEvent::Added(pod("ns", "a", Some("10.0.0.1"), "2").into())))
            .unwrap();
        tx.unbounded_send(Ok(WatchEvent::Bookmark {
            resource_version: "3".into(),
        }))
        .unwrap();
        tx.unbounded_send(Ok(WatchEvent::Modified(
            pod_in_phase("ns", "a", "10.0.0.1", "Failed", "4").into(),
        )))
        .unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            state = wl.step(state).await;
            assert_eq!(state.phase(), Phase::Watching);
            seen.push(wl.cursor().resource_version().unwrap().to_string());
        }
        assert_eq!(seen, ["2", "3", "4"]);
        assert_eq!(index.get_pod("10.0.0.1").unwrap().phase.as_deref(), Some("Failed"));
    }

    #[tokio::test]
    async fn mismatched_objects_do_not_move_the_cursor() {
        let client = Arc::new(FakeClient::new());
        let tx = client.push_watch(ResourceKind::Pod);
        let (mut wl, index) = watch_loop(&client, ResourceKind::Pod, Cursor::new("1"));
        let state = wl.step(State::Connecting).await;
        tx.unbounded_send(Ok(WatchEvent::Added(node("n", &[], "99").into())))
            .unwrap();
        assert_eq!(wl.step(state).await.phase(), Phase::Watching);
        assert_eq!(wl.cursor(), &Cursor::new("1"));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn error_events_back_off_and_gone_expires_the_cursor() {
        let client = Arc::new(FakeClient::new());
        let tx = client.push_watch(ResourceKind::Service);
        let (mut wl, _) = watch_loop(&client, ResourceKind::Service, Cursor::new("1"));
        let state = wl.step(State::Connecting).await;
        tx.unbounded_send(Ok(WatchEvent::Error(gone()))).unwrap();
        assert_eq!(wl.step(state).await.phase(), Phase::BackingOff);
        assert!(!wl.cursor().is_valid());

        let tx = client.push_watch(ResourceKind::Service);
        wl.cursor = Cursor::new("5");
        let state = wl.step(State::Connecting).await;
        tx.unbounded_send(Err(ClientError::Transport("eof".into()))).unwrap();
        assert_eq!(wl.step(state).await.phase(), Phase::BackingOff);
        assert_eq!(wl.cursor(), &Cursor::new("5"));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_reconnects_with_held_cursor_after_delay() {
        let client = Arc::new(FakeClient::new());
        let tx = client.push_watch(ResourceKind::Pod);
        let (mut wl, _) = watch_loop(&client, ResourceKind::Pod, Cursor::new("1"));
        let state = wl.step(State::Connecting).await;
        tx.unbounded_send(Ok(WatchEvent::Added(pod("ns", "a", Some("10.0.0.1"), "8").into())))
            .unwrap();
        drop(tx);
        let state = wl.step(state).await;
        let state = wl.step(state).await;
        assert_eq!(state.phase(), Phase::BackingOff);

        let started = Instant::now();
        let state = wl.step(state).await;
        assert_eq!(state.phase(), Phase::Connecting);
        let waited = started.elapsed();
        assert!(waited >= DELAY && waited < DELAY + Duration::from_secs(1), "waited {waited:?}");
        assert_eq!(wl.handlers.metrics().watch_restarts(ResourceKind::Pod), 1);

        wl.step(state).await;
        assert_eq!(client.watch_calls(ResourceKind::Pod), ["1", "8"]);
    }

    #[tokio::test(start_paused = true)]
    async fn watches_closing_without_events_keep_growing_the_delay() {
        let client = Arc::new(FakeClient::new());
        for _ in 0..5 {
            drop(client.push_watch(ResourceKind::Pod));
        }
        let (mut wl, _) = watch_loop_with(&client, ResourceKind::Pod, Cursor::new("1"), &doubling());
        let mut delays = Vec::new();
        for _ in 0..5 {
            delays.push(reconnect_delay(&mut wl).await.as_secs());
        }
        assert_eq!(delays, [1, 2, 4, 8, 16]);
        assert_eq!(client.watch_calls(ResourceKind::Pod).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn a_delivered_event_restarts_the_delay_sequence() {
        let client = Arc::new(FakeClient::new());
        drop(client.push_watch(ResourceKind::Pod));
        drop(client.push_watch(ResourceKind::Pod));
        let healthy = client.push_watch(ResourceKind::Pod);
        healthy
            .unbounded_send(Ok(WatchEvent::Added(pod("ns", "a", Some("10.0.0.1"), "2").into())))
            .unwrap();
        drop(healthy);
        let (mut wl, _) = watch_loop_with(&client, ResourceKind::Pod, Cursor::new("1"), &doubling());

        assert_eq!(reconnect_delay(&mut wl).await.as_secs(), 1);
        assert_eq!(reconnect_delay(&mut wl).await.as_secs(), 2);
        assert_eq!(reconnect_delay(&mut wl).await.as_secs(), 1);
        assert_eq!(client.watch_calls(ResourceKind::Pod), ["1", "1", "1"]);
        assert_eq!(wl.cursor(), &Cursor::new("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_spaces_out_flapping_watches() {
        let client = Arc::new(FakeClient::new());
        for _ in 0..4 {
            drop(client.push_watch(ResourceKind::Node));
        }
        let (wl, _) = watch_loop_with(&client, ResourceKind::Node, Cursor::new("1"), &doubling());
        let mut status = wl.subscribe();
        let token = CancellationToken::new();
        let started = Instant::now();
        let task = tokio::spawn(wl.run(token.clone()));

        // the fifth watch never closes
        status
            .wait_for(|s| s.phase == Phase::Watching && client.watch_calls(ResourceKind::Node).len() == 5)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1 + 2 + 4 + 8));
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn backing_off_with_expired_cursor_relists() {
        let client = Arc::new(FakeClient::new());
        let (mut wl, _) = watch_loop(&client, ResourceKind::Node, Cursor::new("1"));
        wl.cursor.invalidate();
        assert_eq!(wl.step(State::BackingOff).await.phase(), Phase::Relisting);
    }

    #[tokio::test]
    async fn relist_replaces_the_kind_and_resets_the_cursor() {
        let client = Arc::new(FakeClient::new());
        let (mut wl, index) = watch_loop(&client, ResourceKind::Pod, Cursor::new("1"));
        wl.handlers.apply(
            ResourceKind::Pod,
            EventType::Sync,
            &ClusterObject::from(pod("ns", "gone", Some("10.0.0.9"), "1")),
        );
        client.serve_collection(ResourceKind::Pod, vec![ClusterObject::from(pod("ns", "a", Some("10.0.0.1"), "50"))], "60");
        wl.cursor.invalidate();

        assert_eq!(wl.step(State::Relisting).await.phase(), Phase::Connecting);
        assert_eq!(wl.cursor(), &Cursor::new("60"));
        assert_eq!(index.pod_ips(), ["10.0.0.1"]);
        assert_eq!(wl.handlers.metrics().relists(ResourceKind::Pod), 1);
    }

    #[tokio::test]
    async fn failed_relist_keeps_relisting() {
        let client = Arc::new(FakeClient::new());
        client.push_list(ResourceKind::Endpoints, Err(ClientError::Transport("refused".into())));
        let (mut wl, _) = watch_loop(&client, ResourceKind::Endpoints, Cursor::new("1"));
        wl.cursor.invalidate();
        assert_eq!(wl.step(State::Relisting).await.phase(), Phase::BackingOff);
        assert!(!wl.cursor().is_valid());
    }

    #[tokio::test]
    async fn cancellation_stops_a_blocked_watch() {
        let client = Arc::new(FakeClient::new());
        let (wl, _) = watch_loop(&client, ResourceKind::Node, Cursor::new("1"));
        let mut status = wl.subscribe();
        let token = CancellationToken::new();
        let task = tokio::spawn(wl.run(token.clone()));

        status
            .wait_for(|s| s.phase == Phase::Watching)
            .await
            .unwrap();
        token.cancel();
        task.await.unwrap();
        assert_eq!(status.borrow().phase, Phase::Disconnected);
    }
}
