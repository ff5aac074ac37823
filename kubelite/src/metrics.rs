//! Counters exposed by the synchronization engine
use std::sync::atomic::{AtomicU64, Ordering};

use crate::resource::ResourceKind;

#[derive(Default, Debug)]
struct KindCounters {
    applied: AtomicU64,
    watch_restarts: AtomicU64,
    relists: AtomicU64,
}

/// All metrics
///
/// Shared between the synchronizer and every watch loop behind an `Arc`; all
/// counters are monotonic.
#[derive(Debug)]
pub struct Metrics {
    /// kubelite build info
    pub build_info: String,
    kinds: [KindCounters; 4],
    decode_mismatches: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            build_info: env!("CARGO_PKG_VERSION").to_string(),
            kinds: Default::default(),
            decode_mismatches: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    /// Fresh set of zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_applied(&self, kind: ResourceKind) {
        self.kinds[kind.slot()].applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_watch_restart(&self, kind: ResourceKind) {
        self.kinds[kind.slot()].watch_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relist(&self, kind: ResourceKind) {
        self.kinds[kind.slot()].relists.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_mismatch(&self) {
        self.decode_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Events (sync or watch) handed to the handler of `kind`
    #[must_use]
    pub fn applied(&self, kind: ResourceKind) -> u64 {
        self.kinds[kind.slot()].applied.load(Ordering::Relaxed)
    }

    /// Times the watch loop of `kind` went into backoff
    #[must_use]
    pub fn watch_restarts(&self, kind: ResourceKind) -> u64 {
        self.kinds[kind.slot()].watch_restarts.load(Ordering::Relaxed)
    }

    /// Full relists of `kind` forced by an expired cursor
    #[must_use]
    pub fn relists(&self, kind: ResourceKind) -> u64 {
        self.kinds[kind.slot()].relists.load(Ordering::Relaxed)
    }

    /// Objects dropped because they did not decode as the kind of their stream
    #[must_use]
    pub fn decode_mismatches(&self) -> u64 {
        self.decode_mismatches.load(Ordering::Relaxed)
    }
}
