//! Optional atomic instrumentation for a [`crate::Pipe`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated by `push`/`pop`/resize when metrics are enabled.
///
/// Internal to [`crate::pipe`]; consumers read a point-in-time [`MetricsSnapshot`]
/// via [`crate::Pipe::metrics`].
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    enabled: bool,
    items_pushed: AtomicU64,
    items_popped: AtomicU64,
    pushes: AtomicU64,
    pops: AtomicU64,
    grows: AtomicU64,
    shrinks: AtomicU64,
}

impl Metrics {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled, ..Self::default() }
    }

    pub(crate) fn record_push(&self, n: usize) {
        if !self.enabled {
            return;
        }
        self.pushes.fetch_add(1, Ordering::Relaxed);
        self.items_pushed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_pop(&self, n: usize) {
        if !self.enabled {
            return;
        }
        self.pops.fetch_add(1, Ordering::Relaxed);
        self.items_popped.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_grow(&self) {
        if !self.enabled {
            return;
        }
        self.grows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shrink(&self) {
        if !self.enabled {
            return;
        }
        self.shrinks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_pushed: self.items_pushed.load(Ordering::Relaxed),
            items_popped: self.items_popped.load(Ordering::Relaxed),
            pushes: self.pushes.load(Ordering::Relaxed),
            pops: self.pops.load(Ordering::Relaxed),
            grows: self.grows.load(Ordering::Relaxed),
            shrinks: self.shrinks.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of a pipe's push/pop/resize counters.
///
/// `items_pushed - items_popped` should always equal the pipe's current
/// length (the conservation property), modulo a push or pop racing the
/// snapshot itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Total elements successfully pushed.
    pub items_pushed: u64,
    /// Total elements successfully popped.
    pub items_popped: u64,
    /// Total `push` calls.
    pub pushes: u64,
    /// Total `pop`/`pop_eager` calls.
    pub pops: u64,
    /// Total buffer growths.
    pub grows: u64,
    /// Total buffer shrinks.
    pub shrinks: u64,
}
