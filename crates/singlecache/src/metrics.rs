//! Lock-free coalescing counters.
//!
//! Recording is a relaxed atomic increment; snapshots are plain loads and are
//! not a consistent cut across counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counter {
    v: AtomicU64,
}

impl Counter {
    #[inline]
    fn inc(&self) {
        self.v.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn load(&self) -> u64 {
        self.v.load(Ordering::Relaxed)
    }

    #[inline]
    fn reset(&self) {
        self.v.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of a group's coalescing counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoalesceMetrics {
    /// Calls that executed the operation.
    pub originated: u64,
    /// Calls that attached to an in-flight execution.
    pub joined: u64,
    /// Originations that displaced an entry whose validity window had elapsed.
    pub expired_replacements: u64,
    /// `forget` calls that removed a registered entry.
    pub forgotten: u64,
    /// Completions that left the registry untouched because their entry had
    /// been forgotten or replaced.
    pub stale_completions: u64,
}

impl CoalesceMetrics {
    /// Fraction of calls that joined (0.0–1.0). Returns 0.0 before any call.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn join_rate(&self) -> f64 {
        let total = self.originated + self.joined;
        if total == 0 {
            0.0
        } else {
            self.joined as f64 / total as f64
        }
    }
}

#[derive(Debug)]
pub(crate) struct CoalesceCounters {
    enabled: bool,
    originated: Counter,
    joined: Counter,
    expired_replacements: Counter,
    forgotten: Counter,
    stale_completions: Counter,
}

impl CoalesceCounters {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            originated: Counter::default(),
            joined: Counter::default(),
            expired_replacements: Counter::default(),
            forgotten: Counter::default(),
            stale_completions: Counter::default(),
        }
    }

    #[inline]
    fn record(&self, counter: &Counter) {
        if self.enabled {
            counter.inc();
        }
    }

    pub(crate) fn record_originated(&self) {
        self.record(&self.originated);
    }

    pub(crate) fn record_joined(&self) {
        self.record(&self.joined);
    }

    pub(crate) fn record_expired_replacement(&self) {
        self.record(&self.expired_replacements);
    }

    pub(crate) fn record_forgotten(&self) {
        self.record(&self.forgotten);
    }

    pub(crate) fn record_stale_completion(&self) {
        self.record(&self.stale_completions);
    }

    pub(crate) fn snapshot(&self) -> CoalesceMetrics {
        CoalesceMetrics {
            originated: self.originated.load(),
            joined: self.joined.load(),
            expired_replacements: self.expired_replacements.load(),
            forgotten: self.forgotten.load(),
            stale_completions: self.stale_completions.load(),
        }
    }

    pub(crate) fn reset(&self) {
        self.originated.reset();
        self.joined.reset();
        self.expired_replacements.reset();
        self.forgotten.reset();
        self.stale_completions.reset();
    }
}
