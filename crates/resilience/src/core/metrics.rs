//! Lock-free outcome counters owned by each pattern

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Outcome counters for a single pattern instance.
///
/// Readers may snapshot concurrently; only the owning pattern writes, which
/// is why the recording methods are crate-private.
#[derive(Debug, Default)]
pub struct PatternCounters {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl PatternCounters {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_call(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`PatternCounters`] at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Calls seen by the pattern
    pub total: u64,
    /// Calls that completed successfully
    pub successes: u64,
    /// Calls that completed with an error
    pub failures: u64,
    /// Calls refused without running the operation
    pub rejections: u64,
}

impl CounterSnapshot {
    /// Fraction of completed calls that failed, 0.0 when nothing completed
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let completed = self.successes + self.failures;
        if completed == 0 {
            0.0
        } else {
            self.failures as f64 / completed as f64
        }
    }
}
