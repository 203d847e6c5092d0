//! Per-domain operation counters and run results.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use super::DOMAINS;

/// Pads and aligns a value to a cache line, so counters written by
/// different sockets never share a line.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Creates a new cache-padded value.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Consumes the wrapper and returns the inner value.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// Aggregate counters for one run.
///
/// Each worker adds its total exactly once, after its deadline, so the
/// atomics see one write per worker and no contention in the hot loop.
#[derive(Debug, Default)]
pub struct NodeCounters {
    ops: [CachePadded<AtomicU64>; DOMAINS],
    failed: CachePadded<AtomicUsize>,
}

impl NodeCounters {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a finished worker's operations to `domain`.
    ///
    /// # Panics
    ///
    /// Panics if `domain` is not 0 or 1.
    pub fn record(&self, domain: usize, ops: u64) {
        self.ops[domain].fetch_add(ops, Ordering::Relaxed);
    }

    /// Count a worker that did not complete.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the counters.
    ///
    /// Only meaningful after every worker has joined.
    #[must_use]
    pub fn result(&self) -> RunResult {
        RunResult::new(
            self.ops[0].load(Ordering::Acquire),
            self.ops[1].load(Ordering::Acquire),
            self.failed.load(Ordering::Acquire),
        )
    }
}

/// Outcome of one run, or the average of several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunResult {
    /// Operations completed by domain 0 workers
    pub ops_node0: u64,
    /// Operations completed by domain 1 workers
    pub ops_node1: u64,
    /// Always `ops_node0 + ops_node1`
    pub ops_total: u64,
    /// Workers that failed and were left out of the counts
    pub workers_failed: usize,
}

impl RunResult {
    /// Result from per-domain counts; the total is derived.
    #[must_use]
    pub fn new(ops_node0: u64, ops_node1: u64, workers_failed: usize) -> Self {
        Self {
            ops_node0,
            ops_node1,
            ops_total: ops_node0.saturating_add(ops_node1),
            workers_failed,
        }
    }

    /// True if some workers did not contribute.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.workers_failed > 0
    }

    /// Integer mean of `runs`, field by field.
    ///
    /// The total is recomputed from the averaged node counts so that
    /// `ops_total == ops_node0 + ops_node1` still holds. `workers_failed`
    /// is the sum over all runs. An empty slice averages to zero.
    #[must_use]
    pub fn average(runs: &[RunResult]) -> Self {
        let Ok(n) = u64::try_from(runs.len()) else {
            return Self::default();
        };
        if n == 0 {
            return Self::default();
        }
        let sum0: u128 = runs.iter().map(|r| u128::from(r.ops_node0)).sum();
        let sum1: u128 = runs.iter().map(|r| u128::from(r.ops_node1)).sum();
        let mean = |sum: u128| u64::try_from(sum / u128::from(n)).unwrap_or(u64::MAX);
        Self::new(
            mean(sum0),
            mean(sum1),
            runs.iter().map(|r| r.workers_failed).sum(),
        )
    }
}
