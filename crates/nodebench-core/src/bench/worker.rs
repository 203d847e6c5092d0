//! Benchmark worker and start gate.

use std::fmt;
use std::time::{Duration, Instant};

use fastrand::Rng;
use parking_lot::{Condvar, Mutex};

use super::{NodeCounters, DOMAINS};
use crate::affinity::{AffinityBinder, AffinityError};
use crate::numa::{CpuSet, NumaNodeId, SysfsTopology, TopologySource};
use crate::pool::PerNodePool;
use crate::workload::{Workload, WorkloadParams};

/// Per-worker settings, fixed for the worker's lifetime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Global worker index, also used for the thread name and RNG seed
    pub thread_id: usize,
    /// Domain (0 or 1): local pool and result counter
    pub domain: usize,
    /// Node to pin to, or `None` to leave scheduling to the OS
    pub bind_node: Option<NumaNodeId>,
    /// Length of the timed loop
    pub duration: Duration,
    /// Instances per pool; must be non-zero
    pub pool_size: usize,
    /// Percent of operations sent to the other domain's pool
    pub crossover_percent: u8,
    /// Key range for keyed workloads
    pub keyspace: u64,
    /// Base seed; the worker adds its `thread_id`
    pub seed: u64,
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    /// Configured, thread not started
    Created,
    /// Pinned (or placement left to the OS)
    Bound,
    /// In the timed loop
    Running,
    /// Deadline passed, publishing counts
    Reporting,
    /// Thread joined by the orchestrator
    Joined,
}

impl WorkerState {
    /// Lowercase state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Bound => "bound",
            Self::Running => "running",
            Self::Reporting => "reporting",
            Self::Joined => "joined",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a completed worker did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Worker index
    pub thread_id: usize,
    /// Domain the worker counted into
    pub domain: usize,
    /// CPUs the worker was pinned to, if it was pinned
    pub cpus: Option<CpuSet>,
    /// Operations completed
    pub ops: u64,
    /// Operations on the worker's own domain pool
    pub local_ops: u64,
    /// Operations redirected to the other domain's pool
    pub remote_ops: u64,
    /// Attempts the container rejected, not included in `ops`
    pub failed_ops: u64,
    /// Time spent in the loop
    pub elapsed: Duration,
}

/// Why a worker did not complete.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Pinning failed before the loop started
    #[error("worker {thread_id} could not bind to node {node}: {source}")]
    Bind {
        /// Worker index
        thread_id: usize,
        /// Requested node
        node: NumaNodeId,
        /// Underlying error
        #[source]
        source: AffinityError,
    },

    /// The start gate was aborted before the run began
    #[error("worker {thread_id} was released without starting")]
    Aborted {
        /// Worker index
        thread_id: usize,
    },

    /// The worker thread panicked
    #[error("worker {thread_id} panicked")]
    Panicked {
        /// Worker index
        thread_id: usize,
    },
}

impl WorkerError {
    /// Index of the failed worker.
    #[must_use]
    pub fn thread_id(&self) -> usize {
        match self {
            Self::Bind { thread_id, .. }
            | Self::Aborted { thread_id }
            | Self::Panicked { thread_id } => *thread_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatePhase {
    Closed,
    Open,
    Aborted,
}

#[derive(Debug)]
struct GateState {
    arrived: usize,
    phase: GatePhase,
}

/// One-shot barrier that releases every worker at once.
///
/// Workers [`arrive`](Self::arrive) and block. The orchestrator waits for
/// the expected number of arrivals, then [`open`](Self::open)s the gate, or
/// [`abort`](Self::abort)s it if the run cannot start.
#[derive(Debug)]
pub struct StartGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartGate {
    /// A closed gate with no arrivals.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                arrived: 0,
                phase: GatePhase::Closed,
            }),
            cond: Condvar::new(),
        }
    }

    /// Register arrival and block until the gate opens or aborts.
    ///
    /// Returns `true` if the gate opened.
    pub fn arrive(&self) -> bool {
        let mut state = self.state.lock();
        state.arrived += 1;
        self.cond.notify_all();
        while state.phase == GatePhase::Closed {
            self.cond.wait(&mut state);
        }
        state.phase == GatePhase::Open
    }

    /// Block until `expected` workers have arrived, or the gate is no
    /// longer closed.
    pub fn wait_ready(&self, expected: usize) {
        let mut state = self.state.lock();
        while state.arrived < expected && state.phase == GatePhase::Closed {
            self.cond.wait(&mut state);
        }
    }

    /// Release every waiting and future arrival.
    pub fn open(&self) {
        self.set_phase(GatePhase::Open);
    }

    /// Release every waiting and future arrival without starting the run.
    pub fn abort(&self) {
        self.set_phase(GatePhase::Aborted);
    }

    /// Workers that have arrived so far.
    #[must_use]
    pub fn arrived(&self) -> usize {
        self.state.lock().arrived
    }

    fn set_phase(&self, phase: GatePhase) {
        let mut state = self.state.lock();
        if state.phase == GatePhase::Closed {
            state.phase = phase;
        }
        self.cond.notify_all();
    }
}

/// One benchmark thread's work.
///
/// Built by the orchestrator and moved into the thread, where
/// [`run`](Self::run) pins, waits at the gate, runs the timed loop and
/// publishes its count.
pub struct BenchmarkWorker<'r, 'a, W, S = SysfsTopology> {
    config: WorkerConfig,
    state: WorkerState,
    pools: &'r [PerNodePool<'a, W>; DOMAINS],
    binder: Option<AffinityBinder<'r, S>>,
    gate: &'r StartGate,
    counters: &'r NodeCounters,
}

impl<'r, 'a, W, S> BenchmarkWorker<'r, 'a, W, S>
where
    W: Workload<'a>,
    S: TopologySource,
{
    /// Worker over both domain pools.
    ///
    /// `binder` is used only when `config.bind_node` is set.
    #[must_use]
    pub fn new(
        config: WorkerConfig,
        pools: &'r [PerNodePool<'a, W>; DOMAINS],
        binder: Option<AffinityBinder<'r, S>>,
        gate: &'r StartGate,
        counters: &'r NodeCounters,
    ) -> Self {
        Self {
            config,
            state: WorkerState::Created,
            pools,
            binder,
            gate,
            counters,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Settings this worker runs with.
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the worker to completion on the calling thread.
    ///
    /// The worker always arrives at the gate, even when pinning failed, so
    /// the other workers are never left waiting.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Bind`] if pinning failed and
    /// [`WorkerError::Aborted`] if the gate was aborted. No operations are
    /// counted in either case.
    ///
    /// A container operation that fails inside the loop, such as an
    /// exhausted arena, does not stop the worker. It is tallied in
    /// [`WorkerReport::failed_ops`] and the loop carries on.
    pub fn run(mut self) -> Result<WorkerReport, WorkerError> {
        let bound = self.bind();
        if bound.is_ok() {
            self.advance(WorkerState::Bound);
        }

        if !self.gate.arrive() {
            return Err(WorkerError::Aborted {
                thread_id: self.config.thread_id,
            });
        }
        let cpus = bound?;

        self.advance(WorkerState::Running);
        let mut report = self.run_loop();
        report.cpus = cpus;

        self.advance(WorkerState::Reporting);
        self.counters.record(self.config.domain, report.ops);
        Ok(report)
    }

    fn bind(&self) -> Result<Option<CpuSet>, WorkerError> {
        let (Some(node), Some(binder)) = (self.config.bind_node, self.binder) else {
            return Ok(None);
        };
        binder
            .bind_current(node)
            .map(Some)
            .map_err(|source| WorkerError::Bind {
                thread_id: self.config.thread_id,
                node,
                source,
            })
    }

    fn run_loop(&self) -> WorkerReport {
        let config = &self.config;
        let params = WorkloadParams {
            keyspace: config.keyspace,
        };
        let mut rng = Rng::with_seed(config.seed.wrapping_add(config.thread_id as u64));
        let crossover = u32::from(config.crossover_percent);
        let local = config.domain;
        let remote = DOMAINS - 1 - local;

        let mut local_ops = 0u64;
        let mut remote_ops = 0u64;
        let mut failed_ops = 0u64;
        let start = Instant::now();
        let deadline = start + config.duration;

        while Instant::now() < deadline {
            let index = rng.usize(..config.pool_size);
            let op = W::pick_op(rng.u32(1..=100), &mut rng, &params);
            let is_remote = rng.u32(1..=100) <= crossover;

            let pool = &self.pools[if is_remote { remote } else { local }];
            match pool.with_instance(index, |instance| instance.apply(op)) {
                Ok(()) if is_remote => remote_ops += 1,
                Ok(()) => local_ops += 1,
                Err(err) => {
                    if failed_ops == 0 {
                        tracing::warn!(
                            thread_id = config.thread_id,
                            node = %pool.node(),
                            error = %err,
                            "container operation failed, continuing"
                        );
                    }
                    failed_ops += 1;
                }
            }
        }

        WorkerReport {
            thread_id: config.thread_id,
            domain: config.domain,
            cpus: None,
            ops: local_ops + remote_ops,
            local_ops,
            remote_ops,
            failed_ops,
            elapsed: start.elapsed(),
        }
    }

    fn advance(&mut self, next: WorkerState) {
        debug_assert!(next > self.state, "worker state cannot go backwards");
        tracing::trace!(
            thread_id = self.config.thread_id,
            from = %self.state,
            to = %next,
            "worker state"
        );
        self.state = next;
    }
}

impl<W, S> fmt::Debug for BenchmarkWorker<'_, '_, W, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BenchmarkWorker")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
