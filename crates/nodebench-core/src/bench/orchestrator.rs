//! Benchmark orchestration.

use std::thread;

use fastrand::Rng;
use serde::{Serialize, Serializer};

use super::{
    BenchConfig, BenchError, BenchmarkWorker, NodeCounters, PrefillConfig, RunResult, StartGate,
    ThreadPlacement, WorkerConfig, WorkerError, WorkerReport, WorkerState, DOMAINS,
};
use crate::affinity::AffinityBinder;
use crate::numa::{NodeCpuTopology, NodeLocalAllocator, NumaNodeId, SysfsTopology, TopologySource};
use crate::pool::PerNodePool;
use crate::workload::{
    Array, LinkedList, Queue, Stack, StructureKind, Tree, Workload, WorkloadParams,
};

/// Outcome of one run.
#[derive(Debug)]
pub struct RunReport {
    /// Aggregated counts
    pub result: RunResult,
    /// One report per worker that completed, by thread id
    pub workers: Vec<WorkerReport>,
    /// First worker failure, by thread id
    pub first_failure: Option<WorkerError>,
}

/// Outcome of `run_freq` repeated runs.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    /// Field-wise integer mean of `runs`
    pub mean: RunResult,
    /// Every run, in order
    pub runs: Vec<RunResult>,
    /// First worker failure across all runs
    #[serde(serialize_with = "serialize_failure")]
    pub first_failure: Option<WorkerError>,
}

fn serialize_failure<S: Serializer>(
    failure: &Option<WorkerError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match failure {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Owns the allocator and runs benchmarks against it.
///
/// Pools, counters and the start gate live only for one run; the allocator
/// (with any pre-warmed arenas) is reused across runs.
pub struct Orchestrator<'t, S = SysfsTopology> {
    allocator: NodeLocalAllocator,
    topology: &'t NodeCpuTopology<S>,
}

impl Orchestrator<'static> {
    /// Orchestrator over the process-wide sysfs topology.
    #[must_use]
    pub fn new(allocator: NodeLocalAllocator) -> Self {
        Self::with_topology(allocator, NodeCpuTopology::global())
    }
}

impl<'t, S: TopologySource> Orchestrator<'t, S> {
    /// Orchestrator resolving CPUs through `topology`.
    #[must_use]
    pub fn with_topology(allocator: NodeLocalAllocator, topology: &'t NodeCpuTopology<S>) -> Self {
        Self {
            allocator,
            topology,
        }
    }

    /// The allocator pools are built from.
    #[must_use]
    pub fn allocator(&self) -> &NodeLocalAllocator {
        &self.allocator
    }

    /// Run the configured structure once.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub fn run(&self, config: &BenchConfig) -> Result<RunReport, BenchError> {
        match config.structure {
            StructureKind::Stack => self.execute::<Stack<'_>>(config),
            StructureKind::Queue => self.execute::<Queue<'_>>(config),
            StructureKind::LinkedList => self.execute::<LinkedList<'_>>(config),
            StructureKind::Tree => self.execute::<Tree<'_>>(config),
            StructureKind::Array => self.execute::<Array<'_>>(config),
        }
    }

    /// Run `config.run_freq` times and average.
    ///
    /// Every repetition builds fresh pools.
    ///
    /// # Errors
    ///
    /// Returns the first run-level error; earlier repetitions are discarded.
    pub fn run_repeated(&self, config: &BenchConfig) -> Result<RunSummary, BenchError> {
        config.validate()?;

        let mut runs = Vec::with_capacity(config.run_freq as usize);
        let mut first_failure = None;
        for run in 0..config.run_freq {
            let report = self.run(config)?;
            tracing::debug!(
                run,
                ops_total = report.result.ops_total,
                workers_failed = report.result.workers_failed,
                "repetition finished"
            );
            runs.push(report.result);
            if first_failure.is_none() {
                first_failure = report.first_failure;
            }
        }

        let mean = RunResult::average(&runs);
        if config.run_freq > 1 {
            tracing::info!(
                runs = config.run_freq,
                ops_node0 = mean.ops_node0,
                ops_node1 = mean.ops_node1,
                ops_total = mean.ops_total,
                "averaged repeated runs"
            );
        }
        Ok(RunSummary {
            mean,
            runs,
            first_failure,
        })
    }

    /// Run once with workload `W`, whatever `config.structure` says.
    ///
    /// # Errors
    ///
    /// - [`BenchError::Config`] if `config` is invalid. Nothing has been
    ///   allocated or queried at that point.
    /// - [`BenchError::Topology`] if a node needed for pinning cannot be
    ///   resolved.
    /// - [`BenchError::Allocation`] if a pool cannot be built or prefilled.
    /// - [`BenchError::Spawn`] if a worker thread cannot be started.
    ///
    /// Worker failures are not errors here; they are reported in
    /// [`RunReport::first_failure`] and `workers_failed`.
    pub fn execute<'a, W: Workload<'a>>(
        &'a self,
        config: &BenchConfig,
    ) -> Result<RunReport, BenchError> {
        config.validate()?;

        let pinned = config.thread_placement != ThreadPlacement::Regular;
        if pinned {
            for node in config.nodes {
                self.topology
                    .cpus_for_node(node)
                    .map_err(BenchError::Topology)?;
            }
        }

        let params = config.workload_params();
        let size = config.structures_per_domain();
        let pools = [
            self.build_pool::<W>(config.nodes[0], size, &params)?,
            self.build_pool::<W>(config.nodes[1], size, &params)?,
        ];
        if let Some(prefill) = config.prefill {
            prefill_pools(&pools, prefill, config.seed, &params)?;
        }

        let gate = StartGate::new();
        let counters = NodeCounters::new();
        let binder = pinned.then(|| AffinityBinder::new(self.topology));
        let threads_per_domain = config.threads_per_domain();

        let outcomes = thread::scope(|s| {
            let mut handles = Vec::with_capacity(config.num_threads);
            for thread_id in 0..config.num_threads {
                let domain = thread_id / threads_per_domain;
                let worker_config = WorkerConfig {
                    thread_id,
                    domain,
                    bind_node: config
                        .thread_placement
                        .bind_node(thread_id, domain, config.nodes),
                    duration: config.duration,
                    pool_size: size,
                    crossover_percent: config.crossover_percent,
                    keyspace: config.keyspace,
                    seed: config.seed,
                };
                let worker = BenchmarkWorker::new(worker_config, &pools, binder, &gate, &counters);

                let spawned = thread::Builder::new()
                    .name(format!("nodebench-w{thread_id}"))
                    .spawn_scoped(s, move || worker.run());
                match spawned {
                    Ok(handle) => handles.push((thread_id, handle)),
                    Err(source) => {
                        gate.abort();
                        for (_, handle) in handles {
                            let _ = handle.join();
                        }
                        return Err(BenchError::Spawn { thread_id, source });
                    }
                }
            }

            gate.wait_ready(handles.len());
            gate.open();
            tracing::debug!(workers = handles.len(), "start gate open");

            Ok(handles
                .into_iter()
                .map(|(thread_id, handle)| {
                    let outcome = handle
                        .join()
                        .unwrap_or(Err(WorkerError::Panicked { thread_id }));
                    tracing::trace!(thread_id, state = %WorkerState::Joined, "worker state");
                    outcome
                })
                .collect::<Vec<_>>())
        })?;

        let mut workers = Vec::with_capacity(outcomes.len());
        let mut first_failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(report) => workers.push(report),
                Err(err) => {
                    counters.record_failure();
                    tracing::warn!(thread_id = err.thread_id(), error = %err, "worker failed");
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }

        let result = counters.result();
        let failed_ops: u64 = workers.iter().map(|w| w.failed_ops).sum();
        if failed_ops > 0 {
            tracing::warn!(failed_ops, "container operations failed during the run");
        }
        tracing::info!(
            structure = %config.structure,
            threads = config.num_threads,
            structures = config.num_structures,
            thread_placement = %config.thread_placement,
            backend = self.allocator.backend_name(),
            crossover = config.crossover_percent,
            ops_node0 = result.ops_node0,
            ops_node1 = result.ops_node1,
            ops_total = result.ops_total,
            workers_failed = result.workers_failed,
            "run complete"
        );
        Ok(RunReport {
            result,
            workers,
            first_failure,
        })
    }

    fn build_pool<'a, W: Workload<'a>>(
        &'a self,
        node: NumaNodeId,
        size: usize,
        params: &WorkloadParams,
    ) -> Result<PerNodePool<'a, W>, BenchError> {
        PerNodePool::new(&self.allocator, node, size, |place| W::create(place, params))
            .map_err(|source| BenchError::Allocation { node, source })
    }
}

/// Fill a deterministic subset of each pool's instances.
fn prefill_pools<'a, W: Workload<'a>>(
    pools: &[PerNodePool<'a, W>; DOMAINS],
    prefill: PrefillConfig,
    seed: u64,
    params: &WorkloadParams,
) -> Result<(), BenchError> {
    let depth = prefill
        .depth
        .unwrap_or_else(|| W::default_prefill_depth(params));

    for (domain, pool) in pools.iter().enumerate() {
        let mut rng = Rng::with_seed(seed.wrapping_add(domain as u64));
        let count = (pool.len() * usize::from(prefill.percent)).div_ceil(100);
        let mut indices: Vec<usize> = (0..pool.len()).collect();
        rng.shuffle(&mut indices);

        for &index in &indices[..count] {
            pool.with_instance(index, |instance| instance.prefill(&mut rng, params, depth))
                .map_err(|source| BenchError::Allocation {
                    node: pool.node(),
                    source,
                })?;
        }
        tracing::debug!(node = %pool.node(), instances = count, depth, "prefilled pool");
    }
    Ok(())
}

impl<S> std::fmt::Debug for Orchestrator<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.allocator.backend_name())
            .field("topology", &self.topology)
            .finish()
    }
}
