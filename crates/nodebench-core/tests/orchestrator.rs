//! End-to-end runs through the orchestrator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fastrand::Rng;
use nodebench_core::bench::{
    BenchConfig, BenchError, ConfigError, DataPlacement, Orchestrator, PrefillConfig,
    ThreadPlacement, WorkerError,
};
use nodebench_core::numa::{
    BackendKind, CountingBackend, NodeCpuTopology, NodeLocalAllocator, NodePlacement, NumaError,
    NumaNodeId, PoolConfig, SystemBackend, TopologySource,
};
use nodebench_core::workload::{StructureKind, Workload, WorkloadParams};

fn unpinned(structure: StructureKind, threads: usize, structures: usize) -> BenchConfig {
    BenchConfig {
        structure,
        num_threads: threads,
        num_structures: structures,
        duration: Duration::from_millis(200),
        thread_placement: ThreadPlacement::Regular,
        data_placement: DataPlacement::Regular,
        keyspace: 1024,
        ..BenchConfig::default()
    }
}

fn counting_allocator() -> (Arc<CountingBackend<SystemBackend>>, NodeLocalAllocator) {
    let backend = Arc::new(CountingBackend::new(SystemBackend));
    let alloc = NodeLocalAllocator::from_backend(Box::new(Arc::clone(&backend)));
    (backend, alloc)
}

#[test]
fn test_stack_run_total_is_sum_of_nodes() {
    let config = BenchConfig {
        duration: Duration::from_secs(1),
        data_placement: DataPlacement::Numa,
        crossover_percent: 0,
        ..unpinned(StructureKind::Stack, 4, 4)
    };
    let orchestrator = Orchestrator::new(config.build_allocator().unwrap());
    let report = orchestrator.run(&config).unwrap();
    let result = report.result;

    assert_eq!(result.ops_node0 + result.ops_node1, result.ops_total);
    assert!(result.ops_node0 > 0);
    assert!(result.ops_node1 > 0);
    assert_eq!(result.workers_failed, 0);
    assert_eq!(report.workers.len(), 4);
    assert!(report.workers.iter().all(|w| w.remote_ops == 0));
}

#[test]
fn test_pinned_run_on_numa_hardware() {
    let topology = NodeCpuTopology::global();
    if topology.node_count() < 2 {
        eprintln!("skipping: fewer than two NUMA nodes");
        return;
    }

    let config = BenchConfig {
        thread_placement: ThreadPlacement::Numa,
        data_placement: DataPlacement::Numa,
        ..unpinned(StructureKind::Queue, 4, 4)
    };
    let orchestrator = Orchestrator::new(config.build_allocator().unwrap());
    let report = orchestrator.run(&config).unwrap();

    assert_eq!(report.result.workers_failed, 0);
    for worker in &report.workers {
        let cpus = worker.cpus.as_ref().unwrap();
        let expected = topology.cpus_for_node(config.nodes[worker.domain]).unwrap();
        assert_eq!(cpus, &expected);
    }
}

#[test]
fn test_odd_counts_rejected_before_any_allocation() {
    let (backend, alloc) = counting_allocator();
    let orchestrator = Orchestrator::new(alloc);

    let odd_threads = unpinned(StructureKind::Stack, 3, 4);
    let err = orchestrator.run(&odd_threads).unwrap_err();
    assert!(matches!(err, BenchError::Config(ConfigError::ThreadCount(3))));

    let odd_structures = unpinned(StructureKind::Tree, 4, 5);
    let err = orchestrator.run_repeated(&odd_structures).unwrap_err();
    assert!(matches!(err, BenchError::Config(ConfigError::StructureCount(5))));

    assert_eq!(backend.allocations(), 0);
}

#[test]
fn test_repeated_average_matches_long_run_magnitude() {
    let runs = 3;
    let repeated = BenchConfig {
        run_freq: runs,
        ..unpinned(StructureKind::Array, 2, 2)
    };
    let long = BenchConfig {
        duration: repeated.duration * runs,
        ..unpinned(StructureKind::Array, 2, 2)
    };
    let orchestrator = Orchestrator::new(NodeLocalAllocator::system());

    let summary = orchestrator.run_repeated(&repeated).unwrap();
    assert_eq!(summary.runs.len(), 3);
    assert_eq!(
        summary.mean.ops_total,
        summary.mean.ops_node0 + summary.mean.ops_node1
    );
    assert!(summary.first_failure.is_none());

    let single = orchestrator.run(&long).unwrap().result.ops_total;
    #[allow(clippy::cast_precision_loss)]
    let ratio = (summary.mean.ops_total * u64::from(runs)) as f64 / single.max(1) as f64;
    assert!((0.1..10.0).contains(&ratio), "ratio {ratio} out of range");
}

/// Node 0 maps to the CPUs this process may use; node 1 to a CPU that
/// does not exist, so pinning to it always fails.
#[cfg(target_os = "linux")]
struct HalfBroken(Vec<usize>);

#[cfg(target_os = "linux")]
impl TopologySource for HalfBroken {
    fn numa_available(&self) -> bool {
        true
    }

    fn node_to_cpus(&self, node: NumaNodeId) -> Result<Vec<usize>, NumaError> {
        Ok(if node.get() == 0 { self.0.clone() } else { vec![1023] })
    }

    fn online_nodes(&self) -> Result<Vec<NumaNodeId>, NumaError> {
        Ok(vec![NumaNodeId::new(0), NumaNodeId::new(1)])
    }
}

#[cfg(target_os = "linux")]
#[test]
fn test_bind_failure_gives_partial_result() {
    let cpus = nodebench_core::affinity::current_thread_cpus().unwrap();
    let topology = NodeCpuTopology::new(HalfBroken(cpus));
    let orchestrator = Orchestrator::with_topology(NodeLocalAllocator::system(), &topology);

    let config = BenchConfig {
        thread_placement: ThreadPlacement::Numa,
        ..unpinned(StructureKind::Stack, 4, 4)
    };
    let report = orchestrator.run(&config).unwrap();

    assert_eq!(report.result.workers_failed, 2);
    assert_eq!(report.result.ops_node1, 0);
    assert!(report.result.ops_node0 > 0);
    assert_eq!(report.result.ops_total, report.result.ops_node0);
    assert_eq!(report.workers.len(), 2);
    assert!(matches!(
        report.first_failure,
        Some(WorkerError::Bind { thread_id: 2, .. })
    ));
}

struct NoNuma;

impl TopologySource for NoNuma {
    fn numa_available(&self) -> bool {
        false
    }

    fn node_to_cpus(&self, _node: NumaNodeId) -> Result<Vec<usize>, NumaError> {
        Err(NumaError::NumaUnavailable)
    }

    fn online_nodes(&self) -> Result<Vec<NumaNodeId>, NumaError> {
        Err(NumaError::NumaUnavailable)
    }
}

#[test]
fn test_missing_topology_is_fatal_when_pinning() {
    let topology = NodeCpuTopology::new(NoNuma);
    let (backend, alloc) = counting_allocator();
    let orchestrator = Orchestrator::with_topology(alloc, &topology);

    let pinned = BenchConfig {
        thread_placement: ThreadPlacement::Alternating,
        ..unpinned(StructureKind::Stack, 2, 2)
    };
    let err = orchestrator.run(&pinned).unwrap_err();
    assert!(matches!(err, BenchError::Topology(NumaError::NumaUnavailable)));
    assert_eq!(backend.allocations(), 0);

    // Unpinned runs never ask
    let report = orchestrator.run(&unpinned(StructureKind::Stack, 2, 2)).unwrap();
    assert!(report.result.ops_total > 0);
}

static PROBE_LOCAL: AtomicU64 = AtomicU64::new(0);
static PROBE_REMOTE: AtomicU64 = AtomicU64::new(0);

const PROBE_THREADS_PER_DOMAIN: usize = 2;

/// Counts whether each operation came from a worker of the instance's own
/// domain, judged by the worker's thread name.
struct Probe {
    node: NumaNodeId,
}

impl<'a> Workload<'a> for Probe {
    type Op = ();

    fn create(placement: NodePlacement<'a>, _: &WorkloadParams) -> Result<Self, NumaError> {
        Ok(Self {
            node: placement.node(),
        })
    }

    fn pick_op(_: u32, _: &mut Rng, _: &WorkloadParams) -> Self::Op {}

    fn apply(&mut self, (): Self::Op) -> Result<(), NumaError> {
        let name = std::thread::current().name().map(str::to_string).unwrap();
        let id: usize = name.trim_start_matches("nodebench-w").parse().unwrap();
        let domain = u16::try_from(id / PROBE_THREADS_PER_DOMAIN).unwrap();
        if self.node.get() == domain {
            PROBE_LOCAL.fetch_add(1, Ordering::Relaxed);
        } else {
            PROBE_REMOTE.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn default_prefill_depth(_: &WorkloadParams) -> usize {
        0
    }

    fn prefill(&mut self, _: &mut Rng, _: &WorkloadParams, _: usize) -> Result<(), NumaError> {
        Ok(())
    }
}

#[test]
fn test_crossover_extremes_route_every_operation() {
    let orchestrator = Orchestrator::new(NodeLocalAllocator::system());

    for crossover in [0u8, 100] {
        PROBE_LOCAL.store(0, Ordering::Relaxed);
        PROBE_REMOTE.store(0, Ordering::Relaxed);
        let config = BenchConfig {
            crossover_percent: crossover,
            ..unpinned(StructureKind::Stack, 2 * PROBE_THREADS_PER_DOMAIN, 4)
        };

        let report = orchestrator.execute::<Probe>(&config).unwrap();
        let total = report.result.ops_total;
        let local = PROBE_LOCAL.load(Ordering::Relaxed);
        let remote = PROBE_REMOTE.load(Ordering::Relaxed);

        assert!(total > 0);
        assert_eq!(local + remote, total);
        if crossover == 0 {
            assert_eq!(remote, 0);
            assert!(report.workers.iter().all(|w| w.local_ops == w.ops));
        } else {
            assert_eq!(local, 0);
            assert!(report.workers.iter().all(|w| w.remote_ops == w.ops));
        }
    }
}

#[test]
fn test_pooled_backend_with_prefill() {
    let config = BenchConfig {
        data_placement: DataPlacement::Numa,
        backend: BackendKind::Pooled,
        prefill: Some(PrefillConfig {
            percent: 50,
            depth: None,
        }),
        ..unpinned(StructureKind::Queue, 2, 4)
    };
    let orchestrator = Orchestrator::new(config.build_allocator().unwrap());
    assert_eq!(orchestrator.allocator().backend_name(), "pooled");

    let summary = orchestrator.run_repeated(&config).unwrap();
    assert!(summary.mean.ops_total > 0);
    assert_eq!(summary.mean.workers_failed, 0);
}

#[test]
fn test_exhausted_pool_fails_before_workers_start() {
    let config = BenchConfig {
        data_placement: DataPlacement::Numa,
        backend: BackendKind::Pooled,
        pool: PoolConfig {
            chunk_size: 4096,
            warm_chunks: 1,
            max_chunks: Some(1),
        },
        prefill: Some(PrefillConfig {
            percent: 100,
            depth: Some(100_000),
        }),
        ..unpinned(StructureKind::Stack, 2, 2)
    };
    let orchestrator = Orchestrator::new(config.build_allocator().unwrap());

    let err = orchestrator.run(&config).unwrap_err();
    match err {
        BenchError::Allocation { node, source } => {
            assert_eq!(node, config.nodes[0]);
            assert!(matches!(source, NumaError::AllocationFailed(_)));
        }
        other => panic!("expected allocation failure, got {other}"),
    }
}

#[test]
fn test_exhausted_arena_mid_run_keeps_counts() {
    let config = BenchConfig {
        data_placement: DataPlacement::Numa,
        backend: BackendKind::Pooled,
        pool: PoolConfig {
            chunk_size: 4096,
            warm_chunks: 1,
            max_chunks: Some(1),
        },
        duration: Duration::from_millis(300),
        ..unpinned(StructureKind::Stack, 2, 2)
    };
    let orchestrator = Orchestrator::new(config.build_allocator().unwrap());

    let report = orchestrator.run(&config).unwrap();
    let result = report.result;

    assert_eq!(result.workers_failed, 0);
    assert!(report.first_failure.is_none());
    assert!(result.ops_node0 > 0);
    assert!(result.ops_node1 > 0);
    assert_eq!(result.ops_total, result.ops_node0 + result.ops_node1);

    // A push past the single chunk is rejected, pops keep succeeding
    let failed: u64 = report.workers.iter().map(|w| w.failed_ops).sum();
    assert!(failed > 0);
    let counted: u64 = report.workers.iter().map(|w| w.ops).sum();
    assert_eq!(counted, result.ops_total);
}
