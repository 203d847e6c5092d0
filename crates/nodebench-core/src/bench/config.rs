//! Benchmark configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use super::{ConfigError, DOMAINS};
use crate::numa::{BackendKind, NodeLocalAllocator, NumaError, NumaNodeId, PoolConfig};
use crate::workload::{StructureKind, WorkloadParams};

/// Where worker threads run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadPlacement {
    /// Each worker is pinned to its own domain's node.
    #[default]
    Numa,
    /// Workers are left to the OS scheduler.
    Regular,
    /// Worker `i` is pinned to node `i % 2`, whatever its domain, so half
    /// of each domain runs remote from its pool.
    Alternating,
}

impl ThreadPlacement {
    /// Lowercase name, as accepted by `FromStr`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Numa => "numa",
            Self::Regular => "regular",
            Self::Alternating => "alternating",
        }
    }

    /// Node worker `thread_id` of `domain` is pinned to, if any.
    #[must_use]
    pub fn bind_node(
        self,
        thread_id: usize,
        domain: usize,
        nodes: [NumaNodeId; DOMAINS],
    ) -> Option<NumaNodeId> {
        match self {
            Self::Numa => Some(nodes[domain]),
            Self::Regular => None,
            Self::Alternating => Some(nodes[thread_id % DOMAINS]),
        }
    }
}

/// Where pool instances are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataPlacement {
    /// On each pool's node, through the configured NUMA backend.
    #[default]
    Numa,
    /// On the process heap, wherever the OS puts it.
    Regular,
}

impl DataPlacement {
    /// Lowercase name, as accepted by `FromStr`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Numa => "numa",
            Self::Regular => "regular",
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    )*};
}

display_as_str!(ThreadPlacement, DataPlacement);

impl FromStr for ThreadPlacement {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "numa" => Ok(Self::Numa),
            "regular" => Ok(Self::Regular),
            "alternating" | "alt" => Ok(Self::Alternating),
            _ => Err(ConfigError::UnknownPlacement(s.to_string())),
        }
    }
}

impl FromStr for DataPlacement {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "numa" => Ok(Self::Numa),
            "regular" => Ok(Self::Regular),
            _ => Err(ConfigError::UnknownPlacement(s.to_string())),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "pooled" | "pool" => Ok(Self::Pooled),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

impl FromStr for StructureKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ConfigError::UnknownStructure(s.to_string()))
    }
}

/// One-time population of pool instances before the timed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrefillConfig {
    /// Share of each pool's instances to fill, 0..=100.
    pub percent: u8,
    /// Elements per filled instance. `None` uses the workload default.
    pub depth: Option<usize>,
}

/// Everything one benchmark run needs.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Data structure under test
    pub structure: StructureKind,
    /// Worker threads, split evenly across the two domains
    pub num_threads: usize,
    /// Structure instances, split evenly across the two domains
    pub num_structures: usize,
    /// Wall-clock length of each run
    pub duration: Duration,
    /// Node backing each domain
    pub nodes: [NumaNodeId; DOMAINS],
    /// Thread pinning policy
    pub thread_placement: ThreadPlacement,
    /// Pool memory policy
    pub data_placement: DataPlacement,
    /// NUMA backend used when `data_placement` is `Numa`
    pub backend: BackendKind,
    /// Arena sizing for the pooled backend
    pub pool: PoolConfig,
    /// Percent of operations sent to the other domain's pool
    pub crossover_percent: u8,
    /// Key range for keyed workloads
    pub keyspace: u64,
    /// Optional prefill before workers start
    pub prefill: Option<PrefillConfig>,
    /// Number of repeated runs to average
    pub run_freq: u32,
    /// Base RNG seed; worker `i` uses `seed + i`
    pub seed: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            structure: StructureKind::Stack,
            num_threads: 2,
            num_structures: 2,
            duration: Duration::from_secs(1),
            nodes: [NumaNodeId::new(0), NumaNodeId::new(1)],
            thread_placement: ThreadPlacement::Numa,
            data_placement: DataPlacement::Numa,
            backend: BackendKind::Direct,
            pool: PoolConfig::default(),
            crossover_percent: 0,
            keyspace: 1 << 20,
            prefill: None,
            run_freq: 1,
            seed: 123,
        }
    }
}

impl BenchConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> BenchConfigBuilder {
        BenchConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 || self.num_threads % DOMAINS != 0 {
            return Err(ConfigError::ThreadCount(self.num_threads));
        }
        if self.num_structures == 0 || self.num_structures % DOMAINS != 0 {
            return Err(ConfigError::StructureCount(self.num_structures));
        }
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.nodes[0] == self.nodes[1] {
            return Err(ConfigError::SameNodes(self.nodes[0]));
        }
        if self.crossover_percent > 100 {
            return Err(ConfigError::Crossover(self.crossover_percent));
        }
        if self.keyspace == 0 {
            return Err(ConfigError::ZeroKeyspace);
        }
        if self.run_freq == 0 {
            return Err(ConfigError::ZeroRunFreq);
        }
        if let Some(max) = self.pool.max_chunks {
            if max == 0 {
                return Err(ConfigError::PoolSizing(
                    "max_chunks must be at least 1".to_string(),
                ));
            }
            if self.pool.warm_chunks > max {
                return Err(ConfigError::PoolSizing(format!(
                    "warm_chunks ({}) exceeds max_chunks ({max})",
                    self.pool.warm_chunks
                )));
            }
        }
        if let Some(prefill) = self.prefill {
            if prefill.percent > 100 {
                return Err(ConfigError::PrefillPercent(prefill.percent));
            }
        }
        Ok(())
    }

    /// Default worker count: one per logical CPU, rounded down to an even
    /// number, never below 2.
    #[must_use]
    pub fn default_thread_count() -> usize {
        (num_cpus::get() & !1).max(DOMAINS)
    }

    /// Workers per domain.
    #[must_use]
    pub fn threads_per_domain(&self) -> usize {
        self.num_threads / DOMAINS
    }

    /// Pool size per domain.
    #[must_use]
    pub fn structures_per_domain(&self) -> usize {
        self.num_structures / DOMAINS
    }

    /// Parameters handed to every workload instance.
    #[must_use]
    pub fn workload_params(&self) -> WorkloadParams {
        WorkloadParams {
            keyspace: self.keyspace,
        }
    }

    /// Label for the allocator column of reports: `regular`, `direct` or `pooled`.
    #[must_use]
    pub fn allocator_label(&self) -> &'static str {
        match self.data_placement {
            DataPlacement::Regular => "regular",
            DataPlacement::Numa => self.backend.as_str(),
        }
    }

    /// Build the allocator this configuration asks for.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if the pooled backend cannot
    /// warm its arenas.
    pub fn build_allocator(&self) -> Result<NodeLocalAllocator, NumaError> {
        match (self.data_placement, self.backend) {
            (DataPlacement::Regular, _) => Ok(NodeLocalAllocator::system()),
            (DataPlacement::Numa, BackendKind::Direct) => Ok(NodeLocalAllocator::direct()),
            (DataPlacement::Numa, BackendKind::Pooled) => {
                NodeLocalAllocator::pooled(&self.nodes, self.pool)
            }
        }
    }
}

/// Builder for `BenchConfig`.
#[derive(Debug, Default)]
pub struct BenchConfigBuilder {
    config: BenchConfig,
}

impl BenchConfigBuilder {
    /// Sets the data structure.
    #[must_use]
    pub fn structure(mut self, structure: StructureKind) -> Self {
        self.config.structure = structure;
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = n;
        self
    }

    /// Sets the structure count.
    #[must_use]
    pub fn num_structures(mut self, n: usize) -> Self {
        self.config.num_structures = n;
        self
    }

    /// Sets the run length.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.config.duration = duration;
        self
    }

    /// Sets the node backing each domain.
    #[must_use]
    pub fn nodes(mut self, nodes: [NumaNodeId; DOMAINS]) -> Self {
        self.config.nodes = nodes;
        self
    }

    /// Sets the thread pinning policy.
    #[must_use]
    pub fn thread_placement(mut self, placement: ThreadPlacement) -> Self {
        self.config.thread_placement = placement;
        self
    }

    /// Sets the pool memory policy.
    #[must_use]
    pub fn data_placement(mut self, placement: DataPlacement) -> Self {
        self.config.data_placement = placement;
        self
    }

    /// Sets the NUMA allocator backend.
    #[must_use]
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    /// Sets the pooled arena sizing.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Sets the crossover percentage.
    #[must_use]
    pub fn crossover_percent(mut self, percent: u8) -> Self {
        self.config.crossover_percent = percent;
        self
    }

    /// Sets the key range.
    #[must_use]
    pub fn keyspace(mut self, keyspace: u64) -> Self {
        self.config.keyspace = keyspace;
        self
    }

    /// Enables prefill.
    #[must_use]
    pub fn prefill(mut self, prefill: PrefillConfig) -> Self {
        self.config.prefill = Some(prefill);
        self
    }

    /// Sets how many runs to average.
    #[must_use]
    pub fn run_freq(mut self, runs: u32) -> Self {
        self.config.run_freq = runs;
        self
    }

    /// Sets the base RNG seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<BenchConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
