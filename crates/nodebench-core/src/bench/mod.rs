//! # Benchmark Execution
//!
//! Runs balanced worker populations against two per-node pools and counts
//! what they get done.
//!
//! ## Components
//!
//! - [`BenchConfig`] - What to run, validated before anything is allocated
//! - [`Orchestrator`] - Builds pools, spawns and joins workers, aggregates
//! - [`BenchmarkWorker`] - One pinned thread running the timed op loop
//! - [`NodeCounters`] - Cache-padded per-domain totals
//!
//! ## Run Protocol
//!
//! ```text
//! validate ─► resolve CPUs ─► build pools ─► prefill ─► spawn workers
//!                                                            │
//!            report ◄── join all ◄── deadline ◄── open gate ◄┘
//! ```
//!
//! Thread count and structure count are split evenly between the two
//! domains. Domain `d` runs on `nodes[d]`, owns `pools[d]`, and counts into
//! `ops_node{d}`.

use std::io;

use crate::numa::{NumaError, NumaNodeId};

mod config;
mod counters;
mod orchestrator;
mod worker;

pub use config::{
    BenchConfig, BenchConfigBuilder, DataPlacement, PrefillConfig, ThreadPlacement,
};
pub use counters::{CachePadded, NodeCounters, RunResult};
pub use orchestrator::{Orchestrator, RunReport, RunSummary};
pub use worker::{
    BenchmarkWorker, StartGate, WorkerConfig, WorkerError, WorkerReport, WorkerState,
};

/// Number of node domains in every run.
pub const DOMAINS: usize = 2;

/// Invalid benchmark configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Thread count is zero or odd
    #[error("thread count must be positive and even, got {0}")]
    ThreadCount(usize),

    /// Structure count is zero or odd
    #[error("structure count must be positive and even, got {0}")]
    StructureCount(usize),

    /// Unrecognized structure name
    #[error("unknown structure '{0}' (expected stack, queue, ll, bst or array)")]
    UnknownStructure(String),

    /// Unrecognized placement name
    #[error("unknown placement '{0}' (expected numa, regular or alternating)")]
    UnknownPlacement(String),

    /// Unrecognized allocator backend
    #[error("unknown backend '{0}' (expected direct or pooled)")]
    UnknownBackend(String),

    /// Crossover above 100 percent
    #[error("crossover must be between 0 and 100, got {0}")]
    Crossover(u8),

    /// Prefill above 100 percent
    #[error("prefill percent must be between 0 and 100, got {0}")]
    PrefillPercent(u8),

    /// Run length of zero
    #[error("duration must be greater than zero")]
    ZeroDuration,

    /// Empty keyspace
    #[error("keyspace must be at least 1")]
    ZeroKeyspace,

    /// No runs requested
    #[error("run frequency must be at least 1")]
    ZeroRunFreq,

    /// Pooled arena limits that cannot be satisfied
    #[error("invalid pool sizing: {0}")]
    PoolSizing(String),

    /// Both domains on the same node
    #[error("both domains are mapped to node {0}")]
    SameNodes(NumaNodeId),
}

/// Failure of a whole benchmark run.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// Configuration rejected before any work started
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A node's CPUs could not be resolved
    #[error("topology error: {0}")]
    Topology(#[source] NumaError),

    /// A pool could not be built
    #[error("failed to build pool on node {node}: {source}")]
    Allocation {
        /// Node the pool was for
        node: NumaNodeId,
        /// Underlying error
        #[source]
        source: NumaError,
    },

    /// The OS refused to start a worker thread
    #[error("failed to spawn worker {thread_id}: {source}")]
    Spawn {
        /// Worker that could not start
        thread_id: usize,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ConfigError::ThreadCount(3).to_string(),
            "thread count must be positive and even, got 3"
        );
        let err = BenchError::from(ConfigError::SameNodes(NumaNodeId::new(1)));
        assert_eq!(
            err.to_string(),
            "invalid configuration: both domains are mapped to node 1"
        );
    }
}
