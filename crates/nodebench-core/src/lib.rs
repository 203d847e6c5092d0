//! # nodebench Core
//!
//! Measures how NUMA placement affects the throughput of data structures
//! shared between many threads.
//!
//! This crate provides:
//! - **NUMA**: Node to CPU topology, and node-local allocation with direct
//!   and pre-warmed pooled backends
//! - **Affinity**: Pinning worker threads to a node's CPUs
//! - **Pools**: Fixed arrays of node-local, mutex-guarded instances
//! - **Workloads**: Stack, queue, linked list, tree and array containers
//! - **Bench**: The run protocol, from validation to aggregated results
//!
//! ## Design Principles
//!
//! 1. **Two domains** - Threads and structures split evenly across two nodes
//! 2. **Placement is explicit** - Nodes are runtime values carried with every allocation
//! 3. **Nothing global but topology** - Pools, counters and gates live for one run
//! 4. **Counters stay out of the hot loop** - One atomic add per worker
//!
//! ## Example
//!
//! ```rust,ignore
//! use nodebench_core::bench::{BenchConfig, Orchestrator};
//! use nodebench_core::workload::StructureKind;
//!
//! let config = BenchConfig::builder()
//!     .structure(StructureKind::Queue)
//!     .num_threads(8)
//!     .crossover_percent(20)
//!     .build()?;
//!
//! let orchestrator = Orchestrator::new(config.build_allocator()?);
//! let summary = orchestrator.run_repeated(&config)?;
//! println!("{} ops", summary.mean.ops_total);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[cfg(not(unix))]
compile_error!("nodebench-core requires a unix target");

pub mod affinity;
pub mod bench;
pub mod numa;
pub mod pool;
pub mod workload;

// Re-export key types
pub use bench::{BenchConfig, Orchestrator, RunResult, RunSummary};
pub use numa::{NodeLocalAllocator, NumaNodeId};

/// Result type for nodebench-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for nodebench-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// NUMA topology or allocation errors
    #[error("NUMA error: {0}")]
    Numa(#[from] numa::NumaError),

    /// Thread affinity errors
    #[error("Affinity error: {0}")]
    Affinity(#[from] affinity::AffinityError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] bench::ConfigError),

    /// Benchmark run errors
    #[error("Bench error: {0}")]
    Bench(#[from] bench::BenchError),

    /// Worker errors
    #[error("Worker error: {0}")]
    Worker(#[from] bench::WorkerError),
}
