//! # Thread Affinity
//!
//! Pins OS threads to the CPU set of a NUMA node.
//!
//! A worker binds exactly once, right after its thread starts and before it
//! does any measured work. Binding is never re-applied.
//!
//! ```rust,ignore
//! use nodebench_core::affinity::AffinityBinder;
//! use nodebench_core::numa::{NodeCpuTopology, NumaNodeId};
//!
//! let binder = AffinityBinder::new(NodeCpuTopology::global());
//! let cpus = binder.bind_current(NumaNodeId::new(0))?;
//! ```

mod binder;

pub use binder::{current_thread_cpus, AffinityBinder, ThreadRef};

use crate::numa::{NumaError, NumaNodeId};

/// Errors that can occur while binding a thread.
#[derive(Debug, thiserror::Error)]
pub enum AffinityError {
    /// The OS rejected the affinity mask
    #[error("Failed to bind thread to NUMA node {node}: {source}")]
    BindFailed {
        /// The target node
        node: NumaNodeId,
        /// The OS error
        #[source]
        source: std::io::Error,
    },

    /// The node's CPU set could not be resolved
    #[error(transparent)]
    Topology(#[from] NumaError),
}
