//! # NUMA Topology and Placement
//!
//! Node-aware building blocks for the benchmark harness. On multi-socket
//! systems, memory access latency varies by 2-3x depending on whether
//! memory is local or remote to the CPU; this module lets callers pick.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐         ┌─────────────────────┐
//! │       Node 0        │         │       Node 1        │
//! │  ┌───────────────┐  │         │  ┌───────────────┐  │
//! │  │  CpuSet 0     │  │         │  │  CpuSet 1     │  │
//! │  └───────┬───────┘  │         │  └───────┬───────┘  │
//! │          │          │         │          │          │
//! │  ┌───────▼───────┐  │ remote  │  ┌───────▼───────┐  │
//! │  │ NodeBox<T>s   │◄─┼─────────┼─►│ NodeBox<T>s   │  │
//! │  │ (local DRAM)  │  │         │  │ (local DRAM)  │  │
//! │  └───────────────┘  │         │  └───────────────┘  │
//! └─────────────────────┘         └─────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`NodeCpuTopology`] - Resolves nodes to CPU sets, cached per node
//! - [`NodeLocalAllocator`] - Places values on a node, returns [`NodeBox`]
//! - [`PooledBackend`] - Pre-warmed per-node arena backend
//!
//! ## Example
//!
//! ```rust,ignore
//! use nodebench_core::numa::{NodeCpuTopology, NodeLocalAllocator, NumaNodeId};
//!
//! let topology = NodeCpuTopology::global();
//! topology.log_topology();
//!
//! let allocator = NodeLocalAllocator::direct();
//! let counter = allocator.allocate(NumaNodeId::new(1), 0u64)?;
//! // freed on drop
//! ```
//!
//! ## Platform Support
//!
//! | Platform | Support |
//! |----------|---------|
//! | Linux | Full NUMA support |
//! | Other | `NumaUnavailable`, heap fallback for allocation |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod allocator;
mod arena;
mod error;
mod topology;

pub use allocator::{
    memory_node, page_size, BackendKind, CountingBackend, DirectBackend, NodeBox,
    NodeLocalAllocator, NodePlacement, RawNodeAlloc, SystemBackend,
};
pub use arena::{ArenaStats, PoolConfig, PooledBackend, MAX_POOLED_SIZE};
pub use error::NumaError;
pub use topology::{
    parse_cpulist, CpuSet, NodeCpuTopology, SysfsTopology, TopologySource, SYSFS_NODE_ROOT,
};

/// Result type for NUMA operations.
pub type Result<T> = std::result::Result<T, NumaError>;

/// Identifier of a NUMA node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NumaNodeId(u16);

impl NumaNodeId {
    /// Node `id`.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for NumaNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for NumaNodeId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl FromStr for NumaNodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_and_parse() {
        let node: NumaNodeId = " 3".parse().unwrap();
        assert_eq!(node, NumaNodeId::new(3));
        assert_eq!(format!("node{node}"), "node3");
        assert!("x".parse::<NumaNodeId>().is_err());
    }

    #[test]
    fn test_global_topology_is_consistent() {
        let topo = NodeCpuTopology::global();
        // Either NUMA is reported with CPUs on node 0, or it is unavailable
        match topo.cpus_for_node(NumaNodeId::new(0)) {
            Ok(set) => assert!(!set.is_empty()),
            Err(e) => assert!(e.is_topology()),
        }
    }

    #[test]
    fn test_allocator_places_on_every_reported_node() {
        let topo = NodeCpuTopology::global();
        let allocator = NodeLocalAllocator::direct();
        let count = u16::try_from(topo.node_count().max(1)).unwrap_or(u16::MAX);

        for id in 0..count {
            let node = NumaNodeId::new(id);
            let boxed = allocator.allocate(node, [0u64; 16]).unwrap();
            assert_eq!(NodeBox::node(&boxed), node);
        }
    }
}
