//! # NUMA Error Types
//!
//! Error types for topology queries and node-local allocation.

use super::NumaNodeId;

/// Errors that can occur during NUMA operations.
#[derive(Debug, thiserror::Error)]
pub enum NumaError {
    /// The OS reports no NUMA support
    #[error("NUMA not available on this platform")]
    NumaUnavailable,

    /// The node to CPU query failed
    #[error("CPU query for NUMA node {node} failed: {reason}")]
    NumaQueryFailed {
        /// The queried node
        node: NumaNodeId,
        /// What went wrong
        reason: String,
    },

    /// Allocation failed or the backend is exhausted
    #[error("NUMA allocation failed: {0}")]
    AllocationFailed(String),

    /// System call failed
    #[error("System call failed: {0}")]
    SyscallFailed(#[from] std::io::Error),
}

impl NumaError {
    /// Returns true for the topology variants, which are fatal to a whole run.
    #[must_use]
    pub fn is_topology(&self) -> bool {
        matches!(self, Self::NumaUnavailable | Self::NumaQueryFailed { .. })
    }
}
