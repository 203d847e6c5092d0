//! # Workloads
//!
//! The data structures under test. Each is a plain single-threaded container
//! that allocates every internal node through a [`NodePlacement`], so the
//! whole structure lives on its pool's NUMA node. Locking is the pool's job.
//!
//! | Kind | Operations | Mix (selector in 1..=100) |
//! |------|------------|---------------------------|
//! | `stack` | push / pop | 50 / 50 |
//! | `queue` | enqueue / dequeue | 50 / 50 |
//! | `ll` | append / remove_head / lookup | 33 / 33 / 34 |
//! | `bst` | insert / lookup | 90 / 10 |
//! | `array` | write / read | 50 / 50 |

mod chain;

pub mod array;
pub mod list;
pub mod queue;
pub mod stack;
pub mod tree;

use std::fmt;

use fastrand::Rng;

use crate::numa::{NodePlacement, NumaError};

pub use array::{Array, ArrayOp, ARRAY_CELLS};
pub use list::{LinkedList, ListOp};
pub use queue::{Queue, QueueOp};
pub use stack::{Stack, StackOp};
pub use tree::{Tree, TreeOp};

/// Parameters shared by every instance of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadParams {
    /// Keys and values are drawn from `0..keyspace`.
    pub keyspace: u64,
}

impl WorkloadParams {
    /// Draw a key uniformly from the keyspace.
    #[inline]
    pub fn key(&self, rng: &mut Rng) -> u64 {
        rng.u64(..self.keyspace.max(1))
    }
}

impl Default for WorkloadParams {
    fn default() -> Self {
        Self { keyspace: 1 << 16 }
    }
}

/// A container the benchmark can drive.
pub trait Workload<'a>: Sized + Send {
    /// One operation, chosen before the instance lock is taken.
    type Op: Copy + fmt::Debug;

    /// Build an empty instance whose memory comes from `placement`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if an up-front allocation fails.
    fn create(placement: NodePlacement<'a>, params: &WorkloadParams) -> Result<Self, NumaError>;

    /// Map an op selector in `1..=100` to an operation.
    fn pick_op(selector: u32, rng: &mut Rng, params: &WorkloadParams) -> Self::Op;

    /// Perform `op`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if a node cannot be allocated.
    fn apply(&mut self, op: Self::Op) -> Result<(), NumaError>;

    /// Elements added to a prefilled instance when no depth is configured.
    fn default_prefill_depth(params: &WorkloadParams) -> usize;

    /// Add `depth` elements before the timed run.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if a node cannot be allocated.
    fn prefill(
        &mut self,
        rng: &mut Rng,
        params: &WorkloadParams,
        depth: usize,
    ) -> Result<(), NumaError>;
}

/// The data structure a run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureKind {
    /// LIFO stack
    Stack,
    /// FIFO queue
    Queue,
    /// Singly linked list
    #[serde(rename = "ll")]
    LinkedList,
    /// Unbalanced binary search tree
    #[serde(rename = "bst")]
    Tree,
    /// Fixed-size array
    Array,
}

impl StructureKind {
    /// Parse a structure name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stack" => Some(Self::Stack),
            "queue" => Some(Self::Queue),
            "ll" | "list" | "linkedlist" => Some(Self::LinkedList),
            "bst" | "tree" => Some(Self::Tree),
            "array" => Some(Self::Array),
            _ => None,
        }
    }

    /// Short name used in CSV output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stack => "stack",
            Self::Queue => "queue",
            Self::LinkedList => "ll",
            Self::Tree => "bst",
            Self::Array => "array",
        }
    }
}

impl fmt::Display for StructureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structure_kinds() {
        assert_eq!(StructureKind::parse("stack"), Some(StructureKind::Stack));
        assert_eq!(StructureKind::parse("QUEUE"), Some(StructureKind::Queue));
        assert_eq!(StructureKind::parse("ll"), Some(StructureKind::LinkedList));
        assert_eq!(StructureKind::parse("list"), Some(StructureKind::LinkedList));
        assert_eq!(StructureKind::parse("bst"), Some(StructureKind::Tree));
        assert_eq!(StructureKind::parse("array"), Some(StructureKind::Array));
        assert_eq!(StructureKind::parse("heap"), None);
    }

    #[test]
    fn test_names_round_trip() {
        for kind in [
            StructureKind::Stack,
            StructureKind::Queue,
            StructureKind::LinkedList,
            StructureKind::Tree,
            StructureKind::Array,
        ] {
            assert_eq!(StructureKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_keys_stay_in_keyspace() {
        let params = WorkloadParams { keyspace: 10 };
        let mut rng = Rng::with_seed(7);
        assert!((0..1000).all(|_| params.key(&mut rng) < 10));

        let degenerate = WorkloadParams { keyspace: 0 };
        assert_eq!(degenerate.key(&mut rng), 0);
    }
}
