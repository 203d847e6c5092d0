//! # Per-Node Pools
//!
//! A fixed array of instances placed on one NUMA node, each behind its
//! own mutex. Workers on any node may reach into any pool; the mutex is the
//! only thing that serializes them.

use parking_lot::Mutex;

use crate::numa::{NodeBox, NodeLocalAllocator, NodePlacement, NumaError, NumaNodeId};

/// Node-local instances of `T`, one mutex each.
///
/// The pool and every instance live in memory from the same allocator, and
/// are returned to it when the pool is dropped.
pub struct PerNodePool<'a, T> {
    node: NumaNodeId,
    entries: Vec<NodeBox<'a, Mutex<T>>>,
}

impl<'a, T> PerNodePool<'a, T> {
    /// Allocate `size` instances on `node`.
    ///
    /// `init` builds each instance and receives a placement for the same
    /// node, so anything the instance allocates later lands there too.
    ///
    /// # Errors
    ///
    /// Returns the first allocation error. Instances built before the
    /// failure are freed.
    pub fn new<F>(
        allocator: &'a NodeLocalAllocator,
        node: NumaNodeId,
        size: usize,
        mut init: F,
    ) -> Result<Self, NumaError>
    where
        F: FnMut(NodePlacement<'a>) -> Result<T, NumaError>,
    {
        let placement = allocator.placement(node);
        let mut entries = Vec::with_capacity(size);
        for _ in 0..size {
            let value = init(placement)?;
            entries.push(placement.boxed(Mutex::new(value))?);
        }

        tracing::debug!(
            %node,
            size,
            backend = allocator.backend_name(),
            "built per-node pool"
        );
        Ok(Self { node, entries })
    }

    /// Run `f` on instance `index` while holding its mutex.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    #[inline]
    pub fn with_instance<R>(&self, index: usize, f: impl FnOnce(&mut T) -> R) -> R {
        assert!(
            index < self.entries.len(),
            "pool index {index} out of range for node {} pool of {}",
            self.node,
            self.entries.len()
        );
        let mut guard = self.entries[index].lock();
        f(&mut guard)
    }

    /// Node the instances live on.
    #[must_use]
    pub fn node(&self) -> NumaNodeId {
        self.node
    }

    /// Number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the pool has no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> std::fmt::Debug for PerNodePool<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerNodePool")
            .field("node", &self.node)
            .field("len", &self.entries.len())
            .finish()
    }
}
