//! Unbalanced binary search tree over `u64` keys.

use fastrand::Rng;

use super::{Workload, WorkloadParams};
use crate::numa::{NodeBox, NodePlacement, NumaError};

/// Tree operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOp {
    /// Insert a key; duplicates are ignored.
    Insert(u64),
    /// Search for a key.
    Lookup(u64),
}

type Subtree<'a> = Option<NodeBox<'a, TreeNode<'a>>>;

struct TreeNode<'a> {
    key: u64,
    left: Subtree<'a>,
    right: Subtree<'a>,
}

/// Binary search tree with node-local nodes.
///
/// Keys accumulate over a run, so lookups and inserts get slower as the
/// tree grows. Repeated runs average that drift out.
pub struct Tree<'a> {
    place: NodePlacement<'a>,
    root: Subtree<'a>,
    len: usize,
}

impl<'a> Tree<'a> {
    /// Empty tree placing its nodes through `place`.
    #[must_use]
    pub fn new(place: NodePlacement<'a>) -> Self {
        Self {
            place,
            root: None,
            len: 0,
        }
    }

    /// Insert `key`. Returns false if it was already present.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if the node cannot be placed.
    pub fn insert(&mut self, key: u64) -> Result<bool, NumaError> {
        let place = self.place;
        let mut slot = &mut self.root;
        while let Some(node) = slot {
            if key == node.key {
                return Ok(false);
            }
            slot = if key < node.key {
                &mut node.left
            } else {
                &mut node.right
            };
        }

        *slot = Some(place.boxed(TreeNode {
            key,
            left: None,
            right: None,
        })?);
        self.len += 1;
        Ok(true)
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn lookup(&self, key: u64) -> bool {
        let mut cursor = self.root.as_deref();
        while let Some(node) = cursor {
            if key == node.key {
                return true;
            }
            cursor = if key < node.key {
                node.left.as_deref()
            } else {
                node.right.as_deref()
            };
        }
        false
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the tree is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Keys in ascending order.
    #[must_use]
    pub fn keys(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut cursor = self.root.as_deref();
        loop {
            while let Some(node) = cursor {
                stack.push(node);
                cursor = node.left.as_deref();
            }
            let Some(node) = stack.pop() else {
                return out;
            };
            out.push(node.key);
            cursor = node.right.as_deref();
        }
    }
}

impl Drop for Tree<'_> {
    fn drop(&mut self) {
        let mut pending: Vec<_> = self.root.take().into_iter().collect();
        while let Some(mut node) = pending.pop() {
            pending.extend(node.left.take());
            pending.extend(node.right.take());
        }
    }
}

impl<'a> Workload<'a> for Tree<'a> {
    type Op = TreeOp;

    fn create(placement: NodePlacement<'a>, _params: &WorkloadParams) -> Result<Self, NumaError> {
        Ok(Self::new(placement))
    }

    #[inline]
    fn pick_op(selector: u32, rng: &mut Rng, params: &WorkloadParams) -> TreeOp {
        if selector <= 90 {
            TreeOp::Insert(params.key(rng))
        } else {
            TreeOp::Lookup(params.key(rng))
        }
    }

    #[inline]
    fn apply(&mut self, op: TreeOp) -> Result<(), NumaError> {
        match op {
            TreeOp::Insert(key) => {
                self.insert(key)?;
            }
            TreeOp::Lookup(key) => {
                std::hint::black_box(self.lookup(key));
            }
        }
        Ok(())
    }

    fn default_prefill_depth(params: &WorkloadParams) -> usize {
        usize::try_from(params.keyspace / 2).unwrap_or(usize::MAX)
    }

    fn prefill(
        &mut self,
        rng: &mut Rng,
        params: &WorkloadParams,
        depth: usize,
    ) -> Result<(), NumaError> {
        for _ in 0..depth {
            self.insert(params.key(rng))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::{NodeLocalAllocator, NumaNodeId};

    #[test]
    fn test_insert_and_lookup() {
        let alloc = NodeLocalAllocator::system();
        let mut tree = Tree::new(alloc.placement(NumaNodeId::new(0)));

        for key in [50, 30, 70, 20, 40, 60, 80] {
            assert!(tree.insert(key).unwrap());
        }
        assert!(!tree.insert(40).unwrap());
        assert_eq!(tree.len(), 7);

        assert!(tree.lookup(60));
        assert!(!tree.lookup(65));
        assert_eq!(tree.keys(), vec![20, 30, 40, 50, 60, 70, 80]);
    }

    #[test]
    fn test_op_mix_ninety_ten() {
        let params = WorkloadParams { keyspace: 100 };
        let mut rng = Rng::with_seed(1);
        assert!(matches!(Tree::pick_op(90, &mut rng, &params), TreeOp::Insert(k) if k < 100));
        assert!(matches!(Tree::pick_op(91, &mut rng, &params), TreeOp::Lookup(_)));
    }

    #[test]
    fn test_prefill_defaults_to_half_keyspace() {
        let params = WorkloadParams { keyspace: 1000 };
        assert_eq!(Tree::default_prefill_depth(&params), 500);

        let alloc = NodeLocalAllocator::system();
        let mut tree = Tree::new(alloc.placement(NumaNodeId::new(0)));
        let mut rng = Rng::with_seed(123);
        tree.prefill(&mut rng, &params, 500).unwrap();
        // Duplicate draws are dropped
        assert!(tree.len() <= 500 && tree.len() > 300);
    }

    #[test]
    fn test_degenerate_tree_drops_iteratively() {
        let alloc = NodeLocalAllocator::system();
        let mut tree = Tree::new(alloc.placement(NumaNodeId::new(0)));
        // Ascending keys build a 20k-deep right spine
        for key in 0..20_000 {
            tree.insert(key).unwrap();
        }
        assert!(tree.lookup(19_999));
        drop(tree);
    }
}
