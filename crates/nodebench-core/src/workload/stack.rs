//! LIFO stack.

use fastrand::Rng;

use super::chain::{drop_chain, values, ChainNode, Link};
use super::{Workload, WorkloadParams};
use crate::numa::{NodePlacement, NumaError};

/// Stack operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOp {
    /// Push a value.
    Push(u64),
    /// Pop the top value, if any.
    Pop,
}

/// Linked LIFO stack with node-local nodes.
pub struct Stack<'a> {
    place: NodePlacement<'a>,
    top: Link<'a>,
    len: usize,
}

impl<'a> Stack<'a> {
    /// Empty stack placing its nodes through `place`.
    #[must_use]
    pub fn new(place: NodePlacement<'a>) -> Self {
        Self {
            place,
            top: None,
            len: 0,
        }
    }

    /// Push `value` on top.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if the node cannot be placed.
    /// The stack is unchanged in that case.
    pub fn push(&mut self, value: u64) -> Result<(), NumaError> {
        let mut node = self.place.boxed(ChainNode::new(value))?;
        node.next = self.top.take();
        self.top = Some(node);
        self.len += 1;
        Ok(())
    }

    /// Remove and return the top value.
    pub fn pop(&mut self) -> Option<u64> {
        let mut node = self.top.take()?;
        self.top = node.next.take();
        self.len -= 1;
        Some(node.value)
    }

    /// The top value.
    #[must_use]
    pub fn peek(&self) -> Option<u64> {
        self.top.as_ref().map(|node| node.value)
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.top.is_none()
    }

    /// Values from top to bottom.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u64> {
        values(&self.top).collect()
    }
}

impl Drop for Stack<'_> {
    fn drop(&mut self) {
        drop_chain(self.top.take());
    }
}

impl<'a> Workload<'a> for Stack<'a> {
    type Op = StackOp;

    fn create(placement: NodePlacement<'a>, _params: &WorkloadParams) -> Result<Self, NumaError> {
        Ok(Self::new(placement))
    }

    #[inline]
    fn pick_op(selector: u32, rng: &mut Rng, params: &WorkloadParams) -> StackOp {
        if selector <= 50 {
            StackOp::Push(params.key(rng))
        } else {
            StackOp::Pop
        }
    }

    #[inline]
    fn apply(&mut self, op: StackOp) -> Result<(), NumaError> {
        match op {
            StackOp::Push(value) => self.push(value),
            StackOp::Pop => {
                std::hint::black_box(self.pop());
                Ok(())
            }
        }
    }

    fn default_prefill_depth(_params: &WorkloadParams) -> usize {
        1024
    }

    fn prefill(
        &mut self,
        rng: &mut Rng,
        params: &WorkloadParams,
        depth: usize,
    ) -> Result<(), NumaError> {
        for _ in 0..depth {
            self.push(params.key(rng))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::{NodeLocalAllocator, NumaNodeId};

    #[test]
    fn test_lifo_order() {
        let alloc = NodeLocalAllocator::system();
        let mut stack = Stack::new(alloc.placement(NumaNodeId::new(0)));

        for v in 1..=3 {
            stack.push(v).unwrap();
        }
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.peek(), Some(3));
        assert_eq!(stack.to_vec(), vec![3, 2, 1]);

        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_pop_on_empty_counts_as_op() {
        let alloc = NodeLocalAllocator::system();
        let mut stack = Stack::new(alloc.placement(NumaNodeId::new(0)));
        assert!(stack.apply(StackOp::Pop).is_ok());
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn test_op_mix_threshold() {
        let params = WorkloadParams::default();
        let mut rng = Rng::with_seed(1);
        assert!(matches!(Stack::pick_op(1, &mut rng, &params), StackOp::Push(_)));
        assert!(matches!(Stack::pick_op(50, &mut rng, &params), StackOp::Push(_)));
        assert_eq!(Stack::pick_op(51, &mut rng, &params), StackOp::Pop);
        assert_eq!(Stack::pick_op(100, &mut rng, &params), StackOp::Pop);
    }

    #[test]
    fn test_deep_stack_drops_iteratively() {
        let alloc = NodeLocalAllocator::system();
        let mut stack = Stack::new(alloc.placement(NumaNodeId::new(0)));
        let mut rng = Rng::with_seed(3);
        stack.prefill(&mut rng, &WorkloadParams::default(), 200_000).unwrap();
        assert_eq!(stack.len(), 200_000);
        drop(stack);
    }
}
