//! FIFO queue over a singly linked chain.
//!
//! `head` owns the chain and `tail` points at its last node, so enqueue and
//! dequeue each touch one node.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use fastrand::Rng;

use super::chain::{drop_chain, values, ChainNode, Link};
use super::{Workload, WorkloadParams};
use crate::numa::{NodeBox, NodePlacement, NumaError};

/// Queue operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    /// Add a value at the back.
    Enqueue(u64),
    /// Remove the front value, if any.
    Dequeue,
}

/// FIFO queue with node-local nodes.
pub struct Queue<'a> {
    place: NodePlacement<'a>,
    head: Link<'a>,
    // Last node of the chain owned by `head`; None iff `head` is None
    tail: Option<NonNull<ChainNode<'a>>>,
    len: usize,
}

// SAFETY: `tail` only ever points into the chain `head` owns, so moving the
// queue to another thread moves sole access to that node with it
unsafe impl Send for Queue<'_> {}

impl<'a> Queue<'a> {
    /// Empty queue placing its nodes through `place`.
    #[must_use]
    pub fn new(place: NodePlacement<'a>) -> Self {
        Self {
            place,
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Add `value` at the back.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if the node cannot be placed.
    pub fn enqueue(&mut self, value: u64) -> Result<(), NumaError> {
        let mut node = self.place.boxed(ChainNode::new(value))?;
        let last = NodeBox::as_non_null(&mut node);
        match self.tail {
            // SAFETY: tail is the live last node of the chain owned by head,
            // and &mut self gives exclusive access to it
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(last);
        self.len += 1;
        Ok(())
    }

    /// Remove and return the front value.
    pub fn dequeue(&mut self) -> Option<u64> {
        let mut node = self.head.take()?;
        self.head = node.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(node.value)
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Values in dequeue order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u64> {
        values(&self.head).collect()
    }
}

impl Drop for Queue<'_> {
    fn drop(&mut self) {
        self.tail = None;
        drop_chain(self.head.take());
    }
}

impl<'a> Workload<'a> for Queue<'a> {
    type Op = QueueOp;

    fn create(placement: NodePlacement<'a>, _params: &WorkloadParams) -> Result<Self, NumaError> {
        Ok(Self::new(placement))
    }

    #[inline]
    fn pick_op(selector: u32, rng: &mut Rng, params: &WorkloadParams) -> QueueOp {
        if selector <= 50 {
            QueueOp::Enqueue(params.key(rng))
        } else {
            QueueOp::Dequeue
        }
    }

    #[inline]
    fn apply(&mut self, op: QueueOp) -> Result<(), NumaError> {
        match op {
            QueueOp::Enqueue(value) => self.enqueue(value),
            QueueOp::Dequeue => {
                std::hint::black_box(self.dequeue());
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
            self.enqueue(params.key(rng))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::{NodeLocalAllocator, NumaNodeId};

    #[test]
    fn test_fifo_order_through_empty() {
        let alloc = NodeLocalAllocator::system();
        let mut queue = Queue::new(alloc.placement(NumaNodeId::new(0)));

        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        assert_eq!(queue.dequeue(), Some(1));

        queue.enqueue(3).unwrap();
        queue.enqueue(4).unwrap();
        assert_eq!(queue.to_vec(), vec![2, 3, 4]);

        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), Some(4));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());

        // Tail must be reset once drained
        queue.enqueue(5).unwrap();
        assert_eq!(queue.to_vec(), vec![5]);
        assert_eq!(queue.dequeue(), Some(5));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_interleaved_ops_after_deep_fill() {
        let alloc = NodeLocalAllocator::system();
        let mut queue = Queue::new(alloc.placement(NumaNodeId::new(0)));
        let depth = 200_000u64;
        for value in 0..depth {
            queue.enqueue(value).unwrap();
        }

        // Each dequeue takes the oldest value while new values keep
        // landing at the back
        for i in 0..depth {
            assert_eq!(queue.dequeue(), Some(i));
            queue.enqueue(depth + i).unwrap();
        }
        assert_eq!(queue.len(), usize::try_from(depth).unwrap());
        assert_eq!(queue.dequeue(), Some(depth));
    }

    #[test]
    fn test_op_mix_threshold() {
        let params = WorkloadParams::default();
        let mut rng = Rng::with_seed(1);
        assert!(matches!(Queue::pick_op(50, &mut rng, &params), QueueOp::Enqueue(_)));
        assert_eq!(Queue::pick_op(51, &mut rng, &params), QueueOp::Dequeue);
    }

    #[test]
    fn test_prefill_then_drain() {
        let alloc = NodeLocalAllocator::system();
        let mut queue = Queue::new(alloc.placement(NumaNodeId::new(0)));
        let mut rng = Rng::with_seed(9);
        queue.prefill(&mut rng, &WorkloadParams::default(), 100).unwrap();
        assert_eq!(queue.len(), 100);

        let mut drained = 0;
        while queue.dequeue().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 100);
    }
}
