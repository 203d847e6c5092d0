//! Singly linked list with tail append.
//!
//! Append walks from the head to the tail on every call, so cost grows with
//! the list. That walk is the memory traffic this workload measures.

use fastrand::Rng;

use super::chain::{drop_chain, values, ChainNode, Link};
use super::{Workload, WorkloadParams};
use crate::numa::{NodePlacement, NumaError};

/// Linked-list operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOp {
    /// Append a value at the tail.
    Append(u64),
    /// Remove the oldest value.
    RemoveHead,
    /// Search for a value.
    Lookup(u64),
}

/// Singly linked list with node-local nodes.
pub struct LinkedList<'a> {
    place: NodePlacement<'a>,
    head: Link<'a>,
    len: usize,
}

impl<'a> LinkedList<'a> {
    /// Empty list placing its nodes through `place`.
    #[must_use]
    pub fn new(place: NodePlacement<'a>) -> Self {
        Self {
            place,
            head: None,
            len: 0,
        }
    }

    /// Append `value` after the current tail.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if the node cannot be placed.
    pub fn append(&mut self, value: u64) -> Result<(), NumaError> {
        let node = self.place.boxed(ChainNode::new(value))?;
        let mut cursor = &mut self.head;
        while let Some(existing) = cursor {
            cursor = &mut existing.next;
        }
        *cursor = Some(node);
        self.len += 1;
        Ok(())
    }

    /// Remove and return the head value.
    pub fn remove_head(&mut self) -> Option<u64> {
        let mut node = self.head.take()?;
        self.head = node.next.take();
        self.len -= 1;
        Some(node.value)
    }

    /// Returns true if `value` is in the list.
    #[must_use]
    pub fn lookup(&self, value: u64) -> bool {
        values(&self.head).any(|v| v == value)
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Values from head to tail.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u64> {
        values(&self.head).collect()
    }
}

impl Drop for LinkedList<'_> {
    fn drop(&mut self) {
        drop_chain(self.head.take());
    }
}

impl<'a> Workload<'a> for LinkedList<'a> {
    type Op = ListOp;

    fn create(placement: NodePlacement<'a>, _params: &WorkloadParams) -> Result<Self, NumaError> {
        Ok(Self::new(placement))
    }

    #[inline]
    fn pick_op(selector: u32, rng: &mut Rng, params: &WorkloadParams) -> ListOp {
        match selector {
            0..=33 => ListOp::Append(params.key(rng)),
            34..=66 => ListOp::RemoveHead,
            _ => ListOp::Lookup(params.key(rng)),
        }
    }

    #[inline]
    fn apply(&mut self, op: ListOp) -> Result<(), NumaError> {
        match op {
            ListOp::Append(value) => return self.append(value),
            ListOp::RemoveHead => {
                std::hint::black_box(self.remove_head());
            }
            ListOp::Lookup(value) => {
                std::hint::black_box(self.lookup(value));
            }
        }
        Ok(())
    }

    fn default_prefill_depth(_params: &WorkloadParams) -> usize {
        256
    }

    fn prefill(
        &mut self,
        rng: &mut Rng,
        params: &WorkloadParams,
        depth: usize,
    ) -> Result<(), NumaError> {
        for _ in 0..depth {
            self.append(params.key(rng))?;
        }
        Ok(())
    }
}
