//! Fixed-size array of `u64` cells in one node-local block.

use fastrand::Rng;

use super::{Workload, WorkloadParams};
use crate::numa::{NodeBox, NodePlacement, NumaError};

/// Cells per array instance (one 4 KiB page of `u64`s).
pub const ARRAY_CELLS: usize = 512;

/// Array operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayOp {
    /// Store `value` at `index`.
    Write {
        /// Cell index
        index: usize,
        /// Value to store
        value: u64,
    },
    /// Load the cell at `index`.
    Read {
        /// Cell index
        index: usize,
    },
}

/// Flat array placed as a single allocation.
pub struct Array<'a> {
    cells: NodeBox<'a, [u64; ARRAY_CELLS]>,
}

impl<'a> Array<'a> {
    /// Zeroed array placed through `place`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if the block cannot be placed.
    pub fn new(place: NodePlacement<'a>) -> Result<Self, NumaError> {
        Ok(Self {
            cells: place.boxed([0; ARRAY_CELLS])?,
        })
    }

    /// Store `value` at `index % ARRAY_CELLS`.
    #[inline]
    pub fn write(&mut self, index: usize, value: u64) {
        self.cells[index % ARRAY_CELLS] = value;
    }

    /// Load the cell at `index % ARRAY_CELLS`.
    #[inline]
    #[must_use]
    pub fn read(&self, index: usize) -> u64 {
        self.cells[index % ARRAY_CELLS]
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        ARRAY_CELLS
    }

    /// Always false; the array has a fixed size.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl<'a> Workload<'a> for Array<'a> {
    type Op = ArrayOp;

    fn create(placement: NodePlacement<'a>, _params: &WorkloadParams) -> Result<Self, NumaError> {
        Self::new(placement)
    }

    #[inline]
    fn pick_op(selector: u32, rng: &mut Rng, params: &WorkloadParams) -> ArrayOp {
        let index = rng.usize(..ARRAY_CELLS);
        if selector <= 50 {
            ArrayOp::Write {
                index,
                value: params.key(rng),
            }
        } else {
            ArrayOp::Read { index }
        }
    }

    #[inline]
    fn apply(&mut self, op: ArrayOp) -> Result<(), NumaError> {
        match op {
            ArrayOp::Write { index, value } => self.write(index, value),
            ArrayOp::Read { index } => {
                std::hint::black_box(self.read(index));
            }
        }
        Ok(())
    }

    fn default_prefill_depth(_params: &WorkloadParams) -> usize {
        ARRAY_CELLS
    }

    fn prefill(
        &mut self,
        rng: &mut Rng,
        params: &WorkloadParams,
        depth: usize,
    ) -> Result<(), NumaError> {
        for index in 0..depth.min(ARRAY_CELLS) {
            self.write(index, params.key(rng));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::{NodeLocalAllocator, NumaNodeId};

    #[test]
    fn test_write_then_read() {
        let alloc = NodeLocalAllocator::direct();
        let mut array = Array::new(alloc.placement(NumaNodeId::new(0))).unwrap();

        assert_eq!(array.read(7), 0);
        array.write(7, 99);
        assert_eq!(array.read(7), 99);
        // Indices wrap
        array.write(ARRAY_CELLS + 1, 5);
        assert_eq!(array.read(1), 5);
    }

    #[test]
    fn test_prefill_caps_at_cell_count() {
        let alloc = NodeLocalAllocator::system();
        let mut array = Array::new(alloc.placement(NumaNodeId::new(0))).unwrap();
        let params = WorkloadParams { keyspace: 10 };
        let mut rng = Rng::with_seed(5);

        array.prefill(&mut rng, &params, 10 * ARRAY_CELLS).unwrap();
        assert!((0..ARRAY_CELLS).all(|i| array.read(i) < 10));
    }

    #[test]
    fn test_op_mix_threshold() {
        let params = WorkloadParams::default();
        let mut rng = Rng::with_seed(1);
        assert!(matches!(Array::pick_op(50, &mut rng, &params), ArrayOp::Write { .. }));
        assert!(matches!(
            Array::pick_op(51, &mut rng, &params),
            ArrayOp::Read { index } if index < ARRAY_CELLS
        ));
    }
}
