//! Block-padded kernel grid ranges.

use crate::Result;
use oldies_core::pad_to_multiple;
use serde::{Deserialize, Serialize};

/// Kernels whose thread grids are partitioned between groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelCategory {
    NeuronUpdate,
    PresynapticUpdate,
    PostsynapticLearning,
    SynapseDynamics,
    /// Device initialisation of dense state and sparse connectivity
    Initialization,
    /// Device initialisation of individual weights of sparse populations
    SparseInitialization,
}

/// Threads per block for each generated kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelBlockSizes {
    pub neuron: usize,
    pub synapse: usize,
    pub learn: usize,
    pub synapse_dynamics: usize,
    pub init: usize,
    pub init_sparse: usize,
}

impl Default for KernelBlockSizes {
    fn default() -> Self {
        Self {
            neuron: 32,
            synapse: 32,
            learn: 32,
            synapse_dynamics: 32,
            init: 32,
            init_sparse: 32,
        }
    }
}

impl KernelBlockSizes {
    pub fn for_category(&self, category: KernelCategory) -> usize {
        match category {
            KernelCategory::NeuronUpdate => self.neuron,
            KernelCategory::PresynapticUpdate => self.synapse,
            KernelCategory::PostsynapticLearning => self.learn,
            KernelCategory::SynapseDynamics => self.synapse_dynamics,
            KernelCategory::Initialization => self.init,
            KernelCategory::SparseInitialization => self.init_sparse,
        }
    }
}

/// Half-open thread range `[start, end)` owned by one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaddedRange {
    pub start: usize,
    pub end: usize,
}

impl PaddedRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Allocate `count` threads, padded to `block_size`, at `*offset` and advance it
pub fn calc_block_padded_range(
    count: usize,
    block_size: usize,
    offset: &mut usize,
) -> Result<PaddedRange> {
    let start = *offset;
    *offset += pad_to_multiple(count, block_size)?;
    Ok(PaddedRange {
        start,
        end: *offset,
    })
}

/// Running offset for one kernel category
#[derive(Debug, Clone)]
pub(crate) struct GridAccumulator {
    block_size: usize,
    offset: usize,
}

impl GridAccumulator {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            offset: 0,
        }
    }

    pub fn allocate(&mut self, count: usize) -> Result<PaddedRange> {
        calc_block_padded_range(count, self.block_size, &mut self.offset)
    }

    pub fn total(&self) -> usize {
        self.offset
    }
}

/// Total threads in each kernel's grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GridSizes {
    pub neuron: usize,
    pub synapse: usize,
    pub post_learn: usize,
    pub synapse_dynamics: usize,
    pub init: usize,
    pub init_sparse: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_ranges_are_contiguous() {
        let mut offset = 0;
        let a = calc_block_padded_range(10, 32, &mut offset).unwrap();
        let b = calc_block_padded_range(33, 32, &mut offset).unwrap();
        let c = calc_block_padded_range(0, 32, &mut offset).unwrap();
        assert_eq!(a, PaddedRange { start: 0, end: 32 });
        assert_eq!(b, PaddedRange { start: 32, end: 96 });
        assert!(c.is_empty());
        assert_eq!(offset, 96);
    }

    #[test]
    fn test_zero_block_size() {
        let mut offset = 0;
        assert!(calc_block_padded_range(4, 0, &mut offset).is_err());
    }

    #[test]
    fn test_accumulator() {
        let mut acc = GridAccumulator::new(64);
        acc.allocate(1).unwrap();
        let r = acc.allocate(65).unwrap();
        assert_eq!(r.len(), 128);
        assert_eq!(acc.total(), 192);
    }

    #[test]
    fn test_block_size_lookup() {
        let sizes = KernelBlockSizes {
            learn: 128,
            ..Default::default()
        };
        assert_eq!(sizes.for_category(KernelCategory::PostsynapticLearning), 128);
        assert_eq!(sizes.for_category(KernelCategory::NeuronUpdate), 32);
        assert_eq!(sizes.for_category(KernelCategory::SparseInitialization), 32);
    }
}
