//! Size classes.
//!
//! The caches never decide sizes themselves; they consume a [`SizeMap`]
//! that reports how many classes exist, how large each class's objects are
//! and how many objects move between tiers in one batch. Class 0 is
//! reserved and never holds objects.
//!
//! [`SizeClassTable`] is a reference table for tests, the harness and the
//! benches. Sizes follow a geometric progression from 16 bytes to 32 KiB.

use crate::MAX_OBJECTS_TO_MOVE;
use crate::experiment::{Experiment, ExperimentSet};

/// Size-class collaborator consumed by the caches.
pub trait SizeMap: Send + Sync {
    /// Number of classes, including reserved class 0.
    fn num_classes(&self) -> usize;

    /// Object size of `cl` in bytes; 0 for class 0.
    fn class_to_size(&self, cl: usize) -> usize;

    /// Objects moved per batch for `cl`; 0 for class 0.
    fn num_objects_to_move(&self, cl: usize) -> usize;
}

impl<T: SizeMap + ?Sized> SizeMap for &T {
    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn class_to_size(&self, cl: usize) -> usize {
        (**self).class_to_size(cl)
    }

    fn num_objects_to_move(&self, cl: usize) -> usize {
        (**self).num_objects_to_move(cl)
    }
}

/// Smallest object size served.
pub const MIN_SIZE: usize = 16;

/// Largest object size served by a size class.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

/// Bytes moved per batch; the batch size is this divided by object size.
const BATCH_BYTES: usize = 64 * 1024;

const MIN_BATCH: usize = 2;
const MAX_BATCH: usize = 32;

/// Bins 1-8: 16-byte steps, 9-16: 32-byte steps, then wider steps up to
/// 32 KiB.
const GEOMETRIC: [usize; 32] = [
    16, 32, 48, 64, 80, 96, 112, 128, //
    160, 192, 224, 256, 288, 320, 352, 384, //
    448, 512, 640, 768, 896, 1024, 1280, 1536, //
    2048, 2560, 3072, 4096, 8192, 16384, 24576, 32768,
];

/// Objects moved per batch for objects of `size` bytes.
#[must_use]
pub fn batch_size_for(size: usize) -> usize {
    debug_assert!(MAX_BATCH <= MAX_OBJECTS_TO_MOVE);
    (BATCH_BYTES / size.max(1)).clamp(MIN_BATCH, MAX_BATCH)
}

/// Reference size-class table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClassTable {
    /// `sizes[0]` is 0 for the reserved class.
    sizes: Vec<usize>,
    batches: Vec<usize>,
}

impl SizeClassTable {
    fn from_sizes(sizes: impl IntoIterator<Item = usize>) -> Self {
        let sizes: Vec<usize> = std::iter::once(0).chain(sizes).collect();
        let batches = sizes
            .iter()
            .map(|&size| if size == 0 { 0 } else { batch_size_for(size) })
            .collect();
        Self { sizes, batches }
    }

    /// The default geometric table.
    #[must_use]
    pub fn reference() -> Self {
        Self::from_sizes(GEOMETRIC)
    }

    /// Powers of two only, 16 B to 32 KiB.
    #[must_use]
    pub fn pow2() -> Self {
        Self::from_sizes((4..=15).map(|shift| 1usize << shift))
    }

    /// Powers of two below 64 bytes, geometric above.
    #[must_use]
    pub fn pow2_below64() -> Self {
        Self::from_sizes(
            GEOMETRIC
                .into_iter()
                .filter(|&size| size >= 64 || size.is_power_of_two()),
        )
    }

    /// Picks the table variant requested by the active experiments.
    #[must_use]
    pub fn for_experiments(experiments: ExperimentSet) -> Self {
        if experiments.is_active(Experiment::TEST_ONLY_TCMALLOC_POW2_SIZECLASS) {
            Self::pow2()
        } else if experiments.is_active(Experiment::TEST_ONLY_TCMALLOC_POW2_BELOW64_SIZECLASS) {
            Self::pow2_below64()
        } else {
            Self::reference()
        }
    }

    /// Smallest class whose objects hold `size` bytes, or `None` above
    /// [`MAX_SMALL_SIZE`].
    #[must_use]
    pub fn class_for_size(&self, size: usize) -> Option<usize> {
        let size = size.max(MIN_SIZE);
        if size > MAX_SMALL_SIZE {
            return None;
        }
        // Linear scan; the table is short.
        self.sizes
            .iter()
            .enumerate()
            .skip(1)
            .find(|&(_, &class_size)| size <= class_size)
            .map(|(cl, _)| cl)
    }
}

impl Default for SizeClassTable {
    fn default() -> Self {
        Self::reference()
    }
}

impl SizeMap for SizeClassTable {
    fn num_classes(&self) -> usize {
        self.sizes.len()
    }

    fn class_to_size(&self, cl: usize) -> usize {
        self.sizes.get(cl).copied().unwrap_or(0)
    }

    fn num_objects_to_move(&self, cl: usize) -> usize {
        self.batches.get(cl).copied().unwrap_or(0)
    }
}

/// A base size map repeated once per NUMA partition.
///
/// Class `p * base + b` has the size and batch of base class `b`. The first
/// class of every partition is reserved like class 0.
#[derive(Debug, Clone)]
pub struct PartitionedSizeMap<M> {
    base: M,
    partitions: usize,
}

impl<M: SizeMap> PartitionedSizeMap<M> {
    #[must_use]
    pub fn new(base: M, partitions: usize) -> Self {
        Self {
            base,
            partitions: partitions.max(1),
        }
    }

    #[must_use]
    pub fn base(&self) -> &M {
        &self.base
    }

    #[must_use]
    pub fn num_base_classes(&self) -> usize {
        self.base.num_classes()
    }

    #[must_use]
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Base class of an expanded class.
    #[must_use]
    pub fn base_class(&self, cl: usize) -> usize {
        cl % self.base.num_classes().max(1)
    }
}

impl<M: SizeMap> SizeMap for PartitionedSizeMap<M> {
    fn num_classes(&self) -> usize {
        self.base.num_classes() * self.partitions
    }

    fn class_to_size(&self, cl: usize) -> usize {
        self.base.class_to_size(self.base_class(cl))
    }

    fn num_objects_to_move(&self, cl: usize) -> usize {
        self.base.num_objects_to_move(self.base_class(cl))
    }
}
