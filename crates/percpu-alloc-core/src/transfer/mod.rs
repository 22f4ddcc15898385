//! Transfer cache.
//!
//! One bounded batch cache per size class, shared by every CPU, between
//! the per-CPU slabs and the central free list. Two storage strategies
//! share one contract:
//!
//! - [`LegacyCache`]: a stack. A batch that does not fit goes straight to
//!   the central free list.
//! - [`RingCache`]: a ring buffer. Removal takes the newest objects; when
//!   full, the oldest objects are evicted to make room for new ones.
//!
//! Neither ever holds more than its current capacity, and no object is
//! duplicated or dropped: whatever is not stored is handed back to the
//! caller for release to the central free list.

mod legacy;
mod manager;
mod ring;

pub use legacy::LegacyCache;
pub use manager::{TransferCacheManager, TransferCacheOptions};
pub use ring::RingCache;

use serde::Serialize;

/// Storage strategy, chosen once at startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferCacheImplementation {
    #[default]
    Legacy,
    Ring,
}

impl TransferCacheImplementation {
    /// Label used in logs and statistics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Legacy => "LEGACY",
            Self::Ring => "RING",
        }
    }
}

impl std::fmt::Display for TransferCacheImplementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Occupancy bookkeeping shared by both strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotInfo {
    pub used: usize,
    pub capacity: usize,
    pub max_capacity: usize,
    /// Lowest `used` seen since the last plunder.
    pub low_water_mark: usize,
}

impl SlotInfo {
    #[must_use]
    pub fn new(capacity: usize, max_capacity: usize) -> Self {
        Self {
            used: 0,
            capacity: capacity.min(max_capacity),
            max_capacity,
            low_water_mark: 0,
        }
    }

    /// Free room below the current capacity.
    #[must_use]
    pub fn room(&self) -> usize {
        self.capacity - self.used
    }

    fn note_removal(&mut self) {
        self.low_water_mark = self.low_water_mark.min(self.used);
    }
}

/// Per-class storage, always used under the class lock.
pub trait ClassTransferCache {
    fn info(&self) -> SlotInfo;

    /// Stores all of `batch` if it fits, otherwise nothing.
    fn try_insert(&mut self, batch: &[usize]) -> bool;

    /// Stores `batch` into a cache without room for all of it. Objects that
    /// must go to the central free list are written to `spill` (at least
    /// `batch.len()` long); returns how many.
    fn insert_overflow(&mut self, batch: &[usize], spill: &mut [usize]) -> usize;

    /// Removes up to `out.len()` objects, newest first.
    fn remove(&mut self, out: &mut [usize]) -> usize;

    /// Adds `n` to the capacity unless that would pass the maximum.
    fn grow(&mut self, n: usize) -> bool;

    /// Takes up to `n` off the capacity. Objects that no longer fit are
    /// written to `spill`. Returns `None` when there is no capacity left
    /// to take, otherwise the number spilled.
    fn shrink(&mut self, n: usize, spill: &mut [usize]) -> Option<usize>;

    fn reset_low_water_mark(&mut self);

    /// Every cached object, oldest first.
    fn contents(&self) -> Vec<usize>;
}

/// The strategy in use for one class, resolved once.
#[derive(Debug)]
pub enum ClassCache {
    Legacy(LegacyCache),
    Ring(RingCache),
}

impl ClassCache {
    #[must_use]
    pub fn new(
        implementation: TransferCacheImplementation,
        capacity: usize,
        max_capacity: usize,
    ) -> Self {
        match implementation {
            TransferCacheImplementation::Legacy => {
                Self::Legacy(LegacyCache::new(capacity, max_capacity))
            }
            TransferCacheImplementation::Ring => Self::Ring(RingCache::new(capacity, max_capacity)),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $cache:ident => $call:expr) => {
        match $self {
            ClassCache::Legacy($cache) => $call,
            ClassCache::Ring($cache) => $call,
        }
    };
}

impl ClassTransferCache for ClassCache {
    fn info(&self) -> SlotInfo {
        dispatch!(self, c => c.info())
    }

    fn try_insert(&mut self, batch: &[usize]) -> bool {
        dispatch!(self, c => c.try_insert(batch))
    }

    fn insert_overflow(&mut self, batch: &[usize], spill: &mut [usize]) -> usize {
        dispatch!(self, c => c.insert_overflow(batch, spill))
    }

    fn remove(&mut self, out: &mut [usize]) -> usize {
        dispatch!(self, c => c.remove(out))
    }

    fn grow(&mut self, n: usize) -> bool {
        dispatch!(self, c => c.grow(n))
    }

    fn shrink(&mut self, n: usize, spill: &mut [usize]) -> Option<usize> {
        dispatch!(self, c => c.shrink(n, spill))
    }

    fn reset_low_water_mark(&mut self) {
        dispatch!(self, c => c.reset_low_water_mark())
    }

    fn contents(&self) -> Vec<usize> {
        dispatch!(self, c => c.contents())
    }
}

/// Per-class statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferCacheStats {
    pub class: usize,
    pub insert_hits: u64,
    pub insert_misses: u64,
    pub remove_hits: u64,
    pub remove_misses: u64,
    pub used: usize,
    pub capacity: usize,
    pub max_capacity: usize,
}

impl TransferCacheStats {
    /// Accumulates `other` into `self`, ignoring the class id.
    pub fn merge(&mut self, other: &TransferCacheStats) {
        self.insert_hits += other.insert_hits;
        self.insert_misses += other.insert_misses;
        self.remove_hits += other.remove_hits;
        self.remove_misses += other.remove_misses;
        self.used += other.used;
        self.capacity += other.capacity;
        self.max_capacity += other.max_capacity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        assert_eq!(TransferCacheImplementation::Legacy.label(), "LEGACY");
        assert_eq!(TransferCacheImplementation::Ring.to_string(), "RING");
        assert_eq!(
            TransferCacheImplementation::default(),
            TransferCacheImplementation::Legacy
        );
    }

    #[test]
    fn both_strategies_honour_capacity() {
        for implementation in [
            TransferCacheImplementation::Legacy,
            TransferCacheImplementation::Ring,
        ] {
            let mut cache = ClassCache::new(implementation, 4, 8);
            assert!(cache.try_insert(&[1, 2, 3]));
            assert!(!cache.try_insert(&[4, 5]));
            assert_eq!(cache.info().used, 3);

            let mut spill = [0usize; 2];
            let spilled = cache.insert_overflow(&[4, 5], &mut spill);
            let info = cache.info();
            assert!(info.used <= info.capacity, "{implementation}");
            // Conservation: stored plus spilled equals everything offered.
            assert_eq!(info.used + spilled, 5, "{implementation}");
        }
    }

    #[test]
    fn stats_merge() {
        let mut total = TransferCacheStats::default();
        let one = TransferCacheStats {
            class: 3,
            insert_hits: 2,
            used: 5,
            capacity: 8,
            max_capacity: 16,
            ..TransferCacheStats::default()
        };
        total.merge(&one);
        total.merge(&one);
        assert_eq!(total.insert_hits, 4);
        assert_eq!(total.capacity, 16);
        assert_eq!(total.class, 0);
    }
}
