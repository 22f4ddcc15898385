//! Atomic counters for cache observability.
//!
//! All counters use relaxed ordering. They are diagnostic only and never
//! used to synchronize anything.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Increment a counter by 1.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Add `n` to a counter.
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Read a counter value.
pub fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Restartable-section counters for one slab.
#[derive(Debug, Default)]
pub struct SectionMetrics {
    /// Sections entered, including restarts.
    pub entered: AtomicU64,
    /// Claims that found the CPU word already held.
    pub contended: AtomicU64,
    /// Commits abandoned because the thread changed CPU.
    pub migration_aborts: AtomicU64,
}

impl SectionMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entered: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            migration_aborts: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SectionSnapshot {
        SectionSnapshot {
            entered: get(&self.entered),
            contended: get(&self.contended),
            migration_aborts: get(&self.migration_aborts),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SectionSnapshot {
    pub entered: u64,
    pub contended: u64,
    pub migration_aborts: u64,
}

impl SectionSnapshot {
    /// Sections that had to start over for any reason.
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.contended + self.migration_aborts
    }
}

/// Cache-front counters.
#[derive(Debug, Default)]
pub struct CpuCacheMetrics {
    /// Objects handed out.
    pub allocs: AtomicU64,
    /// Objects taken back.
    pub frees: AtomicU64,
    /// Allocations the slab could not serve directly.
    pub underflows: AtomicU64,
    /// Frees the slab could not absorb directly.
    pub overflows: AtomicU64,
    /// Slab capacity grown by an underflow or overflow.
    pub grows: AtomicU64,
    /// Batches moved from the slab to the transfer cache.
    pub drains_to_transfer: AtomicU64,
    /// Batches moved from the transfer cache to the slab.
    pub refills_from_transfer: AtomicU64,
    /// Allocations that found nothing anywhere.
    pub exhausted: AtomicU64,
}

impl CpuCacheMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            underflows: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            grows: AtomicU64::new(0),
            drains_to_transfer: AtomicU64::new(0),
            refills_from_transfer: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> CpuCacheSnapshot {
        CpuCacheSnapshot {
            allocs: get(&self.allocs),
            frees: get(&self.frees),
            underflows: get(&self.underflows),
            overflows: get(&self.overflows),
            grows: get(&self.grows),
            drains_to_transfer: get(&self.drains_to_transfer),
            refills_from_transfer: get(&self.refills_from_transfer),
            exhausted: get(&self.exhausted),
        }
    }
}

/// Point-in-time copy of [`CpuCacheMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuCacheSnapshot {
    pub allocs: u64,
    pub frees: u64,
    pub underflows: u64,
    pub overflows: u64,
    pub grows: u64,
    pub drains_to_transfer: u64,
    pub refills_from_transfer: u64,
    pub exhausted: u64,
}

impl CpuCacheSnapshot {
    /// Fraction of allocations served without leaving the slab, in
    /// permille.
    #[must_use]
    pub fn hit_rate_permille(&self) -> u16 {
        if self.allocs == 0 {
            return 0;
        }
        let hits = self.allocs.saturating_sub(self.underflows);
        ((hits.saturating_mul(1000)) / self.allocs).min(1000) as u16
    }
}
