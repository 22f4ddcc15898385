//! Central allocator seam.
//!
//! The central free list sits behind the transfer cache and is the last
//! stop for batches in either direction. Real page and span management is
//! out of scope here; [`ShadowCentral`] is a self-contained implementation
//! that keeps released objects in per-class lists and, when asked to,
//! mints fresh addresses from a bump offset.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::size_class::SizeMap;

/// Central allocator consumed by the transfer cache.
pub trait CentralFreeList: Send + Sync {
    /// Fills the front of `out` with up to `out.len()` objects of class
    /// `cl` and returns how many were written. A short count means the
    /// central allocator is exhausted.
    fn acquire_batch(&self, cl: usize, out: &mut [usize]) -> usize;

    /// Takes ownership of `items`, all of class `cl`.
    fn release_batch(&self, cl: usize, items: &[usize]);
}

impl<T: CentralFreeList + ?Sized> CentralFreeList for &T {
    fn acquire_batch(&self, cl: usize, out: &mut [usize]) -> usize {
        (**self).acquire_batch(cl, out)
    }

    fn release_batch(&self, cl: usize, items: &[usize]) {
        (**self).release_batch(cl, items)
    }
}

impl<T: CentralFreeList + ?Sized> CentralFreeList for Arc<T> {
    fn acquire_batch(&self, cl: usize, out: &mut [usize]) -> usize {
        (**self).acquire_batch(cl, out)
    }

    fn release_batch(&self, cl: usize, items: &[usize]) {
        (**self).release_batch(cl, items)
    }
}

/// First fabricated address; keeps object handles clear of the zero page.
const FIRST_OFFSET: usize = 0x1000;

/// In-memory central free list.
#[derive(Debug)]
pub struct ShadowCentral {
    bins: Box<[Mutex<Vec<usize>>]>,
    class_sizes: Box<[usize]>,
    fabricate: bool,
    next_offset: AtomicUsize,
    fabricated: AtomicU64,
    acquire_calls: AtomicU64,
    release_calls: AtomicU64,
}

impl ShadowCentral {
    fn build(sizes: &impl SizeMap, fabricate: bool) -> Self {
        let n = sizes.num_classes();
        Self {
            bins: (0..n).map(|_| Mutex::new(Vec::new())).collect(),
            class_sizes: (0..n).map(|cl| sizes.class_to_size(cl)).collect(),
            fabricate,
            next_offset: AtomicUsize::new(FIRST_OFFSET),
            fabricated: AtomicU64::new(0),
            acquire_calls: AtomicU64::new(0),
            release_calls: AtomicU64::new(0),
        }
    }

    /// A central list that only hands back what was released to it.
    #[must_use]
    pub fn new(sizes: &impl SizeMap) -> Self {
        Self::build(sizes, false)
    }

    /// A central list that mints new objects once a class runs dry.
    #[must_use]
    pub fn fabricating(sizes: &impl SizeMap) -> Self {
        Self::build(sizes, true)
    }

    /// Adds objects to class `cl` without counting a release.
    pub fn seed(&self, cl: usize, items: &[usize]) {
        if let Some(bin) = self.bins.get(cl) {
            bin.lock().extend_from_slice(items);
        }
    }

    fn mint(&self, cl: usize) -> Option<usize> {
        let size = self.class_sizes.get(cl).copied().filter(|&s| s > 0)?;
        let offset = self
            .next_offset
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                cur.checked_add(size)
            })
            .ok()?;
        self.fabricated.fetch_add(1, Ordering::Relaxed);
        Some(offset)
    }

    /// Objects currently held for class `cl`.
    #[must_use]
    pub fn len(&self, cl: usize) -> usize {
        self.bins.get(cl).map_or(0, |bin| bin.lock().len())
    }

    /// Objects currently held across all classes.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.bins.iter().map(|bin| bin.lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Copy of the objects held for class `cl`.
    #[must_use]
    pub fn contents(&self, cl: usize) -> Vec<usize> {
        self.bins.get(cl).map_or_else(Vec::new, |bin| bin.lock().clone())
    }

    /// Wrapping sum of every held object address.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        self.bins
            .iter()
            .flat_map(|bin| bin.lock().clone())
            .fold(0u64, |acc, item| acc.wrapping_add(item as u64))
    }

    #[must_use]
    pub fn fabricated(&self) -> u64 {
        self.fabricated.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn acquire_calls(&self) -> u64 {
        self.acquire_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn release_calls(&self) -> u64 {
        self.release_calls.load(Ordering::Relaxed)
    }
}

impl CentralFreeList for ShadowCentral {
    fn acquire_batch(&self, cl: usize, out: &mut [usize]) -> usize {
        self.acquire_calls.fetch_add(1, Ordering::Relaxed);
        let Some(bin) = self.bins.get(cl) else {
            return 0;
        };
        let mut filled = {
            let mut bin = bin.lock();
            let take = out.len().min(bin.len());
            let start = bin.len() - take;
            out[..take].copy_from_slice(&bin[start..]);
            bin.truncate(start);
            take
        };
        if self.fabricate {
            while filled < out.len() {
                let Some(item) = self.mint(cl) else { break };
                out[filled] = item;
                filled += 1;
            }
        }
        filled
    }

    fn release_batch(&self, cl: usize, items: &[usize]) {
        self.release_calls.fetch_add(1, Ordering::Relaxed);
        if items.is_empty() {
            return;
        }
        match self.bins.get(cl) {
            Some(bin) => bin.lock().extend_from_slice(items),
            None => log::warn!(
                "percpu-alloc: dropping {} objects released to unknown class {cl}",
                items.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::SizeClassTable;

    #[test]
    fn non_fabricating_central_returns_only_what_it_holds() {
        let central = ShadowCentral::new(&SizeClassTable::reference());
        let mut out = [0usize; 4];
        assert_eq!(central.acquire_batch(3, &mut out), 0);

        central.release_batch(3, &[0x100, 0x200]);
        assert_eq!(central.len(3), 2);
        assert_eq!(central.acquire_batch(3, &mut out), 2);
        assert_eq!(&out[..2], &[0x100, 0x200]);
        assert!(central.is_empty());
    }

    #[test]
    fn fabricated_objects_are_distinct_and_nonzero() {
        let table = SizeClassTable::reference();
        let central = ShadowCentral::fabricating(&table);
        let mut out = [0usize; 8];
        assert_eq!(central.acquire_batch(4, &mut out), 8);
        assert!(out.iter().all(|&a| a >= FIRST_OFFSET));
        let mut sorted = out.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 8);
        assert_eq!(central.fabricated(), 8);
        // Neighbouring objects are one class size apart.
        assert_eq!(out[1] - out[0], table.class_to_size(4));
    }

    #[test]
    fn class_zero_is_never_fabricated() {
        let central = ShadowCentral::fabricating(&SizeClassTable::reference());
        let mut out = [0usize; 2];
        assert_eq!(central.acquire_batch(0, &mut out), 0);
    }

    #[test]
    fn released_objects_are_reused_before_fabricating() {
        let central = ShadowCentral::fabricating(&SizeClassTable::reference());
        central.release_batch(2, &[0xdead0]);
        let mut out = [0usize; 3];
        assert_eq!(central.acquire_batch(2, &mut out), 3);
        assert_eq!(out[0], 0xdead0);
        assert_eq!(central.fabricated(), 2);
    }

    #[test]
    fn checksum_tracks_contents() {
        let central = ShadowCentral::new(&SizeClassTable::reference());
        central.seed(1, &[10, 20]);
        central.seed(5, &[30]);
        assert_eq!(central.checksum(), 60);
        assert_eq!(central.release_calls(), 0);
        assert_eq!(central.contents(1), vec![10, 20]);
    }
}
