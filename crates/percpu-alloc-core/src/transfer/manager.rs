//! Per-class transfer caches and the eviction policy that moves capacity
//! between them.
//!
//! Each class has its own `parking_lot::Mutex`. No path holds two class
//! locks at once, and the central free list is only called with every lock
//! released. `used` and `capacity` are mirrored into atomics after every
//! mutation so that [`TransferCacheManager::has_spare_capacity`] can answer
//! without locking.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{ClassCache, ClassTransferCache, TransferCacheImplementation, TransferCacheStats};
use crate::MAX_OBJECTS_TO_MOVE;
use crate::central::CentralFreeList;
use crate::metrics;
use crate::size_class::SizeMap;

/// Capacity policy, in batches of the class's move size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCacheOptions {
    pub initial_batches: usize,
    pub max_batches: usize,
    /// Upper bound on bytes cached per class; large classes get fewer
    /// batches, but never less than one.
    pub max_class_bytes: usize,
}

impl Default for TransferCacheOptions {
    fn default() -> Self {
        Self {
            initial_batches: 16,
            max_batches: 64,
            max_class_bytes: 1 << 20,
        }
    }
}

impl TransferCacheOptions {
    /// `(capacity, max_capacity)` in objects for a class.
    #[must_use]
    pub fn capacities(&self, object_size: usize, batch: usize) -> (usize, usize) {
        if batch == 0 {
            return (0, 0);
        }
        let batch_bytes = object_size.max(1).saturating_mul(batch);
        let max_batches = self
            .max_batches
            .min(self.max_class_bytes / batch_bytes)
            .max(1);
        let initial_batches = self.initial_batches.min(max_batches);
        (initial_batches * batch, max_batches * batch)
    }
}

struct ClassSlot {
    cache: Mutex<ClassCache>,
    batch: usize,
    used: AtomicUsize,
    capacity: AtomicUsize,
    insert_hits: AtomicU64,
    insert_misses: AtomicU64,
    remove_hits: AtomicU64,
    remove_misses: AtomicU64,
}

impl ClassSlot {
    fn mirror(&self, cache: &ClassCache) {
        let info = cache.info();
        self.used.store(info.used, Ordering::Relaxed);
        self.capacity.store(info.capacity, Ordering::Relaxed);
    }
}

/// All transfer caches of one sharing domain.
pub struct TransferCacheManager<C> {
    implementation: TransferCacheImplementation,
    central: C,
    classes: Box<[ClassSlot]>,
    next_to_evict: AtomicUsize,
}

impl<C: CentralFreeList> TransferCacheManager<C> {
    pub fn new(
        implementation: TransferCacheImplementation,
        sizes: &impl SizeMap,
        central: C,
        options: TransferCacheOptions,
    ) -> Self {
        let classes = (0..sizes.num_classes())
            .map(|cl| {
                let batch = if cl == 0 {
                    0
                } else {
                    sizes.num_objects_to_move(cl).min(MAX_OBJECTS_TO_MOVE)
                };
                let (capacity, max_capacity) =
                    options.capacities(sizes.class_to_size(cl), batch);
                let cache = ClassCache::new(implementation, capacity, max_capacity);
                let slot = ClassSlot {
                    batch,
                    used: AtomicUsize::new(0),
                    capacity: AtomicUsize::new(0),
                    insert_hits: AtomicU64::new(0),
                    insert_misses: AtomicU64::new(0),
                    remove_hits: AtomicU64::new(0),
                    remove_misses: AtomicU64::new(0),
                    cache: Mutex::new(cache),
                };
                slot.mirror(&slot.cache.lock());
                slot
            })
            .collect();
        Self {
            implementation,
            central,
            classes,
            next_to_evict: AtomicUsize::new(1),
        }
    }

    #[must_use]
    pub fn implementation(&self) -> TransferCacheImplementation {
        self.implementation
    }

    #[must_use]
    pub fn central(&self) -> &C {
        &self.central
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Objects moved per batch for `cl`.
    #[must_use]
    pub fn batch_size(&self, cl: usize) -> usize {
        self.classes.get(cl).map_or(0, |slot| slot.batch)
    }

    /// Objects cached for `cl`, from the lock-free mirror.
    #[must_use]
    pub fn tc_length(&self, cl: usize) -> usize {
        self.classes
            .get(cl)
            .map_or(0, |slot| slot.used.load(Ordering::Relaxed))
    }

    /// Current capacity of `cl`, from the lock-free mirror.
    #[must_use]
    pub fn capacity(&self, cl: usize) -> usize {
        self.classes
            .get(cl)
            .map_or(0, |slot| slot.capacity.load(Ordering::Relaxed))
    }

    /// Stores `batch` in class `cl`, making room or falling back to the
    /// central free list as the strategy dictates.
    pub fn insert_range(&self, cl: usize, batch: &[usize]) {
        let Some(slot) = self.classes.get(cl) else {
            self.central.release_batch(cl, batch);
            return;
        };
        for chunk in batch.chunks(MAX_OBJECTS_TO_MOVE) {
            self.insert_chunk(cl, slot, chunk);
        }
    }

    fn try_insert(slot: &ClassSlot, batch: &[usize]) -> bool {
        let mut cache = slot.cache.lock();
        let inserted = cache.try_insert(batch);
        if inserted {
            slot.mirror(&cache);
        }
        inserted
    }

    fn insert_chunk(&self, cl: usize, slot: &ClassSlot, batch: &[usize]) {
        if Self::try_insert(slot, batch)
            || (self.make_cache_space(cl) && Self::try_insert(slot, batch))
        {
            metrics::inc(&slot.insert_hits);
            return;
        }
        metrics::inc(&slot.insert_misses);

        let mut spill = [0usize; MAX_OBJECTS_TO_MOVE];
        let spilled = {
            let mut cache = slot.cache.lock();
            let spilled = cache.insert_overflow(batch, &mut spill);
            slot.mirror(&cache);
            spilled
        };
        if spilled > 0 {
            self.central.release_batch(cl, &spill[..spilled]);
        }
    }

    /// Fills `out` with up to `out.len()` objects of class `cl`, newest
    /// first. An empty cache forwards the request to the central free
    /// list. Returns the number written.
    pub fn remove_range(&self, cl: usize, out: &mut [usize]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let Some(slot) = self.classes.get(cl) else {
            return self.central.acquire_batch(cl, out);
        };
        let got = {
            let mut cache = slot.cache.lock();
            let got = cache.remove(out);
            slot.mirror(&cache);
            got
        };
        if got > 0 {
            metrics::inc(&slot.remove_hits);
            return got;
        }
        metrics::inc(&slot.remove_misses);
        self.central.acquire_batch(cl, out)
    }

    /// True if `cl` could absorb another full batch. Never takes the lock.
    #[must_use]
    pub fn has_spare_capacity(&self, cl: usize) -> bool {
        let Some(slot) = self.classes.get(cl) else {
            return false;
        };
        let capacity = slot.capacity.load(Ordering::Relaxed);
        let used = slot.used.load(Ordering::Relaxed);
        slot.batch > 0 && capacity.saturating_sub(used) >= slot.batch
    }

    fn next_eviction_candidate(&self) -> usize {
        let mut t = self.next_to_evict.load(Ordering::Relaxed);
        if t >= self.classes.len() {
            t = 1;
        }
        self.next_to_evict.store(t + 1, Ordering::Relaxed);
        t
    }

    /// Picks the class to take capacity from on behalf of `current`.
    ///
    /// The first candidate is accepted if it is `current` itself or has
    /// spare capacity; otherwise the next candidate is taken as is.
    pub fn determine_size_class_to_evict(&self, current: usize) -> usize {
        if self.classes.len() < 2 {
            return current;
        }
        let t = self.next_eviction_candidate();
        if t == current || self.has_spare_capacity(t) {
            return t;
        }
        self.next_eviction_candidate()
    }

    /// Ensures `cl` has room for another batch, stealing one batch of
    /// capacity from an eviction victim if needed.
    pub fn make_cache_space(&self, cl: usize) -> bool {
        let Some(slot) = self.classes.get(cl) else {
            return false;
        };
        {
            let info = slot.cache.lock().info();
            if info.room() >= slot.batch {
                return true;
            }
            if info.capacity + slot.batch > info.max_capacity {
                return false;
            }
        }
        let victim = self.determine_size_class_to_evict(cl);
        if victim == cl {
            return false;
        }
        if !self.shrink_cache(victim) {
            return false;
        }
        self.grow_cache(cl)
    }

    /// Gives up one batch of capacity of `cl`, releasing objects that no
    /// longer fit to the central free list.
    pub fn shrink_cache(&self, cl: usize) -> bool {
        let Some(slot) = self.classes.get(cl) else {
            return false;
        };
        let mut spill = [0usize; MAX_OBJECTS_TO_MOVE];
        let spilled = {
            let mut cache = slot.cache.lock();
            let spilled = cache.shrink(slot.batch, &mut spill);
            slot.mirror(&cache);
            spilled
        };
        let Some(spilled) = spilled else {
            return false;
        };
        if spilled > 0 {
            self.central.release_batch(cl, &spill[..spilled]);
        }
        log::debug!(
            "percpu-alloc: transfer cache class {cl} shrunk by {} ({spilled} released)",
            slot.batch
        );
        true
    }

    /// Adds one batch of capacity to `cl` if it is below its maximum.
    pub fn grow_cache(&self, cl: usize) -> bool {
        let Some(slot) = self.classes.get(cl) else {
            return false;
        };
        let grown = {
            let mut cache = slot.cache.lock();
            let grown = cache.grow(slot.batch);
            slot.mirror(&cache);
            grown
        };
        if grown {
            log::debug!(
                "percpu-alloc: transfer cache class {cl} grown by {}",
                slot.batch
            );
        }
        grown
    }

    /// Releases the objects of `cl` that went unused since the previous
    /// plunder. Returns how many were released.
    pub fn plunder(&self, cl: usize) -> usize {
        let Some(slot) = self.classes.get(cl) else {
            return 0;
        };
        let mut remaining = slot.cache.lock().info().low_water_mark;
        let mut released = 0;
        let mut buf = [0usize; MAX_OBJECTS_TO_MOVE];
        while remaining > 0 {
            let want = remaining.min(MAX_OBJECTS_TO_MOVE);
            let got = {
                let mut cache = slot.cache.lock();
                let got = cache.remove(&mut buf[..want]);
                slot.mirror(&cache);
                got
            };
            if got == 0 {
                break;
            }
            self.central.release_batch(cl, &buf[..got]);
            released += got;
            remaining -= got;
        }
        slot.cache.lock().reset_low_water_mark();
        released
    }

    /// Plunders every class.
    pub fn plunder_all(&self) -> usize {
        (1..self.classes.len()).map(|cl| self.plunder(cl)).sum()
    }

    /// Copy of the objects cached for `cl`, oldest first.
    #[must_use]
    pub fn contents(&self, cl: usize) -> Vec<usize> {
        self.classes
            .get(cl)
            .map_or_else(Vec::new, |slot| slot.cache.lock().contents())
    }

    #[must_use]
    pub fn stats(&self, cl: usize) -> Option<TransferCacheStats> {
        let slot = self.classes.get(cl)?;
        let info = slot.cache.lock().info();
        Some(TransferCacheStats {
            class: cl,
            insert_hits: metrics::get(&slot.insert_hits),
            insert_misses: metrics::get(&slot.insert_misses),
            remove_hits: metrics::get(&slot.remove_hits),
            remove_misses: metrics::get(&slot.remove_misses),
            used: info.used,
            capacity: info.capacity,
            max_capacity: info.max_capacity,
        })
    }

    /// Statistics for every real class.
    #[must_use]
    pub fn all_stats(&self) -> Vec<TransferCacheStats> {
        (1..self.classes.len())
            .filter_map(|cl| self.stats(cl))
            .collect()
    }
}

impl<C> std::fmt::Debug for TransferCacheManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCacheManager")
            .field("implementation", &self.implementation)
            .field("num_classes", &self.classes.len())
            .finish_non_exhaustive()
    }
}
