//! Ring-buffer transfer cache.
//!
//! Objects are appended at the tail. Removal takes from the tail (newest),
//! eviction and shrinking take from the head (oldest), so objects that sat
//! unused the longest are the first to go back to the central free list.

use super::{ClassTransferCache, SlotInfo};

#[derive(Debug)]
pub struct RingCache {
    /// Sized for the maximum capacity.
    slots: Box<[usize]>,
    /// Index of the oldest object.
    head: usize,
    info: SlotInfo,
}

impl RingCache {
    #[must_use]
    pub fn new(capacity: usize, max_capacity: usize) -> Self {
        Self {
            slots: vec![0; max_capacity].into_boxed_slice(),
            head: 0,
            info: SlotInfo::new(capacity, max_capacity),
        }
    }

    fn wrap(&self, index: usize) -> usize {
        index % self.slots.len()
    }

    fn push_newest(&mut self, item: usize) {
        let tail = self.wrap(self.head + self.info.used);
        self.slots[tail] = item;
        self.info.used += 1;
    }

    fn pop_newest(&mut self) -> usize {
        let tail = self.wrap(self.head + self.info.used - 1);
        self.info.used -= 1;
        self.slots[tail]
    }

    fn pop_oldest(&mut self) -> usize {
        let item = self.slots[self.head];
        self.head = self.wrap(self.head + 1);
        self.info.used -= 1;
        item
    }

    /// Moves up to `out.len()` of the oldest objects into `out`.
    fn evict_oldest(&mut self, out: &mut [usize]) -> usize {
        let n = out.len().min(self.info.used);
        for slot in &mut out[..n] {
            *slot = self.pop_oldest();
        }
        self.info.note_removal();
        n
    }
}

impl ClassTransferCache for RingCache {
    fn info(&self) -> SlotInfo {
        self.info
    }

    fn try_insert(&mut self, batch: &[usize]) -> bool {
        if batch.len() > self.info.room() {
            return false;
        }
        for &item in batch {
            self.push_newest(item);
        }
        true
    }

    fn insert_overflow(&mut self, batch: &[usize], spill: &mut [usize]) -> usize {
        let need = (self.info.used + batch.len()).saturating_sub(self.info.capacity);
        let evicted = self.evict_oldest(&mut spill[..need.min(self.info.used)]);
        let stored = batch.len().min(self.info.room());
        for &item in &batch[..stored] {
            self.push_newest(item);
        }
        let rejected = &batch[stored..];
        spill[evicted..evicted + rejected.len()].copy_from_slice(rejected);
        evicted + rejected.len()
    }

    fn remove(&mut self, out: &mut [usize]) -> usize {
        let n = out.len().min(self.info.used);
        for slot in &mut out[..n] {
            *slot = self.pop_newest();
        }
        self.info.note_removal();
        n
    }

    fn grow(&mut self, n: usize) -> bool {
        let capacity = self.info.capacity + n;
        if capacity > self.info.max_capacity {
            return false;
        }
        self.info.capacity = capacity;
        true
    }

    fn shrink(&mut self, n: usize, spill: &mut [usize]) -> Option<usize> {
        if self.info.capacity == 0 {
            return None;
        }
        let capacity = self.info.capacity.saturating_sub(n);
        let excess = self.info.used.saturating_sub(capacity);
        let spilled = self.evict_oldest(&mut spill[..excess]);
        self.info.capacity = capacity;
        Some(spilled)
    }

    fn reset_low_water_mark(&mut self) {
        self.info.low_water_mark = self.info.used;
    }

    fn contents(&self) -> Vec<usize> {
        (0..self.info.used)
            .map(|i| self.slots[self.wrap(self.head + i)])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_takes_newest_first() {
        let mut ring = RingCache::new(4, 4);
        assert!(ring.try_insert(&[1, 2, 3]));
        let mut out = [0usize; 2];
        assert_eq!(ring.remove(&mut out), 2);
        assert_eq!(out, [3, 2]);
        assert_eq!(ring.contents(), vec![1]);
    }

    #[test]
    fn full_ring_evicts_oldest() {
        let mut ring = RingCache::new(4, 4);
        assert!(ring.try_insert(&[1, 2, 3, 4]));
        let mut spill = [0usize; 2];
        assert_eq!(ring.insert_overflow(&[5, 6], &mut spill), 2);
        assert_eq!(spill, [1, 2]);
        assert_eq!(ring.contents(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn wraparound_keeps_order() {
        let mut ring = RingCache::new(3, 3);
        let mut spill = [0usize; 1];
        ring.try_insert(&[1, 2, 3]);
        for next in 4..10 {
            assert_eq!(ring.insert_overflow(&[next], &mut spill), 1);
            assert_eq!(spill[0], next - 3);
        }
        assert_eq!(ring.contents(), vec![7, 8, 9]);
        let mut out = [0usize; 3];
        ring.remove(&mut out);
        assert_eq!(out, [9, 8, 7]);
    }

    #[test]
    fn batch_larger_than_capacity_spills_remainder() {
        let mut ring = RingCache::new(2, 4);
        ring.try_insert(&[1]);
        let mut spill = [0usize; 3];
        assert_eq!(ring.insert_overflow(&[5, 6, 7], &mut spill), 2);
        assert_eq!(ring.contents(), vec![5, 6]);
        assert_eq!(&spill[..2], &[1, 7]);
    }

    #[test]
    fn shrink_evicts_oldest() {
        let mut ring = RingCache::new(4, 4);
        ring.try_insert(&[1, 2, 3, 4]);
        let mut spill = [0usize; 2];
        assert_eq!(ring.shrink(2, &mut spill), Some(2));
        assert_eq!(spill, [1, 2]);
        assert_eq!(ring.contents(), vec![3, 4]);
        assert!(ring.grow(2));
        assert!(!ring.grow(1));
    }

    #[test]
    fn zero_capacity_ring_spills_everything() {
        let mut ring = RingCache::new(0, 0);
        let mut spill = [0usize; 2];
        assert!(!ring.try_insert(&[1]));
        assert!(ring.try_insert(&[]));
        assert_eq!(ring.insert_overflow(&[1, 2], &mut spill), 2);
        assert_eq!(spill, [1, 2]);
        assert_eq!(ring.shrink(1, &mut spill), None);
    }
}
