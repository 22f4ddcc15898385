//! Stack-backed transfer cache.

use super::{ClassTransferCache, SlotInfo};

/// Fixed-size stack of objects; the top is the newest.
#[derive(Debug)]
pub struct LegacyCache {
    slots: Box<[usize]>,
    info: SlotInfo,
}

impl LegacyCache {
    #[must_use]
    pub fn new(capacity: usize, max_capacity: usize) -> Self {
        Self {
            slots: vec![0; max_capacity].into_boxed_slice(),
            info: SlotInfo::new(capacity, max_capacity),
        }
    }

    /// Moves the newest `out.len()` objects (at most `used`) into `out`,
    /// top first.
    fn pop_top(&mut self, out: &mut [usize]) -> usize {
        let n = out.len().min(self.info.used);
        let top = self.info.used;
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = self.slots[top - 1 - i];
        }
        self.info.used -= n;
        n
    }
}

impl ClassTransferCache for LegacyCache {
    fn info(&self) -> SlotInfo {
        self.info
    }

    fn try_insert(&mut self, batch: &[usize]) -> bool {
        if batch.len() > self.info.room() {
            return false;
        }
        let used = self.info.used;
        self.slots[used..used + batch.len()].copy_from_slice(batch);
        self.info.used += batch.len();
        true
    }

    fn insert_overflow(&mut self, batch: &[usize], spill: &mut [usize]) -> usize {
        if self.try_insert(batch) {
            return 0;
        }
        spill[..batch.len()].copy_from_slice(batch);
        batch.len()
    }

    fn remove(&mut self, out: &mut [usize]) -> usize {
        let n = self.pop_top(out);
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
        let spilled = self.pop_top(&mut spill[..excess]);
        self.info.note_removal();
        self.info.capacity = capacity;
        Some(spilled)
    }

    fn reset_low_water_mark(&mut self) {
        self.info.low_water_mark = self.info.used;
    }

    fn contents(&self) -> Vec<usize> {
        self.slots[..self.info.used].to_vec()
    }
}
