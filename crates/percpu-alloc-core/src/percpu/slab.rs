//! Restartable sections over per-CPU slab regions.
//!
//! A section is bound to the CPU it starts on. It reads the executing CPU
//! id, claims that CPU's section word, works only inside that CPU's region
//! and finishes with a single `Release` store of the class header. A thread
//! that finds the word already claimed (its CPU-mate was preempted inside a
//! section) restarts from the top, re-reading the CPU id.
//!
//! When the CPU source is fast (rseq-backed), a thread that is no longer on
//! the section's CPU at commit time abandons the section and restarts; it
//! never commits state for a CPU it has left. Slow sources cannot tell a
//! migration from a stale id, so their sections commit regardless. That is
//! still correct because the claimed word excludes every other writer, but
//! it is no longer wait-free.
//!
//! Overflow and underflow handlers run after the section has been released.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use super::Header;
use crate::cpu::CpuSource;
use crate::error::SlabError;
use crate::metrics::{self, SectionMetrics, SectionSnapshot};

const FREE: u32 = 0;
const HELD: u32 = 1;

/// Spins between yields while a CPU word is held by someone else.
const YIELD_EVERY: u32 = 64;

#[repr(align(64))]
#[derive(Default)]
struct SectionWord(AtomicU32);

/// Per-CPU, per-class bounded LIFO stacks.
pub struct PerCpuSlab<S> {
    cpus: S,
    num_cpus: usize,
    num_classes: usize,
    /// Slots per CPU region.
    stride: usize,
    max_capacity: Box<[u16]>,
    /// `cpu * num_classes + cl`.
    headers: Box<[AtomicU64]>,
    /// `cpu * stride + slot`.
    slots: Box<[AtomicUsize]>,
    sections: Box<[SectionWord]>,
    metrics: SectionMetrics,
}

/// A claimed CPU word. Dropping it ends the section.
struct Section<'a, S> {
    slab: &'a PerCpuSlab<S>,
    cpu: usize,
}

impl<S> Section<'_, S> {
    fn header(&self, cl: usize) -> Option<Header> {
        (cl < self.slab.num_classes).then(|| {
            let word = self.slab.headers[self.cpu * self.slab.num_classes + cl]
                .load(Ordering::Relaxed);
            Header::unpack(word)
        })
    }

    fn load_slot(&self, index: usize) -> usize {
        self.slab.slots[self.cpu * self.slab.stride + index].load(Ordering::Relaxed)
    }

    fn store_slot(&self, index: usize, item: usize) {
        self.slab.slots[self.cpu * self.slab.stride + index].store(item, Ordering::Relaxed);
    }

    fn store_header(&self, cl: usize, hdr: Header) {
        debug_assert!(hdr.is_consistent());
        self.slab.headers[self.cpu * self.slab.num_classes + cl]
            .store(hdr.pack(), Ordering::Release);
    }
}

impl<S: CpuSource> Section<'_, S> {
    /// Publishes `hdr`, unless the thread has migrated off a fast CPU
    /// source. Returns false when the section must be restarted.
    fn commit(self, cl: usize, hdr: Header) -> bool {
        if self.slab.cpus.is_fast() && self.slab.current_cpu() != self.cpu {
            metrics::inc(&self.slab.metrics.migration_aborts);
            return false;
        }
        self.store_header(cl, hdr);
        true
    }
}

impl<S> Drop for Section<'_, S> {
    fn drop(&mut self) {
        self.slab.sections[self.cpu].0.store(FREE, Ordering::Release);
    }
}

fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins % YIELD_EVERY == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

impl<S: CpuSource> PerCpuSlab<S> {
    /// Lays out `num_cpus` regions with room for `max_capacity[cl]` objects
    /// per class. Every class starts with zero capacity; see [`grow`].
    ///
    /// [`grow`]: Self::grow
    pub fn new(cpus: S, num_cpus: usize, max_capacity: &[u16]) -> Result<Self, SlabError> {
        if num_cpus == 0 {
            return Err(SlabError::NoCpus);
        }
        if max_capacity.first().is_some_and(|&cap| cap != 0) {
            return Err(SlabError::ReservedClassCapacity);
        }
        let stride: usize = max_capacity.iter().map(|&cap| usize::from(cap)).sum();
        if stride > usize::from(u16::MAX) {
            return Err(SlabError::LayoutTooLarge {
                slots: stride,
                max: usize::from(u16::MAX),
            });
        }

        let mut begins = Vec::with_capacity(max_capacity.len());
        let mut offset = 0u16;
        for &cap in max_capacity {
            begins.push(offset);
            offset += cap;
        }
        let begins = &begins;

        Ok(Self {
            cpus,
            num_cpus,
            num_classes: max_capacity.len(),
            stride,
            max_capacity: max_capacity.into(),
            headers: (0..num_cpus)
                .flat_map(move |_| {
                    begins
                        .iter()
                        .map(|&begin| AtomicU64::new(Header::empty_at(begin).pack()))
                })
                .collect(),
            slots: (0..num_cpus * stride).map(|_| AtomicUsize::new(0)).collect(),
            sections: (0..num_cpus).map(|_| SectionWord::default()).collect(),
            metrics: SectionMetrics::new(),
        })
    }

    /// The executing CPU, folded into `[0, num_cpus)`.
    pub fn current_cpu(&self) -> usize {
        self.cpus.current_cpu() % self.num_cpus
    }

    fn try_claim(&self, cpu: usize) -> Option<Section<'_, S>> {
        self.sections[cpu]
            .0
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Section { slab: self, cpu })
    }

    /// Starts a section on the executing CPU.
    fn enter(&self) -> Section<'_, S> {
        let mut spins = 0;
        loop {
            metrics::inc(&self.metrics.entered);
            if let Some(section) = self.try_claim(self.current_cpu()) {
                return section;
            }
            metrics::inc(&self.metrics.contended);
            backoff(&mut spins);
        }
    }

    /// Claims `cpu` from any thread, for administration.
    fn claim(&self, cpu: usize) -> Option<Section<'_, S>> {
        if cpu >= self.num_cpus {
            return None;
        }
        let mut spins = 0;
        loop {
            if let Some(section) = self.try_claim(cpu) {
                return Some(section);
            }
            backoff(&mut spins);
        }
    }

    /// Pushes `item` onto class `cl` of the executing CPU.
    ///
    /// When the class is full, `overflow(cpu, cl, item)` is called once,
    /// outside the section, and nothing is written. Returns the CPU the
    /// push was attempted on.
    pub fn push<F>(&self, cl: usize, item: usize, overflow: F) -> usize
    where
        F: FnOnce(usize, usize, usize),
    {
        loop {
            let section = self.enter();
            let cpu = section.cpu;
            let hdr = match section.header(cl) {
                Some(hdr) if hdr.current < hdr.end => hdr,
                _ => {
                    drop(section);
                    overflow(cpu, cl, item);
                    return cpu;
                }
            };
            section.store_slot(usize::from(hdr.current), item);
            let next = Header {
                current: hdr.current + 1,
                ..hdr
            };
            if section.commit(cl, next) {
                return cpu;
            }
        }
    }

    /// Pops the most recently pushed object of class `cl` on the executing
    /// CPU, or returns `underflow(cpu, cl)` when the class is empty.
    pub fn pop<F>(&self, cl: usize, underflow: F) -> Option<usize>
    where
        F: FnOnce(usize, usize) -> Option<usize>,
    {
        loop {
            let section = self.enter();
            let cpu = section.cpu;
            let hdr = match section.header(cl) {
                Some(hdr) if hdr.current > hdr.begin => hdr,
                _ => {
                    drop(section);
                    return underflow(cpu, cl);
                }
            };
            let current = hdr.current - 1;
            let item = section.load_slot(usize::from(current));
            if section.commit(cl, Header { current, ..hdr }) {
                return Some(item);
            }
        }
    }

    /// Pushes as many leading elements of `items` as fit. The last pushed
    /// element ends up on top. Returns the number pushed.
    pub fn push_batch(&self, cl: usize, items: &[usize]) -> usize {
        if items.is_empty() {
            return 0;
        }
        loop {
            let section = self.enter();
            let Some(hdr) = section.header(cl) else {
                return 0;
            };
            let n = items.len().min(hdr.spare());
            if n == 0 {
                return 0;
            }
            let base = usize::from(hdr.current);
            for (i, &item) in items[..n].iter().enumerate() {
                section.store_slot(base + i, item);
            }
            let next = Header {
                current: hdr.current + n as u16,
                ..hdr
            };
            if section.commit(cl, next) {
                return n;
            }
        }
    }

    /// Pops up to `out.len()` objects, top first. Returns the number popped.
    pub fn pop_batch(&self, cl: usize, out: &mut [usize]) -> usize {
        if out.is_empty() {
            return 0;
        }
        loop {
            let section = self.enter();
            let Some(hdr) = section.header(cl) else {
                return 0;
            };
            let n = out.len().min(hdr.len());
            if n == 0 {
                return 0;
            }
            let top = usize::from(hdr.current);
            for (i, slot) in out[..n].iter_mut().enumerate() {
                *slot = section.load_slot(top - 1 - i);
            }
            let next = Header {
                current: hdr.current - n as u16,
                ..hdr
            };
            if section.commit(cl, next) {
                return n;
            }
        }
    }

    /// Raises the capacity of `cl` on `cpu` by up to `len`, never beyond
    /// `max` or the class's layout maximum. Returns the amount grown.
    pub fn grow(&self, cpu: usize, cl: usize, len: usize, max: usize) -> usize {
        let Some(section) = self.claim(cpu) else {
            return 0;
        };
        let Some(hdr) = section.header(cl) else {
            return 0;
        };
        let limit = max.min(usize::from(self.max_capacity[cl]));
        let grown = len.min(limit.saturating_sub(hdr.capacity()));
        if grown > 0 {
            section.store_header(
                cl,
                Header {
                    end: hdr.end + grown as u16,
                    ..hdr
                },
            );
        }
        grown
    }

    /// Gives back up to `len` unused slots of `cl` on `cpu`. Cached objects
    /// are never discarded. Returns the amount shrunk.
    pub fn shrink(&self, cpu: usize, cl: usize, len: usize) -> usize {
        let Some(section) = self.claim(cpu) else {
            return 0;
        };
        let Some(hdr) = section.header(cl) else {
            return 0;
        };
        let shrunk = len.min(hdr.spare());
        if shrunk > 0 {
            section.store_header(
                cl,
                Header {
                    end: hdr.end - shrunk as u16,
                    ..hdr
                },
            );
        }
        shrunk
    }

    /// Empties every class on `cpu`, resetting capacities to zero, then
    /// calls `handler(cl, objects)` for each class that held objects.
    /// Returns the number of objects drained.
    pub fn drain<F>(&self, cpu: usize, mut handler: F) -> usize
    where
        F: FnMut(usize, &[usize]),
    {
        let mut drained: Vec<(usize, Vec<usize>)> = Vec::new();
        if let Some(section) = self.claim(cpu) {
            for cl in 0..self.num_classes {
                let Some(hdr) = section.header(cl) else {
                    continue;
                };
                let objects: Vec<usize> = (hdr.begin..hdr.current)
                    .map(|i| section.load_slot(usize::from(i)))
                    .collect();
                section.store_header(cl, Header::empty_at(hdr.begin));
                if !objects.is_empty() {
                    drained.push((cl, objects));
                }
            }
        }
        let total = drained.iter().map(|(_, objects)| objects.len()).sum();
        for (cl, objects) in &drained {
            handler(*cl, objects);
        }
        total
    }
}

impl<S> PerCpuSlab<S> {
    /// Racy snapshot of a header; may be stale by the time it returns.
    #[must_use]
    pub fn header(&self, cpu: usize, cl: usize) -> Option<Header> {
        if cpu >= self.num_cpus || cl >= self.num_classes {
            return None;
        }
        let word = self.headers[cpu * self.num_classes + cl].load(Ordering::Acquire);
        Some(Header::unpack(word))
    }

    /// Objects cached for `cl` on `cpu` (racy).
    #[must_use]
    pub fn length(&self, cpu: usize, cl: usize) -> usize {
        self.header(cpu, cl).map_or(0, Header::len)
    }

    /// Capacity of `cl` on `cpu` (racy).
    #[must_use]
    pub fn capacity(&self, cpu: usize, cl: usize) -> usize {
        self.header(cpu, cl).map_or(0, Header::capacity)
    }

    /// Objects cached on `cpu` across all classes (racy).
    #[must_use]
    pub fn total_length(&self, cpu: usize) -> usize {
        (0..self.num_classes).map(|cl| self.length(cpu, cl)).sum()
    }

    /// Racy copy of the objects cached for `cl` on `cpu`, bottom first.
    #[must_use]
    pub fn snapshot(&self, cpu: usize, cl: usize) -> Vec<usize> {
        let Some(hdr) = self.header(cpu, cl) else {
            return Vec::new();
        };
        (hdr.begin..hdr.current)
            .map(|i| self.slots[cpu * self.stride + usize::from(i)].load(Ordering::Relaxed))
            .collect()
    }

    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Layout maximum for `cl`.
    #[must_use]
    pub fn max_capacity(&self, cl: usize) -> usize {
        self.max_capacity.get(cl).copied().map_or(0, usize::from)
    }

    #[must_use]
    pub fn cpu_source(&self) -> &S {
        &self.cpus
    }

    #[must_use]
    pub fn section_stats(&self) -> SectionSnapshot {
        self.metrics.snapshot()
    }
}

impl<S> fmt::Debug for PerCpuSlab<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerCpuSlab")
            .field("num_cpus", &self.num_cpus)
            .field("num_classes", &self.num_classes)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct FixedCpu(AtomicUsize);

    impl FixedCpu {
        fn new(cpu: usize) -> Self {
            Self(AtomicUsize::new(cpu))
        }
    }

    impl CpuSource for FixedCpu {
        fn current_cpu(&self) -> usize {
            self.0.load(Ordering::Relaxed)
        }
        fn is_fast(&self) -> bool {
            true
        }
    }

    /// Replays a list of CPU ids, then sticks to the last one.
    struct ScriptedCpu {
        script: Mutex<VecDeque<usize>>,
        last: AtomicUsize,
        fast: bool,
    }

    impl ScriptedCpu {
        fn new(script: &[usize], fast: bool) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                last: AtomicUsize::new(script.first().copied().unwrap_or(0)),
                fast,
            }
        }
    }

    impl CpuSource for ScriptedCpu {
        fn current_cpu(&self) -> usize {
            match self.script.lock().pop_front() {
                Some(cpu) => {
                    self.last.store(cpu, Ordering::Relaxed);
                    cpu
                }
                None => self.last.load(Ordering::Relaxed),
            }
        }
        fn is_fast(&self) -> bool {
            self.fast
        }
    }

    fn slab(caps: &[u16]) -> PerCpuSlab<FixedCpu> {
        PerCpuSlab::new(FixedCpu::new(0), 2, caps).unwrap()
    }

    fn no_overflow(_: usize, _: usize, _: usize) {
        panic!("unexpected overflow");
    }

    #[test]
    fn push_pop_is_lifo() {
        let s = slab(&[0, 8]);
        assert_eq!(s.grow(0, 1, 8, 8), 8);
        for item in [0x10, 0x20, 0x30] {
            assert_eq!(s.push(1, item, no_overflow), 0);
        }
        assert_eq!(s.length(0, 1), 3);
        assert_eq!(s.pop(1, |_, _| None), Some(0x30));
        assert_eq!(s.pop(1, |_, _| None), Some(0x20));
        s.push(1, 0x40, no_overflow);
        assert_eq!(s.pop(1, |_, _| None), Some(0x40));
        assert_eq!(s.pop(1, |_, _| None), Some(0x10));
        assert_eq!(s.length(0, 1), 0);
        assert_eq!(s.section_stats().restarts(), 0);
    }

    #[test]
    fn overflow_handler_runs_once_and_writes_nothing() {
        let s = slab(&[0, 2, 4]);
        s.grow(0, 1, 2, 2);
        s.grow(0, 2, 4, 4);
        s.push(2, 0xbeef, no_overflow);
        s.push(1, 1, no_overflow);
        s.push(1, 2, no_overflow);

        let mut calls = Vec::new();
        let cpu = s.push(1, 3, |cpu, cl, item| calls.push((cpu, cl, item)));
        assert_eq!(cpu, 0);
        assert_eq!(calls, vec![(0, 1, 3)]);
        assert_eq!(s.length(0, 1), 2);
        // The neighbouring class is untouched.
        assert_eq!(s.snapshot(0, 2), vec![0xbeef]);
    }

    #[test]
    fn underflow_handler_supplies_the_object() {
        let s = slab(&[0, 4]);
        let mut calls = 0;
        let got = s.pop(1, |cpu, cl| {
            calls += 1;
            assert_eq!((cpu, cl), (0, 1));
            Some(0x999)
        });
        assert_eq!(got, Some(0x999));
        assert_eq!(calls, 1);
        let header = s.header(0, 1).unwrap();
        assert!(header.is_consistent());
        assert!(header.is_empty());
    }

    #[test]
    fn batch_round_trip_restores_header() {
        let s = slab(&[0, 6, 6]);
        s.grow(0, 2, 6, 6);
        s.push(2, 0x1, no_overflow);
        let before = s.header(0, 2).unwrap();

        assert_eq!(s.push_batch(2, &[0xa, 0xb, 0xc]), 3);
        let mut out = [0usize; 3];
        assert_eq!(s.pop_batch(2, &mut out), 3);
        assert_eq!(out, [0xc, 0xb, 0xa]);
        assert_eq!(s.header(0, 2).unwrap(), before);
    }

    #[test]
    fn batches_are_clamped_to_space() {
        let s = slab(&[0, 4]);
        s.grow(0, 1, 3, 4);
        assert_eq!(s.push_batch(1, &[1, 2, 3, 4, 5]), 3);
        assert_eq!(s.snapshot(0, 1), vec![1, 2, 3]);
        assert_eq!(s.push_batch(1, &[6]), 0);

        let mut out = [0usize; 8];
        assert_eq!(s.pop_batch(1, &mut out), 3);
        assert_eq!(&out[..3], &[3, 2, 1]);
        assert_eq!(s.pop_batch(1, &mut out), 0);
    }

    #[test]
    fn grow_and_shrink_respect_limits() {
        let s = slab(&[0, 10]);
        assert_eq!(s.grow(1, 1, 4, 6), 4);
        assert_eq!(s.grow(1, 1, 4, 6), 2);
        assert_eq!(s.grow(1, 1, 4, 100), 4);
        assert_eq!(s.capacity(1, 1), 10);
        assert_eq!(s.capacity(0, 1), 0);

        s.cpu_source().0.store(1, Ordering::Relaxed);
        s.push_batch(1, &[1, 2, 3, 4, 5, 6, 7]);
        // Only spare capacity can go.
        assert_eq!(s.shrink(1, 1, 8), 3);
        assert_eq!(s.capacity(1, 1), 7);
        assert_eq!(s.length(1, 1), 7);
    }

    #[test]
    fn drain_hands_back_everything() {
        let s = slab(&[0, 4, 4]);
        s.grow(0, 1, 4, 4);
        s.grow(0, 2, 4, 4);
        s.push_batch(1, &[1, 2]);
        s.push_batch(2, &[3]);

        let mut seen = Vec::new();
        let total = s.drain(0, |cl, objects| seen.push((cl, objects.to_vec())));
        assert_eq!(total, 3);
        assert_eq!(seen, vec![(1, vec![1, 2]), (2, vec![3])]);
        assert_eq!(s.capacity(0, 1), 0);
        assert_eq!(s.total_length(0), 0);
    }

    #[test]
    fn bad_layouts_are_rejected() {
        assert_eq!(
            PerCpuSlab::new(FixedCpu::new(0), 0, &[0, 1]).unwrap_err(),
            SlabError::NoCpus
        );
        assert_eq!(
            PerCpuSlab::new(FixedCpu::new(0), 1, &[1, 1]).unwrap_err(),
            SlabError::ReservedClassCapacity
        );
        assert!(matches!(
            PerCpuSlab::new(FixedCpu::new(0), 1, &[0, u16::MAX, 1]).unwrap_err(),
            SlabError::LayoutTooLarge { .. }
        ));
    }

    #[test]
    fn unknown_class_behaves_as_full_and_empty() {
        let s = slab(&[0, 4]);
        let mut overflowed = false;
        s.push(9, 1, |_, _, _| overflowed = true);
        assert!(overflowed);
        assert_eq!(s.pop(9, |_, _| None), None);
        assert_eq!(s.push_batch(9, &[1]), 0);
        assert_eq!(s.grow(0, 9, 1, 1), 0);
        assert_eq!(s.grow(5, 1, 1, 1), 0);
    }

    #[test]
    fn migration_before_commit_restarts_on_new_cpu() {
        // enter() sees cpu 0, commit sees cpu 1, the retry sees cpu 1.
        let cpus = ScriptedCpu::new(&[0, 1, 1, 1], true);
        let s = PerCpuSlab::new(cpus, 2, &[0, 4]).unwrap();
        s.grow(0, 1, 4, 4);
        s.grow(1, 1, 4, 4);

        assert_eq!(s.push(1, 0x77, no_overflow), 1);
        assert_eq!(s.length(0, 1), 0);
        assert_eq!(s.snapshot(1, 1), vec![0x77]);
        assert_eq!(s.section_stats().migration_aborts, 1);
    }

    #[test]
    fn slow_source_commits_despite_migration() {
        let cpus = ScriptedCpu::new(&[0, 1], false);
        let s = PerCpuSlab::new(cpus, 2, &[0, 4]).unwrap();
        s.grow(0, 1, 4, 4);
        assert_eq!(s.push(1, 0x77, no_overflow), 0);
        assert_eq!(s.snapshot(0, 1), vec![0x77]);
        assert_eq!(s.section_stats().migration_aborts, 0);
    }

    #[test]
    fn out_of_range_cpu_ids_fold() {
        let s = PerCpuSlab::new(FixedCpu::new(5), 2, &[0, 4]).unwrap();
        assert_eq!(s.current_cpu(), 1);
    }
}
