//! Multi-threaded allocate/free storm against a cache front.
//!
//! Each worker keeps a bounded set of live objects and, driven by its own
//! xorshift stream, either allocates a random class or frees a random live
//! object. Everything still live is freed when the worker finishes.

use std::thread;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use percpu_alloc_core::{CentralFreeList, CpuCache, CpuCacheStats, CpuSource, SizeMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StressConfig {
    pub threads: usize,
    pub ops_per_thread: usize,
    /// Live objects a worker may hold before it must free.
    pub max_live: usize,
    pub seed: u64,
    /// Base classes to draw from; empty means every real class.
    pub classes: Vec<usize>,
    /// Drain every CPU and plunder the transfer caches afterwards.
    pub drain: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops_per_thread: 100_000,
            max_live: 256,
            seed: 0xDEAD_BEEF,
            classes: Vec::new(),
            drain: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StressError {
    #[error("at least one worker thread is required")]
    NoThreads,
    #[error("max_live must be at least 1")]
    NoLiveObjects,
    #[error("size class {class} is not a real class (1..{num_classes})")]
    BadClass { class: usize, num_classes: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub threads: usize,
    pub ops: u64,
    pub allocations: u64,
    pub failed_allocations: u64,
    pub frees: u64,
    pub drained: usize,
    pub plundered: usize,
    pub elapsed_ns: u64,
    pub ops_per_sec: u64,
    pub stats: CpuCacheStats,
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerTally {
    ops: u64,
    allocations: u64,
    failed_allocations: u64,
    frees: u64,
}

struct XorShift64(u64);

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn worker<C, S, M>(
    cache: &CpuCache<C, S, M>,
    classes: &[usize],
    config: &StressConfig,
    seed: u64,
) -> WorkerTally
where
    C: CentralFreeList + Clone,
    S: CpuSource,
    M: SizeMap,
{
    let mut rng = XorShift64::new(seed);
    let mut live = Vec::with_capacity(config.max_live);
    let mut tally = WorkerTally::default();
    for _ in 0..config.ops_per_thread {
        tally.ops += 1;
        let allocate = live.is_empty() || (live.len() < config.max_live && rng.next() & 1 == 0);
        if allocate {
            match cache.allocate(classes[rng.below(classes.len())]) {
                Some(alloc) => {
                    tally.allocations += 1;
                    live.push(alloc);
                }
                None => tally.failed_allocations += 1,
            }
        } else {
            let idx = rng.below(live.len());
            cache.free(live.swap_remove(idx));
            tally.frees += 1;
        }
    }
    tally.frees += live.len() as u64;
    for alloc in live {
        cache.free(alloc);
    }
    tally
}

/// Runs the storm described by `config` and reports what happened.
pub fn run_stress<C, S, M>(
    cache: &CpuCache<C, S, M>,
    config: &StressConfig,
) -> Result<StressReport, StressError>
where
    C: CentralFreeList + Clone + Sync,
    S: CpuSource,
    M: SizeMap,
{
    if config.threads == 0 {
        return Err(StressError::NoThreads);
    }
    if config.max_live == 0 {
        return Err(StressError::NoLiveObjects);
    }
    let num_classes = cache.sizes().num_base_classes();
    let classes: Vec<usize> = if config.classes.is_empty() {
        (1..num_classes).collect()
    } else {
        config.classes.clone()
    };
    if let Some(&class) = classes.iter().find(|&&cl| cl == 0 || cl >= num_classes) {
        return Err(StressError::BadClass { class, num_classes });
    }
    if classes.is_empty() {
        return Err(StressError::BadClass {
            class: 0,
            num_classes,
        });
    }

    log::info!(
        "stress: threads={} ops_per_thread={} classes={}",
        config.threads,
        config.ops_per_thread,
        classes.len()
    );
    let start = Instant::now();
    let tallies: Vec<WorkerTally> = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|t| {
                let classes = &classes;
                let seed = config.seed.wrapping_add((t as u64).wrapping_mul(0x9E37_79B9));
                scope.spawn(move || worker(cache, classes, config, seed))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });
    let elapsed = start.elapsed();

    let (drained, plundered) = if config.drain {
        let drained = (0..cache.slab().num_cpus())
            .map(|cpu| cache.drain_cpu(cpu))
            .sum();
        (drained, cache.plunder() + cache.plunder())
    } else {
        (0, 0)
    };

    let total = tallies.iter().fold(WorkerTally::default(), |acc, t| WorkerTally {
        ops: acc.ops + t.ops,
        allocations: acc.allocations + t.allocations,
        failed_allocations: acc.failed_allocations + t.failed_allocations,
        frees: acc.frees + t.frees,
    });
    let elapsed_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
    let ops_per_sec = if elapsed_ns == 0 {
        0
    } else {
        u64::try_from(u128::from(total.ops) * 1_000_000_000 / u128::from(elapsed_ns))
            .unwrap_or(u64::MAX)
    };
    log::info!("stress: {} ops in {elapsed:?}", total.ops);

    Ok(StressReport {
        threads: config.threads,
        ops: total.ops,
        allocations: total.allocations,
        failed_allocations: total.failed_allocations,
        frees: total.frees,
        drained,
        plundered,
        elapsed_ns,
        ops_per_sec,
        stats: cache.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use percpu_alloc_core::{
        CacheTopology, CpuCacheOptions, NumaTopology, ShadowCentral, SizeClassTable,
    };

    /// Each call lands on the next CPU. Not fast: a fast source that
    /// migrates on every call would never commit.
    struct RoundRobin(AtomicUsize);

    impl CpuSource for RoundRobin {
        fn current_cpu(&self) -> usize {
            self.0.fetch_add(1, Ordering::Relaxed)
        }
        fn is_fast(&self) -> bool {
            false
        }
    }

    fn cache() -> CpuCache<Arc<ShadowCentral>, RoundRobin> {
        let sizes = SizeClassTable::reference();
        let central = Arc::new(ShadowCentral::fabricating(&sizes));
        CpuCache::new(
            sizes,
            RoundRobin(AtomicUsize::new(0)),
            central,
            NumaTopology::single_partition(),
            CacheTopology::single(3),
            CpuCacheOptions::new(3),
        )
        .unwrap()
    }

    #[test]
    fn every_allocation_is_freed() {
        let cache = cache();
        let config = StressConfig {
            threads: 3,
            ops_per_thread: 2_000,
            max_live: 32,
            classes: vec![1, 4, 17],
            drain: true,
            ..StressConfig::default()
        };
        let report = run_stress(&cache, &config).unwrap();
        assert_eq!(report.ops, 6_000);
        assert_eq!(report.failed_allocations, 0);
        assert_eq!(report.allocations, report.frees);
        assert_eq!(report.stats.cached_per_cpu, vec![0, 0, 0]);
        assert_eq!(
            cache.transfer_caches()[0].central().fabricated() as usize,
            cache.transfer_caches()[0].central().total_len()
        );
    }

    #[test]
    fn rejects_bad_configs() {
        let cache = cache();
        let no_threads = StressConfig {
            threads: 0,
            ..StressConfig::default()
        };
        assert_eq!(
            run_stress(&cache, &no_threads).unwrap_err(),
            StressError::NoThreads
        );
        let reserved = StressConfig {
            classes: vec![2, 0],
            ..StressConfig::default()
        };
        assert!(matches!(
            run_stress(&cache, &reserved).unwrap_err(),
            StressError::BadClass { class: 0, .. }
        ));
    }
}
