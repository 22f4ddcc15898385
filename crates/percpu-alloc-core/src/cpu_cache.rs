//! The per-CPU cache front.
//!
//! Ties the slab, the transfer caches and the central free list together.
//! Allocation pops from the executing CPU's slab; an empty slab grows its
//! capacity for the class and refills a batch from the transfer cache.
//! Deallocation pushes onto the slab; a full slab either grows or moves a
//! batch to the transfer cache.
//!
//! With NUMA awareness each partition gets its own copy of the size
//! classes: base class `b` on a CPU of partition `p` is class
//! `b + p * num_base_classes`. The partition tables store `p` already
//! multiplied, so the lookup is one add.

use std::sync::Arc;

use serde::Serialize;

use crate::MAX_OBJECTS_TO_MOVE;
use crate::NUM_PARTITIONS;
use crate::cache_topology::{CacheSharing, CacheTopology, SysfsCacheInfo};
use crate::central::{CentralFreeList, ShadowCentral};
use crate::config::{DEFAULT_WANT_NUMA_AWARE, RuntimeConfig, runtime_config};
use crate::cpu::{CpuSource, OsCpuSource, num_configured_cpus};
use crate::error::{Error, TopologyError, fatal};
use crate::metrics::{self, CpuCacheMetrics, CpuCacheSnapshot, SectionSnapshot};
use crate::numa::{NumaTopology, SysfsCpulist, TopologyParams};
use crate::percpu::PerCpuSlab;
use crate::size_class::{PartitionedSizeMap, SizeClassTable, SizeMap};
use crate::transfer::{
    TransferCacheImplementation, TransferCacheManager, TransferCacheOptions, TransferCacheStats,
};

/// Construction knobs for [`CpuCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCacheOptions {
    pub num_cpus: usize,
    /// Per-CPU capacity limit of each class, in batches.
    pub slab_batches: usize,
    pub implementation: TransferCacheImplementation,
    pub sharing: CacheSharing,
    pub transfer: TransferCacheOptions,
}

impl CpuCacheOptions {
    #[must_use]
    pub fn new(num_cpus: usize) -> Self {
        Self {
            num_cpus,
            slab_batches: 2,
            implementation: TransferCacheImplementation::default(),
            sharing: CacheSharing::Global,
            transfer: TransferCacheOptions::default(),
        }
    }

    /// Options resolved from the runtime configuration and detected cache
    /// topology.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig, num_cpus: usize, caches: &CacheTopology) -> Self {
        Self {
            implementation: config.transfer_cache_implementation(),
            sharing: CacheSharing::choose(config, caches),
            ..Self::new(num_cpus)
        }
    }
}

/// An object handed out by [`CpuCache::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    /// Expanded size class; pass it back to [`CpuCache::deallocate`].
    pub class: usize,
    pub addr: usize,
}

/// Point-in-time view of a cache front.
#[derive(Debug, Clone, Serialize)]
pub struct CpuCacheStats {
    pub implementation: TransferCacheImplementation,
    pub sharing: CacheSharing,
    pub numa_aware: bool,
    pub num_cpus: usize,
    pub num_classes: usize,
    pub transfer_shards: usize,
    pub cache: CpuCacheSnapshot,
    pub sections: SectionSnapshot,
    /// Objects cached on each CPU's slab (racy).
    pub cached_per_cpu: Vec<usize>,
    /// Per-class transfer statistics, summed across shards.
    pub transfer: Vec<TransferCacheStats>,
}

pub struct CpuCache<C, S, M = SizeClassTable> {
    sizes: PartitionedSizeMap<M>,
    numa: NumaTopology,
    caches: CacheTopology,
    slab: PerCpuSlab<S>,
    transfer: Box<[TransferCacheManager<C>]>,
    sharing: CacheSharing,
    metrics: CpuCacheMetrics,
}

impl<C, S, M> CpuCache<C, S, M>
where
    C: CentralFreeList + Clone,
    S: CpuSource,
    M: SizeMap,
{
    /// Builds a cache front. `central` is shared by every transfer cache
    /// shard and must know the NUMA-expanded classes.
    pub fn new(
        sizes: M,
        cpus: S,
        central: C,
        numa: NumaTopology,
        caches: CacheTopology,
        options: CpuCacheOptions,
    ) -> Result<Self, Error> {
        let partitions = if numa.is_numa_aware() {
            if numa.scale_by() != sizes.num_classes() {
                return Err(TopologyError::ScaleMismatch {
                    scale_by: numa.scale_by(),
                    num_base_classes: sizes.num_classes(),
                }
                .into());
            }
            numa.num_partitions()
        } else {
            1
        };
        let sizes = PartitionedSizeMap::new(sizes, partitions);

        let max_capacity: Vec<u16> = (0..sizes.num_classes())
            .map(|cl| {
                let cap = sizes.num_objects_to_move(cl) * options.slab_batches;
                u16::try_from(cap).unwrap_or(u16::MAX)
            })
            .collect();
        let slab = PerCpuSlab::new(cpus, options.num_cpus, &max_capacity)?;

        let shards = match options.sharing {
            CacheSharing::PerL3 => caches.num_domains().max(1),
            CacheSharing::Global => 1,
        };
        let transfer = (0..shards)
            .map(|_| {
                TransferCacheManager::new(
                    options.implementation,
                    &sizes,
                    central.clone(),
                    options.transfer,
                )
            })
            .collect();

        log::info!(
            "percpu-alloc: cache front ready: cpus={} classes={} transfer={} sharing={:?} shards={shards} numa_aware={}",
            options.num_cpus,
            sizes.num_classes(),
            options.implementation.label(),
            options.sharing,
            numa.is_numa_aware(),
        );

        Ok(Self {
            sizes,
            numa,
            caches,
            slab,
            transfer,
            sharing: options.sharing,
            metrics: CpuCacheMetrics::new(),
        })
    }

    /// Expanded class of `base_class` for a CPU.
    #[must_use]
    pub fn class_for(&self, base_class: usize, cpu: usize) -> usize {
        if self.numa.is_numa_aware() {
            base_class + self.numa.scaled_partition_for_cpu(cpu)
        } else {
            base_class
        }
    }

    fn transfer_for(&self, cpu: usize) -> &TransferCacheManager<C> {
        let shard = match self.sharing {
            CacheSharing::PerL3 => self.caches.domain_for_cpu(cpu) % self.transfer.len(),
            CacheSharing::Global => 0,
        };
        &self.transfer[shard]
    }

    fn slab_limit(&self, cl: usize) -> usize {
        self.slab.max_capacity(cl)
    }

    /// Allocates one object of `base_class` on the executing CPU. `None`
    /// means every tier, the central free list included, is out of
    /// objects, or the class is not a real class.
    pub fn allocate(&self, base_class: usize) -> Option<Allocation> {
        if base_class == 0 || base_class >= self.sizes.num_base_classes() {
            return None;
        }
        metrics::inc(&self.metrics.allocs);
        let cl = self.class_for(base_class, self.slab.current_cpu());
        let addr = self
            .slab
            .pop(cl, |cpu, cl| self.refill_and_pop(cpu, cl))?;
        Some(Allocation { class: cl, addr })
    }

    fn refill_and_pop(&self, cpu: usize, cl: usize) -> Option<usize> {
        metrics::inc(&self.metrics.underflows);
        let batch = self.sizes.num_objects_to_move(cl).min(MAX_OBJECTS_TO_MOVE);
        if batch == 0 {
            return None;
        }
        if self.slab.grow(cpu, cl, batch, self.slab_limit(cl)) > 0 {
            metrics::inc(&self.metrics.grows);
        }

        let tc = self.transfer_for(cpu);
        let mut buf = [0usize; MAX_OBJECTS_TO_MOVE];
        let got = tc.remove_range(cl, &mut buf[..batch]);
        let Some((&first, rest)) = buf[..got].split_first() else {
            metrics::inc(&self.metrics.exhausted);
            return None;
        };
        metrics::inc(&self.metrics.refills_from_transfer);
        let pushed = self.slab.push_batch(cl, rest);
        if pushed < rest.len() {
            tc.insert_range(cl, &rest[pushed..]);
        }
        Some(first)
    }

    /// Returns `alloc` to the executing CPU's cache.
    pub fn free(&self, alloc: Allocation) {
        self.deallocate(alloc.class, alloc.addr);
    }

    /// Returns object `item` of expanded class `cl`.
    pub fn deallocate(&self, cl: usize, item: usize) {
        if item == 0 {
            return;
        }
        metrics::inc(&self.metrics.frees);
        self.slab
            .push(cl, item, |cpu, cl, item| self.spill(cpu, cl, item));
    }

    fn spill(&self, cpu: usize, cl: usize, item: usize) {
        metrics::inc(&self.metrics.overflows);
        let tc = self.transfer_for(cpu);
        let batch = self.sizes.num_objects_to_move(cl).min(MAX_OBJECTS_TO_MOVE);
        if batch == 0 {
            tc.insert_range(cl, &[item]);
            return;
        }

        if self.slab.grow(cpu, cl, batch, self.slab_limit(cl)) > 0 {
            metrics::inc(&self.metrics.grows);
            self.slab.push(cl, item, |cpu, cl, item| {
                self.transfer_for(cpu).insert_range(cl, &[item]);
            });
            return;
        }

        let mut buf = [0usize; MAX_OBJECTS_TO_MOVE];
        let popped = self.slab.pop_batch(cl, &mut buf[..batch - 1]);
        buf[popped] = item;
        metrics::inc(&self.metrics.drains_to_transfer);
        tc.insert_range(cl, &buf[..=popped]);
    }

    /// Moves everything cached on `cpu` into the transfer cache and resets
    /// its capacities. Returns the number of objects moved.
    pub fn drain_cpu(&self, cpu: usize) -> usize {
        let tc = self.transfer_for(cpu);
        let drained = self
            .slab
            .drain(cpu, |cl, objects| tc.insert_range(cl, objects));
        log::debug!("percpu-alloc: drained {drained} objects from cpu {cpu}");
        drained
    }

    /// Releases long-unused transfer cache objects to the central list.
    pub fn plunder(&self) -> usize {
        self.transfer.iter().map(TransferCacheManager::plunder_all).sum()
    }

    #[must_use]
    pub fn stats(&self) -> CpuCacheStats {
        let num_classes = self.sizes.num_classes();
        let mut transfer: Vec<TransferCacheStats> = (0..num_classes)
            .map(|class| TransferCacheStats {
                class,
                ..TransferCacheStats::default()
            })
            .collect();
        for shard in self.transfer.iter() {
            for stats in shard.all_stats() {
                transfer[stats.class].merge(&stats);
            }
        }
        transfer.remove(0);

        CpuCacheStats {
            implementation: self.transfer[0].implementation(),
            sharing: self.sharing,
            numa_aware: self.numa.is_numa_aware(),
            num_cpus: self.slab.num_cpus(),
            num_classes,
            transfer_shards: self.transfer.len(),
            cache: self.metrics.snapshot(),
            sections: self.slab.section_stats(),
            cached_per_cpu: (0..self.slab.num_cpus())
                .map(|cpu| self.slab.total_length(cpu))
                .collect(),
            transfer,
        }
    }

    #[must_use]
    pub fn slab(&self) -> &PerCpuSlab<S> {
        &self.slab
    }

    #[must_use]
    pub fn transfer_caches(&self) -> &[TransferCacheManager<C>] {
        &self.transfer
    }

    #[must_use]
    pub fn sizes(&self) -> &PartitionedSizeMap<M> {
        &self.sizes
    }

    #[must_use]
    pub fn numa(&self) -> &NumaTopology {
        &self.numa
    }

    #[must_use]
    pub fn cache_topology(&self) -> &CacheTopology {
        &self.caches
    }
}

impl CpuCache<Arc<ShadowCentral>, OsCpuSource> {
    /// Builds a cache front for this host from an explicit configuration,
    /// backed by a fabricating [`ShadowCentral`].
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, Error> {
        let cpus = OsCpuSource::detect();
        let num_cpus = num_configured_cpus();
        let sizes = SizeClassTable::for_experiments(config.experiments);
        let numa = NumaTopology::build(
            &TopologyParams {
                num_partitions: NUM_PARTITIONS,
                scale_by: sizes.num_classes(),
                fast_cpu: cpus.is_fast(),
                setting: config.numa_aware,
                default_want: DEFAULT_WANT_NUMA_AWARE,
                num_cpus,
            },
            &SysfsCpulist,
        )?;
        let caches = CacheTopology::build(num_cpus, &SysfsCacheInfo);
        let partitions = if numa.is_numa_aware() {
            numa.num_partitions()
        } else {
            1
        };
        let central = Arc::new(ShadowCentral::fabricating(&PartitionedSizeMap::new(
            &sizes, partitions,
        )));
        let options = CpuCacheOptions::from_config(config, num_cpus, &caches);
        Self::new(sizes, cpus, central, numa, caches, options)
    }

    /// Builds a cache front from the process environment, aborting on any
    /// configuration or topology error.
    #[must_use]
    pub fn from_env() -> Self {
        match Self::from_config(&runtime_config()) {
            Ok(cache) => cache,
            Err(err) => fatal(&err),
        }
    }
}

impl<C, S, M> std::fmt::Debug for CpuCache<C, S, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuCache")
            .field("slab", &self.slab)
            .field("transfer_shards", &self.transfer.len())
            .field("sharing", &self.sharing)
            .finish_non_exhaustive()
    }
}
