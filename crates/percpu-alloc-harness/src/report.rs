//! What the cache front discovered about the host.

use serde::Serialize;

use percpu_alloc_core::{
    CacheSharing, CentralFreeList, CpuCache, CpuSource, NumaBindMode, SizeMap,
    TransferCacheImplementation,
};

/// CPUs and nodes of one NUMA partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub partition: usize,
    pub nodes: Vec<usize>,
    pub cpus: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyReport {
    pub rseq: bool,
    pub num_cpus: usize,
    pub numa_aware: bool,
    pub bind_mode: NumaBindMode,
    pub partitions: Vec<PartitionReport>,
    pub l3_domains: usize,
    pub sharing: CacheSharing,
    pub transfer_cache: TransferCacheImplementation,
    pub base_size_classes: usize,
    pub size_classes: usize,
}

impl TopologyReport {
    #[must_use]
    pub fn from_cache<C, S, M>(cache: &CpuCache<C, S, M>) -> Self
    where
        C: CentralFreeList + Clone,
        S: CpuSource,
        M: SizeMap,
    {
        let numa = cache.numa();
        let num_cpus = cache.slab().num_cpus();
        let num_partitions = if numa.is_numa_aware() {
            numa.num_partitions()
        } else {
            1
        };
        let partitions = (0..num_partitions)
            .map(|partition| {
                let mask = numa.nodes_for_partition(partition);
                PartitionReport {
                    partition,
                    nodes: (0..64).filter(|&node| mask & (1u64 << node) != 0).collect(),
                    cpus: (0..num_cpus)
                        .filter(|&cpu| numa.partition_for_cpu(cpu) == partition)
                        .collect(),
                }
            })
            .collect();
        let stats = cache.stats();
        Self {
            rseq: cache.slab().cpu_source().is_fast(),
            num_cpus,
            numa_aware: numa.is_numa_aware(),
            bind_mode: numa.bind_mode(),
            partitions,
            l3_domains: cache.cache_topology().num_domains(),
            sharing: stats.sharing,
            transfer_cache: stats.implementation,
            base_size_classes: cache.sizes().num_base_classes(),
            size_classes: stats.num_classes,
        }
    }
}
