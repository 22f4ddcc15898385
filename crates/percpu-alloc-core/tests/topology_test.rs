//! Configuration, NUMA partitioning and eviction order seen from outside
//! the crate.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use percpu_alloc_core::numa::CpulistSource;
use percpu_alloc_core::{
    CacheTopology, CpuCache, CpuCacheOptions, CpuSource, Error, NumaBindMode, NumaTopology,
    PartitionedSizeMap, RuntimeConfig, ShadowCentral, SizeClassTable, SizeMap, TopologyError,
    TopologyParams, TransferCacheImplementation, TransferCacheManager, TransferCacheOptions,
};

const NUM_CPUS: usize = 8;

/// Node 0 holds CPUs 0-3, node 1 holds CPUs 4-7.
struct TwoNodes(HashMap<usize, &'static str>);

impl TwoNodes {
    fn new() -> Self {
        Self(HashMap::from([(0, "0-3\n"), (1, "4-7\n")]))
    }
}

impl CpulistSource for TwoNodes {
    type Reader = &'static [u8];

    fn open(&self, node: usize) -> io::Result<&'static [u8]> {
        self.0
            .get(&node)
            .map(|text| text.as_bytes())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

struct PinnedCpu(AtomicUsize);

impl CpuSource for PinnedCpu {
    fn current_cpu(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn is_fast(&self) -> bool {
        true
    }
}

fn params(config: &RuntimeConfig, scale_by: usize) -> TopologyParams {
    TopologyParams {
        num_partitions: 2,
        scale_by,
        fast_cpu: true,
        setting: config.numa_aware,
        default_want: false,
        num_cpus: NUM_CPUS,
    }
}

#[test]
fn numa_disabled_by_env_keeps_every_cpu_in_partition_zero() {
    let config = RuntimeConfig::from_values(Some("0"), None, None).unwrap();
    let topo = NumaTopology::build(&params(&config, 1), &TwoNodes::new()).unwrap();
    assert!(!topo.is_numa_aware());
    assert_eq!(topo.num_partitions(), 2);
    for cpu in 0..NUM_CPUS {
        assert_eq!(topo.partition_for_cpu(cpu), 0);
    }
    let cpus = PinnedCpu(AtomicUsize::new(6));
    assert_eq!(topo.current_partition(&cpus), 0);
}

#[test]
fn strict_binding_splits_nodes_into_partitions() {
    let config = RuntimeConfig::from_values(Some("strict-binding"), None, None).unwrap();
    let topo = NumaTopology::build(&params(&config, 10), &TwoNodes::new()).unwrap();
    assert!(topo.is_numa_aware());
    assert_eq!(topo.bind_mode(), NumaBindMode::Strict);
    assert_eq!(topo.partition_for_cpu(3), 0);
    assert_eq!(topo.partition_for_cpu(4), 1);
    assert_eq!(topo.scaled_partition_for_cpu(7), 10);
    assert_eq!(topo.nodes_for_partition(0), 0b01);
    assert_eq!(topo.nodes_for_partition(1), 0b10);

    let cpus = PinnedCpu(AtomicUsize::new(5));
    assert_eq!(topo.current_partition(&cpus), 1);
}

#[test]
fn bad_env_value_is_rejected() {
    assert!(RuntimeConfig::from_values(Some("maybe"), None, None).is_err());
    assert!(RuntimeConfig::from_values(None, Some("2"), None).is_err());
}

#[test]
fn experiments_pick_the_transfer_cache() {
    let plain = RuntimeConfig::from_values(None, None, None).unwrap();
    assert_eq!(
        plain.transfer_cache_implementation(),
        TransferCacheImplementation::Legacy
    );
    let env = RuntimeConfig::from_values(None, Some("1"), None).unwrap();
    assert_eq!(
        env.transfer_cache_implementation(),
        TransferCacheImplementation::Ring
    );
    let forced = RuntimeConfig::from_values(
        None,
        Some("0"),
        Some("UNRELATED,TEST_ONLY_TCMALLOC_RING_BUFFER_TRANSFER_CACHE"),
    )
    .unwrap();
    assert_eq!(
        forced.transfer_cache_implementation(),
        TransferCacheImplementation::Ring
    );
}

fn numa_cache(cpu: usize) -> (CpuCache<Arc<ShadowCentral>, PinnedCpu>, usize) {
    let config = RuntimeConfig::from_values(Some("1"), None, None).unwrap();
    let sizes = SizeClassTable::reference();
    let base = sizes.num_classes();
    let topo = NumaTopology::build(&params(&config, base), &TwoNodes::new()).unwrap();
    let central = Arc::new(ShadowCentral::fabricating(&PartitionedSizeMap::new(
        &sizes, 2,
    )));
    let cache = CpuCache::new(
        sizes,
        PinnedCpu(AtomicUsize::new(cpu)),
        central,
        topo,
        CacheTopology::single(NUM_CPUS),
        CpuCacheOptions::from_config(&config, NUM_CPUS, &CacheTopology::single(NUM_CPUS)),
    )
    .unwrap();
    (cache, base)
}

#[test]
fn partitions_use_disjoint_class_ranges() {
    let (cache, base) = numa_cache(1);
    let near = cache.allocate(3).unwrap();
    assert_eq!(near.class, 3);

    cache.slab().cpu_source().0.store(6, Ordering::Relaxed);
    let far = cache.allocate(3).unwrap();
    assert_eq!(far.class, 3 + base);
    assert_eq!(cache.sizes().base_class(far.class), 3);
    assert_eq!(
        cache.sizes().class_to_size(far.class),
        cache.sizes().class_to_size(near.class)
    );

    // Freeing on the other partition still files the object under its
    // own class.
    cache.free(near);
    assert_eq!(cache.slab().length(6, 3), 1);
    assert!(cache.stats().numa_aware);
}

#[test]
fn scale_must_match_the_size_classes() {
    let config = RuntimeConfig::from_values(Some("1"), None, None).unwrap();
    let sizes = SizeClassTable::reference();
    let topo = NumaTopology::build(&params(&config, 7), &TwoNodes::new()).unwrap();
    let central = Arc::new(ShadowCentral::new(&PartitionedSizeMap::new(&sizes, 2)));
    let err = CpuCache::new(
        sizes,
        PinnedCpu(AtomicUsize::new(0)),
        central,
        topo,
        CacheTopology::single(NUM_CPUS),
        CpuCacheOptions::new(NUM_CPUS),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::Topology(TopologyError::ScaleMismatch { scale_by: 7, .. })
    ));
}

#[test]
fn eviction_rotation_visits_every_class_once() {
    let sizes = SizeClassTable::reference();
    for implementation in [
        TransferCacheImplementation::Legacy,
        TransferCacheImplementation::Ring,
    ] {
        let tc = TransferCacheManager::new(
            implementation,
            &sizes,
            ShadowCentral::new(&sizes),
            TransferCacheOptions::default(),
        );
        let rounds = sizes.num_classes() - 1;
        let visited: BTreeSet<usize> = (0..rounds)
            .map(|_| tc.determine_size_class_to_evict(0))
            .collect();
        assert_eq!(visited, (1..sizes.num_classes()).collect());
        // The cursor wraps back to the first real class.
        assert_eq!(tc.determine_size_class_to_evict(0), 1);
    }
}

#[test]
fn stats_serialize_to_json() {
    let (cache, _) = numa_cache(0);
    let alloc = cache.allocate(1).unwrap();
    cache.free(alloc);
    let json = serde_json::to_value(cache.stats()).unwrap();
    assert_eq!(json["implementation"], "Legacy");
    assert_eq!(json["numa_aware"], true);
    assert_eq!(json["cache"]["allocs"], 1);
    assert_eq!(json["cached_per_cpu"].as_array().unwrap().len(), NUM_CPUS);
}
