//! Cache front and slab benchmarks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use percpu_alloc_core::{
    CacheTopology, CpuCache, CpuCacheOptions, CpuSource, NumaTopology, PerCpuSlab, ShadowCentral,
    SizeClassTable, SizeMap, TransferCacheImplementation,
};

struct PinnedCpu(AtomicUsize);

impl CpuSource for PinnedCpu {
    fn current_cpu(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn is_fast(&self) -> bool {
        true
    }
}

fn cache(implementation: TransferCacheImplementation) -> CpuCache<Arc<ShadowCentral>, PinnedCpu> {
    let sizes = SizeClassTable::reference();
    let central = Arc::new(ShadowCentral::fabricating(&sizes));
    let options = CpuCacheOptions {
        implementation,
        ..CpuCacheOptions::new(4)
    };
    CpuCache::new(
        sizes,
        PinnedCpu(AtomicUsize::new(0)),
        central,
        NumaTopology::single_partition(),
        CacheTopology::single(4),
        options,
    )
    .expect("bench cache")
}

fn bench_slab_push_pop(c: &mut Criterion) {
    let sizes = SizeClassTable::reference();
    let limits: Vec<u16> = (0..sizes.num_classes())
        .map(|cl| if cl == 0 { 0 } else { 64 })
        .collect();
    let slab = PerCpuSlab::new(PinnedCpu(AtomicUsize::new(0)), 1, &limits).expect("bench slab");
    slab.grow(0, 1, 64, 64);

    c.bench_function("slab_push_pop", |b| {
        b.iter(|| {
            slab.push(1, 0x1000, |_, _, _| {});
            criterion::black_box(slab.pop(1, |_, _| None));
        });
    });
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let classes: &[usize] = &[1, 4, 12, 22, 32];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for implementation in [
        TransferCacheImplementation::Legacy,
        TransferCacheImplementation::Ring,
    ] {
        let cache = cache(implementation);
        for &cl in classes {
            group.bench_with_input(
                BenchmarkId::new(implementation.label(), cl),
                &cl,
                |b, &cl| {
                    b.iter(|| {
                        let alloc = cache.allocate(cl).expect("fabricating central");
                        cache.free(criterion::black_box(alloc));
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    for implementation in [
        TransferCacheImplementation::Legacy,
        TransferCacheImplementation::Ring,
    ] {
        let cache = cache(implementation);
        group.bench_function(BenchmarkId::new(implementation.label(), "1000xclass4"), |b| {
            b.iter(|| {
                let allocs: Vec<_> = (0..1000).filter_map(|_| cache.allocate(4)).collect();
                for alloc in allocs {
                    cache.free(alloc);
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_slab_push_pop,
    bench_alloc_free_cycle,
    bench_alloc_burst
);
criterion_main!(benches);
