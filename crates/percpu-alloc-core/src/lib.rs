//! # percpu-alloc-core
//!
//! The scalable fast path of a general-purpose memory allocator.
//!
//! Objects are recycled through three tiers:
//! - **Per-CPU slab** (`percpu`): bounded LIFO stacks per CPU and size class,
//!   mutated only inside restartable sections bound to the executing CPU.
//! - **Transfer cache** (`transfer`): one bounded batch cache per size class,
//!   shared by every CPU, standing in front of the central allocator.
//! - **Central allocator**: an external collaborator (`central`).
//!
//! NUMA awareness (`numa`) splits CPUs into independent partitions, each
//! with its own range of size classes, and cache topology
//! (`cache_topology`) optionally shards the transfer cache per last-level
//! cache domain.
//!
//! No `unsafe` code is permitted at the crate level; the OS CPU-id probe in
//! `cpu` is the only exception.

#![deny(unsafe_code)]

pub mod cache_topology;
pub mod central;
pub mod config;
#[allow(unsafe_code)]
pub mod cpu;
pub mod cpu_cache;
pub mod cpulist;
pub mod error;
pub mod experiment;
pub mod metrics;
pub mod numa;
pub mod percpu;
pub mod size_class;
pub mod transfer;

pub use cache_topology::{CacheSharing, CacheTopology};
pub use central::{CentralFreeList, ShadowCentral};
pub use config::{RuntimeConfig, runtime_config};
pub use cpu::{CpuSource, OsCpuSource};
pub use cpu_cache::{Allocation, CpuCache, CpuCacheOptions, CpuCacheStats};
pub use error::{ConfigError, CpulistError, Error, SlabError, TopologyError};
pub use experiment::{Experiment, ExperimentSet};
pub use numa::{NumaBindMode, NumaTopology, TopologyParams};
pub use percpu::PerCpuSlab;
pub use size_class::{PartitionedSizeMap, SizeClassTable, SizeMap};
pub use transfer::{
    TransferCacheImplementation, TransferCacheManager, TransferCacheOptions, TransferCacheStats,
};

/// Upper bound on logical CPU ids tracked by the topology tables.
pub const MAX_CPUS: usize = 1024;

/// Number of NUMA partitions compiled into this build.
pub const NUM_PARTITIONS: usize = if cfg!(feature = "numa") { 2 } else { 1 };

/// Largest batch moved between tiers in one call.
pub const MAX_OBJECTS_TO_MOVE: usize = 128;
