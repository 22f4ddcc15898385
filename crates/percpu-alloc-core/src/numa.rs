//! NUMA partitioning.
//!
//! Physical NUMA nodes are folded into a small, compile-time number of
//! partitions (`node % num_partitions`). Each partition gets its own range
//! of size classes, so CPUs in different partitions never share transfer
//! cache or central storage. The tables are built once and never mutated.
//!
//! Partition 0 is the fallback: when NUMA awareness is unavailable or not
//! wanted, every CPU maps there and partition 0 holds node 0 only.

use std::fs::File;
use std::io::{self, Read};

use crate::MAX_CPUS;
use crate::config::{DEFAULT_WANT_NUMA_AWARE, NumaAwareSetting};
use crate::cpu::CpuSource;
use crate::cpulist::parse_cpulist;
use crate::error::TopologyError;

/// How strictly a partition's memory should be bound to its nodes.
///
/// Recorded for the region allocator; the caches themselves ignore it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum NumaBindMode {
    /// No binding.
    #[default]
    None,
    /// Bind, but let the kernel fall back to other nodes.
    Advisory,
    /// Bind and fail rather than use another node.
    Strict,
}

/// Provides the CPU-list text for a NUMA node.
pub trait CpulistSource {
    type Reader: Read;

    /// Opens node `node`. Must fail with [`io::ErrorKind::NotFound`] when
    /// the node does not exist.
    fn open(&self, node: usize) -> io::Result<Self::Reader>;
}

/// Reads `/sys/devices/system/node/node<N>/cpulist`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysfsCpulist;

impl CpulistSource for SysfsCpulist {
    type Reader = File;

    fn open(&self, node: usize) -> io::Result<File> {
        File::open(format!("/sys/devices/system/node/node{node}/cpulist"))
    }
}

/// Inputs to [`NumaTopology::build`].
#[derive(Debug, Clone, Copy)]
pub struct TopologyParams {
    /// Number of partitions compiled in.
    pub num_partitions: usize,
    /// Multiplier applied to partition ids stored in the CPU table.
    pub scale_by: usize,
    /// Whether CPU ids come from restartable-sequence support.
    pub fast_cpu: bool,
    /// Parsed `TCMALLOC_NUMA_AWARE`.
    pub setting: NumaAwareSetting,
    /// Awareness wanted when the setting is unset.
    pub default_want: bool,
    /// Configured CPU count; must fit the lookup table.
    pub num_cpus: usize,
}

impl Default for TopologyParams {
    fn default() -> Self {
        Self {
            num_partitions: crate::NUM_PARTITIONS,
            scale_by: 1,
            fast_cpu: false,
            setting: NumaAwareSetting::Unset,
            default_want: DEFAULT_WANT_NUMA_AWARE,
            num_cpus: 1,
        }
    }
}

/// Frozen CPU-to-partition and partition-to-node tables.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    cpu_to_scaled_partition: Box<[usize]>,
    partition_to_nodes: Box<[u64]>,
    num_partitions: usize,
    scale_by: usize,
    bind_mode: NumaBindMode,
    numa_aware: bool,
}

impl NumaTopology {
    fn unaware(num_partitions: usize, scale_by: usize) -> Self {
        let mut partition_to_nodes = vec![0u64; num_partitions].into_boxed_slice();
        // Node 0 always lives in partition 0.
        partition_to_nodes[0] |= 1;
        Self {
            cpu_to_scaled_partition: vec![0; MAX_CPUS].into_boxed_slice(),
            partition_to_nodes,
            num_partitions,
            scale_by,
            bind_mode: NumaBindMode::default(),
            numa_aware: false,
        }
    }

    /// A topology with every CPU in partition 0.
    #[must_use]
    pub fn single_partition() -> Self {
        Self::unaware(1, 1)
    }

    /// Builds the partition tables, probing nodes through `source`.
    pub fn build<S: CpulistSource>(
        params: &TopologyParams,
        source: &S,
    ) -> Result<Self, TopologyError> {
        if params.num_partitions == 0 {
            return Err(TopologyError::NoPartitions);
        }
        let mut topo = Self::unaware(params.num_partitions, params.scale_by);

        if params.num_partitions == 1 {
            return Ok(topo);
        }
        if !params.fast_cpu {
            log::info!("percpu-alloc: rseq unavailable, NUMA awareness disabled");
            return Ok(topo);
        }
        let Some(bind_mode) = params.setting.resolve(params.default_want) else {
            return Ok(topo);
        };
        topo.bind_mode = bind_mode;

        if params.num_cpus > MAX_CPUS {
            return Err(TopologyError::TooManyCpus {
                num_cpus: params.num_cpus,
                max: MAX_CPUS,
            });
        }

        let mut numa_aware = false;
        for node in 0.. {
            let reader = match source.open(node) {
                Ok(reader) => reader,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(source) => return Err(TopologyError::Io { node, source }),
            };
            if node >= 64 {
                return Err(TopologyError::TooManyNodes { node });
            }

            let partition = node % params.num_partitions;
            topo.partition_to_nodes[partition] |= 1 << node;

            // The CPU table already defaults to partition 0.
            if partition == 0 {
                continue;
            }

            let node_cpus = parse_cpulist(reader)
                .map_err(|source| TopologyError::Cpulist { node, source })?;
            for cpu in node_cpus.iter() {
                topo.cpu_to_scaled_partition[cpu] = partition * params.scale_by;
            }
            if !node_cpus.is_empty() {
                numa_aware = true;
            }
        }

        topo.numa_aware = numa_aware;
        log::info!(
            "percpu-alloc: numa topology built: aware={} partitions={} bind={:?} nodes={:?}",
            topo.numa_aware,
            topo.num_partitions,
            topo.bind_mode,
            topo.partition_to_nodes
        );
        Ok(topo)
    }

    /// True if at least one CPU maps to a non-zero partition.
    #[must_use]
    pub fn is_numa_aware(&self) -> bool {
        self.numa_aware
    }

    #[must_use]
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Multiplier applied to partition ids in the CPU table.
    #[must_use]
    pub fn scale_by(&self) -> usize {
        self.scale_by
    }

    #[must_use]
    pub fn bind_mode(&self) -> NumaBindMode {
        self.bind_mode
    }

    /// Partition of `cpu`, pre-multiplied by the build's `scale_by`.
    #[must_use]
    pub fn scaled_partition_for_cpu(&self, cpu: usize) -> usize {
        self.cpu_to_scaled_partition.get(cpu).copied().unwrap_or(0)
    }

    /// Partition of `cpu`.
    #[must_use]
    pub fn partition_for_cpu(&self, cpu: usize) -> usize {
        self.scaled_partition_for_cpu(cpu) / self.scale_by.max(1)
    }

    /// Bitset of node ids folded into `partition`.
    #[must_use]
    pub fn nodes_for_partition(&self, partition: usize) -> u64 {
        self.partition_to_nodes.get(partition).copied().unwrap_or(0)
    }

    /// Partition of the CPU the caller is running on.
    pub fn current_partition(&self, cpus: &impl CpuSource) -> usize {
        if !self.numa_aware {
            return 0;
        }
        self.partition_for_cpu(cpus.current_cpu())
    }
}
