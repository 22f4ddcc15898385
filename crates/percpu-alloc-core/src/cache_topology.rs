//! Last-level cache domains.
//!
//! CPUs that share an L3 cache are grouped into one domain. When sharded
//! transfer caches are enabled, each domain gets its own transfer cache so
//! that batches stay cache-local. Detection reads
//! `/sys/devices/system/cpu/cpu<N>/cache/index<I>/{level,shared_cpu_list}`;
//! anything unexpected degrades to a single domain.

use std::fs;
use std::io;

use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::cpulist::parse_cpulist_str;

/// Cache attributes of one CPU.
pub trait CacheInfoSource {
    /// Contents of `index<index>/level` for `cpu`. Must fail with
    /// [`io::ErrorKind::NotFound`] past the last cache index.
    fn level(&self, cpu: usize, index: usize) -> io::Result<String>;

    /// Contents of `index<index>/shared_cpu_list` for `cpu`.
    fn shared_cpu_list(&self, cpu: usize, index: usize) -> io::Result<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SysfsCacheInfo;

impl SysfsCacheInfo {
    fn read(cpu: usize, index: usize, leaf: &str) -> io::Result<String> {
        fs::read_to_string(format!(
            "/sys/devices/system/cpu/cpu{cpu}/cache/index{index}/{leaf}"
        ))
    }
}

impl CacheInfoSource for SysfsCacheInfo {
    fn level(&self, cpu: usize, index: usize) -> io::Result<String> {
        Self::read(cpu, index, "level")
    }

    fn shared_cpu_list(&self, cpu: usize, index: usize) -> io::Result<String> {
        Self::read(cpu, index, "shared_cpu_list")
    }
}

/// CPU to L3-domain mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTopology {
    domain_for_cpu: Box<[usize]>,
    num_domains: usize,
}

/// Finds the L3 sharing list of `cpu`, or `None` if it has no L3.
fn l3_shared_list(source: &impl CacheInfoSource, cpu: usize) -> io::Result<Option<String>> {
    for index in 0.. {
        let level = match source.level(cpu, index) {
            Ok(level) => level,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if level.trim() == "3" {
            return source.shared_cpu_list(cpu, index).map(Some);
        }
    }
    Ok(None)
}

impl CacheTopology {
    /// Every CPU in one domain.
    #[must_use]
    pub fn single(num_cpus: usize) -> Self {
        Self {
            domain_for_cpu: vec![0; num_cpus.max(1)].into_boxed_slice(),
            num_domains: 1,
        }
    }

    /// Groups `num_cpus` CPUs by shared L3, degrading to one domain on any
    /// read or parse failure.
    pub fn build(num_cpus: usize, source: &impl CacheInfoSource) -> Self {
        match Self::try_build(num_cpus, source) {
            Some(topo) => {
                log::info!(
                    "percpu-alloc: {} l3 domain(s) across {num_cpus} cpus",
                    topo.num_domains
                );
                topo
            }
            None => {
                log::info!("percpu-alloc: l3 topology unavailable, using one domain");
                Self::single(num_cpus)
            }
        }
    }

    fn try_build(num_cpus: usize, source: &impl CacheInfoSource) -> Option<Self> {
        if num_cpus == 0 {
            return None;
        }
        let mut domain_for_cpu: Vec<Option<usize>> = vec![None; num_cpus];
        let mut num_domains = 0;
        for cpu in 0..num_cpus {
            if domain_for_cpu[cpu].is_some() {
                continue;
            }
            // Offline CPUs have no cache directory; they stay in domain 0.
            let Some(text) = l3_shared_list(source, cpu).ok()? else {
                continue;
            };
            let shared = parse_cpulist_str(&text).ok()?;
            if !shared.contains(cpu) {
                return None;
            }
            for peer in shared.iter().filter(|&peer| peer < num_cpus) {
                domain_for_cpu[peer].get_or_insert(num_domains);
            }
            num_domains += 1;
        }
        if num_domains == 0 {
            return None;
        }
        Some(Self {
            domain_for_cpu: domain_for_cpu
                .into_iter()
                .map(|domain| domain.unwrap_or(0))
                .collect(),
            num_domains,
        })
    }

    #[must_use]
    pub fn num_domains(&self) -> usize {
        self.num_domains
    }

    /// Domain of `cpu`; unknown CPUs fall into domain 0.
    #[must_use]
    pub fn domain_for_cpu(&self, cpu: usize) -> usize {
        self.domain_for_cpu.get(cpu).copied().unwrap_or(0)
    }
}

/// How many transfer caches the cache front keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheSharing {
    /// One transfer cache for every CPU.
    Global,
    /// One transfer cache per L3 domain.
    PerL3,
}

impl CacheSharing {
    /// Shards only when asked to and when there is more than one domain.
    #[must_use]
    pub fn choose(config: &RuntimeConfig, topology: &CacheTopology) -> Self {
        if config.wants_sharded_transfer_cache() && topology.num_domains() > 1 {
            Self::PerL3
        } else {
            Self::Global
        }
    }
}
