//! Error types.
//!
//! Errors never travel up through the allocation fast path. Library
//! constructors return them as values; the process entry points turn them
//! into [`fatal`] because continuing with a wrong partition table or an
//! ambiguous tunable would silently corrupt every later allocation.

use std::fmt::Display;
use std::io;

use thiserror::Error;

/// Unrecognized value for an environment tunable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("bad {var} env var: {value:?}")]
    BadEnvValue { var: &'static str, value: String },
}

/// Malformed CPU-list text.
#[derive(Debug, Error)]
pub enum CpulistError {
    #[error("invalid cpu number {token:?}")]
    BadInteger { token: String },
    #[error("empty entry in cpu list")]
    EmptyEntry,
    #[error("range {from}-{to} is inverted")]
    InvertedRange { from: usize, to: usize },
    #[error("range starting at {from} has no end")]
    DanglingRange { from: usize },
    #[error("cpu {cpu} exceeds the supported maximum of {max}")]
    CpuOutOfRange { cpu: usize, max: usize },
    #[error("reading cpu list failed: {0}")]
    Io(#[from] io::Error),
}

/// Failure while building the NUMA partition tables.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("opening cpulist for node {node} failed: {source}")]
    Io {
        node: usize,
        #[source]
        source: io::Error,
    },
    #[error("parsing cpulist for node {node} failed: {source}")]
    Cpulist {
        node: usize,
        #[source]
        source: CpulistError,
    },
    #[error("{num_cpus} cpus exceed the supported maximum of {max}")]
    TooManyCpus { num_cpus: usize, max: usize },
    #[error("node {node} exceeds the 64-node partition bitset")]
    TooManyNodes { node: usize },
    #[error("num_partitions must be at least 1")]
    NoPartitions,
    #[error("partition scale {scale_by} does not match {num_base_classes} base size classes")]
    ScaleMismatch {
        scale_by: usize,
        num_base_classes: usize,
    },
}

/// Invalid per-CPU slab layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlabError {
    #[error("per-cpu layout needs {slots} slots, more than the {max} a 16-bit index can address")]
    LayoutTooLarge { slots: usize, max: usize },
    #[error("slab needs at least one cpu")]
    NoCpus,
    #[error("class 0 is reserved and must have zero capacity")]
    ReservedClassCapacity,
}

/// Umbrella error for cache construction.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Slab(#[from] SlabError),
}

/// Reports an unrecoverable startup error and aborts the process.
pub fn fatal(err: &dyn Display) -> ! {
    log::error!("percpu-alloc: fatal: {err}");
    eprintln!("percpu-alloc: fatal: {err}");
    std::process::abort()
}
