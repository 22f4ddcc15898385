//! Named runtime experiments.
//!
//! Experiments are switched on by listing their names, comma separated, in
//! `BORG_EXPERIMENTS`. Unknown names are ignored so that binaries built
//! from different revisions can share one launcher configuration.

/// Known experiment ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum Experiment {
    TEST_ONLY_TCMALLOC_POW2_SIZECLASS,
    TEST_ONLY_TCMALLOC_POW2_BELOW64_SIZECLASS,
    TEST_ONLY_TCMALLOC_RING_BUFFER_TRANSFER_CACHE,
    TEST_ONLY_TCMALLOC_SHARDED_TRANSFER_CACHE,
    TCMALLOC_HETEROGENEOUS_CACHES,
}

impl Experiment {
    /// Every experiment, in id order.
    pub const ALL: [Experiment; 5] = [
        Experiment::TEST_ONLY_TCMALLOC_POW2_SIZECLASS,
        Experiment::TEST_ONLY_TCMALLOC_POW2_BELOW64_SIZECLASS,
        Experiment::TEST_ONLY_TCMALLOC_RING_BUFFER_TRANSFER_CACHE,
        Experiment::TEST_ONLY_TCMALLOC_SHARDED_TRANSFER_CACHE,
        Experiment::TCMALLOC_HETEROGENEOUS_CACHES,
    ];

    /// The name used in `BORG_EXPERIMENTS`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::TEST_ONLY_TCMALLOC_POW2_SIZECLASS => "TEST_ONLY_TCMALLOC_POW2_SIZECLASS",
            Self::TEST_ONLY_TCMALLOC_POW2_BELOW64_SIZECLASS => {
                "TEST_ONLY_TCMALLOC_POW2_BELOW64_SIZECLASS"
            }
            Self::TEST_ONLY_TCMALLOC_RING_BUFFER_TRANSFER_CACHE => {
                "TEST_ONLY_TCMALLOC_RING_BUFFER_TRANSFER_CACHE"
            }
            Self::TEST_ONLY_TCMALLOC_SHARDED_TRANSFER_CACHE => {
                "TEST_ONLY_TCMALLOC_SHARDED_TRANSFER_CACHE"
            }
            Self::TCMALLOC_HETEROGENEOUS_CACHES => "TCMALLOC_HETEROGENEOUS_CACHES",
        }
    }

    /// Looks an experiment up by its exact name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }

    const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Set of active experiments. Cheap to copy, fixed after startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExperimentSet {
    bits: u32,
}

impl ExperimentSet {
    /// No experiments active.
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Parses a comma-separated experiment list, ignoring unknown names.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        raw.split(',')
            .map(str::trim)
            .filter_map(Experiment::from_name)
            .fold(Self::empty(), Self::with)
    }

    /// Returns a copy with `experiment` switched on.
    #[must_use]
    pub const fn with(self, experiment: Experiment) -> Self {
        Self {
            bits: self.bits | experiment.bit(),
        }
    }

    #[must_use]
    pub const fn is_active(self, experiment: Experiment) -> bool {
        self.bits & experiment.bit() != 0
    }

    /// Active experiments in id order.
    pub fn iter(self) -> impl Iterator<Item = Experiment> {
        Experiment::ALL.into_iter().filter(move |e| self.is_active(*e))
    }
}
