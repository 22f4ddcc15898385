//! Runtime tunables.
//!
//! Three environment variables steer the fast path:
//! - `TCMALLOC_NUMA_AWARE`: unset (compiled default), `0`, `no-binding`,
//!   `1` / `advisory-binding`, `strict-binding`.
//! - `TCMALLOC_INTERNAL_TRANSFERCACHE_CONTROL`: unset, `0` (legacy) or `1`
//!   (ring).
//! - `BORG_EXPERIMENTS`: comma-separated experiment names.
//!
//! Parsing is strict: any other value is a [`ConfigError`]. Parsers take
//! `Option<&str>` so callers and tests never have to touch the process
//! environment.

use std::sync::OnceLock;

use crate::error::{ConfigError, fatal};
use crate::experiment::{Experiment, ExperimentSet};
use crate::numa::NumaBindMode;
use crate::transfer::TransferCacheImplementation;

pub const NUMA_AWARE_ENV: &str = "TCMALLOC_NUMA_AWARE";
pub const TRANSFER_CACHE_CONTROL_ENV: &str = "TCMALLOC_INTERNAL_TRANSFERCACHE_CONTROL";
pub const EXPERIMENTS_ENV: &str = "BORG_EXPERIMENTS";

/// Whether NUMA awareness is wanted when `TCMALLOC_NUMA_AWARE` is unset.
pub const DEFAULT_WANT_NUMA_AWARE: bool = false;

/// Parsed `TCMALLOC_NUMA_AWARE`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum NumaAwareSetting {
    /// Not set; follow the compiled-in default.
    #[default]
    Unset,
    /// Explicitly disabled.
    Disabled,
    /// Explicitly enabled with the given binding behavior.
    Enabled(NumaBindMode),
}

impl NumaAwareSetting {
    pub fn parse(raw: Option<&str>) -> Result<Self, ConfigError> {
        match raw {
            None => Ok(Self::Unset),
            Some("0") => Ok(Self::Disabled),
            Some("no-binding") => Ok(Self::Enabled(NumaBindMode::None)),
            Some("1" | "advisory-binding") => Ok(Self::Enabled(NumaBindMode::Advisory)),
            Some("strict-binding") => Ok(Self::Enabled(NumaBindMode::Strict)),
            Some(other) => Err(ConfigError::BadEnvValue {
                var: NUMA_AWARE_ENV,
                value: other.to_string(),
            }),
        }
    }

    /// Resolves against the compiled-in default. `None` means disabled.
    #[must_use]
    pub fn resolve(self, default_want: bool) -> Option<NumaBindMode> {
        match self {
            Self::Unset if default_want => Some(NumaBindMode::default()),
            Self::Unset | Self::Disabled => None,
            Self::Enabled(mode) => Some(mode),
        }
    }
}

/// Parsed `TCMALLOC_INTERNAL_TRANSFERCACHE_CONTROL`.
pub fn parse_transfer_cache_control(
    raw: Option<&str>,
) -> Result<Option<TransferCacheImplementation>, ConfigError> {
    match raw {
        None => Ok(None),
        Some("0") => Ok(Some(TransferCacheImplementation::Legacy)),
        Some("1") => Ok(Some(TransferCacheImplementation::Ring)),
        Some(other) => Err(ConfigError::BadEnvValue {
            var: TRANSFER_CACHE_CONTROL_ENV,
            value: other.to_string(),
        }),
    }
}

/// All tunables, resolved once at startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub numa_aware: NumaAwareSetting,
    pub transfer_cache_override: Option<TransferCacheImplementation>,
    pub experiments: ExperimentSet,
}

impl RuntimeConfig {
    /// Builds a config from raw variable values.
    pub fn from_values(
        numa_aware: Option<&str>,
        transfer_cache_control: Option<&str>,
        experiments: Option<&str>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            numa_aware: NumaAwareSetting::parse(numa_aware)?,
            transfer_cache_override: parse_transfer_cache_control(transfer_cache_control)?,
            experiments: experiments.map(ExperimentSet::parse).unwrap_or_default(),
        })
    }

    /// Reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let numa = std::env::var(NUMA_AWARE_ENV).ok();
        let control = std::env::var(TRANSFER_CACHE_CONTROL_ENV).ok();
        let experiments = std::env::var(EXPERIMENTS_ENV).ok();
        Self::from_values(numa.as_deref(), control.as_deref(), experiments.as_deref())
    }

    /// Reads the process environment, aborting on a bad value.
    #[must_use]
    pub fn from_env_or_abort() -> Self {
        match Self::from_env() {
            Ok(config) => config,
            Err(err) => fatal(&err),
        }
    }

    /// Chooses the transfer cache implementation: a forced experiment wins,
    /// then the environment override, then legacy.
    #[must_use]
    pub fn transfer_cache_implementation(&self) -> TransferCacheImplementation {
        if self
            .experiments
            .is_active(Experiment::TEST_ONLY_TCMALLOC_RING_BUFFER_TRANSFER_CACHE)
        {
            return TransferCacheImplementation::Ring;
        }
        self.transfer_cache_override
            .unwrap_or(TransferCacheImplementation::Legacy)
    }

    #[must_use]
    pub fn wants_sharded_transfer_cache(&self) -> bool {
        self.experiments
            .is_active(Experiment::TEST_ONLY_TCMALLOC_SHARDED_TRANSFER_CACHE)
    }
}

static GLOBAL_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// The process configuration (reads the environment on first call, caches
/// thereafter). Aborts on a bad value.
#[must_use]
pub fn runtime_config() -> RuntimeConfig {
    *GLOBAL_CONFIG.get_or_init(RuntimeConfig::from_env_or_abort)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_numa_aware_values() {
        assert_eq!(NumaAwareSetting::parse(None).unwrap(), NumaAwareSetting::Unset);
        assert_eq!(
            NumaAwareSetting::parse(Some("0")).unwrap(),
            NumaAwareSetting::Disabled
        );
        assert_eq!(
            NumaAwareSetting::parse(Some("no-binding")).unwrap(),
            NumaAwareSetting::Enabled(NumaBindMode::None)
        );
        assert_eq!(
            NumaAwareSetting::parse(Some("1")).unwrap(),
            NumaAwareSetting::Enabled(NumaBindMode::Advisory)
        );
        assert_eq!(
            NumaAwareSetting::parse(Some("advisory-binding")).unwrap(),
            NumaAwareSetting::Enabled(NumaBindMode::Advisory)
        );
        assert_eq!(
            NumaAwareSetting::parse(Some("strict-binding")).unwrap(),
            NumaAwareSetting::Enabled(NumaBindMode::Strict)
        );
    }

    #[test]
    fn bad_numa_aware_value_is_rejected() {
        let err = NumaAwareSetting::parse(Some("yes")).unwrap_err();
        assert_eq!(
            err,
            ConfigError::BadEnvValue {
                var: NUMA_AWARE_ENV,
                value: "yes".to_string()
            }
        );
        // Case matters.
        assert!(NumaAwareSetting::parse(Some("Strict-Binding")).is_err());
    }

    #[test]
    fn unset_follows_default() {
        assert_eq!(NumaAwareSetting::Unset.resolve(false), None);
        assert_eq!(
            NumaAwareSetting::Unset.resolve(true),
            Some(NumaBindMode::None)
        );
        assert_eq!(NumaAwareSetting::Disabled.resolve(true), None);
    }

    #[test]
    fn transfer_cache_control_values() {
        assert_eq!(parse_transfer_cache_control(None).unwrap(), None);
        assert_eq!(
            parse_transfer_cache_control(Some("0")).unwrap(),
            Some(TransferCacheImplementation::Legacy)
        );
        assert_eq!(
            parse_transfer_cache_control(Some("1")).unwrap(),
            Some(TransferCacheImplementation::Ring)
        );
        assert!(parse_transfer_cache_control(Some("2")).is_err());
        assert!(parse_transfer_cache_control(Some("")).is_err());
    }

    #[test]
    fn implementation_selection_order() {
        let default = RuntimeConfig::from_values(None, None, None).unwrap();
        assert_eq!(
            default.transfer_cache_implementation(),
            TransferCacheImplementation::Legacy
        );

        let ring = RuntimeConfig::from_values(None, Some("1"), None).unwrap();
        assert_eq!(
            ring.transfer_cache_implementation(),
            TransferCacheImplementation::Ring
        );

        // The forced experiment beats an explicit legacy override.
        let forced = RuntimeConfig::from_values(
            None,
            Some("0"),
            Some("TEST_ONLY_TCMALLOC_RING_BUFFER_TRANSFER_CACHE"),
        )
        .unwrap();
        assert_eq!(
            forced.transfer_cache_implementation(),
            TransferCacheImplementation::Ring
        );
    }

    #[test]
    fn any_bad_value_fails_the_whole_config() {
        assert!(RuntimeConfig::from_values(Some("bogus"), None, None).is_err());
        assert!(RuntimeConfig::from_values(None, Some("ring"), None).is_err());
    }
}
