//! Engine configuration
//!
//! Bucket width, sealing grace, retention horizon, sketch precision and the
//! per-bucket dimension-value cap are external inputs, loadable from a TOML
//! file. Validation runs once at startup; a bad configuration is fatal,
//! nothing else in the engine is.

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::sketch::{MAX_PRECISION, MIN_PRECISION};

/// Configuration for one [`AggregationEngine`](super::AggregationEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregateConfig {
    /// Ingestion-side bucket width in seconds.
    pub bucket_width_secs: u64,
    /// Grace period after a bucket's end before it seals.
    pub seal_grace_secs: u64,
    /// Horizon after which sealed buckets are evicted.
    pub retention_secs: u64,
    /// HyperLogLog precision for unique-domain sketches (4 ..= 18).
    pub sketch_precision: u8,
    /// Cap on distinct values per count map per bucket; overflow values are
    /// dropped from the map (and counted), never an ingest failure.
    pub max_values_per_dimension: usize,
    /// Cadence of the background sealing/eviction task.
    pub housekeeping_interval_secs: u64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            bucket_width_secs: 10,
            seal_grace_secs: 60,
            retention_secs: 7 * 24 * 3_600,
            sketch_precision: 12,
            max_values_per_dimension: 65_536,
            housekeeping_interval_secs: 5,
        }
    }
}

impl AggregateConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: AggregateConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_width_secs == 0 {
            return Err(ConfigError::invalid(
                "bucket_width_secs",
                "bucket width must be positive",
            ));
        }
        if self.retention_secs == 0 {
            return Err(ConfigError::invalid(
                "retention_secs",
                "retention horizon must be positive",
            ));
        }
        if self.retention_secs <= self.bucket_width_secs + self.seal_grace_secs {
            return Err(ConfigError::invalid(
                "retention_secs",
                "retention must outlast bucket width plus sealing grace",
            ));
        }
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&self.sketch_precision) {
            return Err(ConfigError::invalid(
                "sketch_precision",
                "sketch precision must be between 4 and 18",
            ));
        }
        if self.max_values_per_dimension == 0 {
            return Err(ConfigError::invalid(
                "max_values_per_dimension",
                "dimension value cap must be positive",
            ));
        }
        if self.housekeeping_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "housekeeping_interval_secs",
                "housekeeping interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Startup-time configuration failure.
#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    Io(std::io::Error),
    /// Config file is not valid TOML for [`AggregateConfig`].
    Parse(toml::de::Error),
    /// A value fails a semantic constraint.
    #[display(fmt = "invalid {}: {}", parameter, reason)]
    #[from(ignore)]
    Invalid {
        parameter: &'static str,
        reason: &'static str,
    },
}

impl ConfigError {
    fn invalid(parameter: &'static str, reason: &'static str) -> Self {
        ConfigError::Invalid { parameter, reason }
    }
}
