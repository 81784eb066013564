//! Configuration loading for recode
//!
//! Resolution priority for the data directory: CLI argument, then the
//! `RECODE_DATA_DIR` environment variable, then the TOML config file, then
//! an OS-dependent default. The batch settings themselves come from the
//! TOML file with compiled defaults for every field, so a missing or
//! partial config file is never an error.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Batch-engine settings, all optional in the TOML file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Minimum worker count (floor is always at least 1)
    pub min_concurrency: usize,
    /// Maximum worker count; 0 means 2 x CPU cores
    pub max_concurrency: usize,
    /// Memory usage fraction above which the controller forces a reduction
    pub memory_threshold: f64,
    /// Memory usage fraction that logs a warning
    pub memory_warning_threshold: f64,
    /// Memory usage fraction treated as critical
    pub memory_critical_threshold: f64,
    /// Seconds between memory samples
    pub memory_sample_secs: u64,
    /// Seconds between concurrency re-evaluations
    pub adjust_interval_secs: u64,
    /// Retries per task after the first attempt
    pub retry_count: u32,
    /// Base backoff in milliseconds; attempt N waits N x base
    pub retry_backoff_ms: u64,
    /// Per-task conversion timeout in seconds
    pub task_timeout_secs: u64,
    /// Tuning cache time-to-live in seconds
    pub tuning_cache_ttl_secs: u64,
    /// Persist checkpoint state every N finished tasks
    pub checkpoint_interval: usize,
    /// Skip files whose path is already terminal in a previous session
    pub skip_existing: bool,
    /// Adaptive rule threshold: reduce when memory usage exceeds this
    pub rule_memory_usage: f64,
    /// Adaptive rule threshold: reduce when error rate exceeds this
    pub rule_error_rate: f64,
    /// Adaptive rule threshold: increase when throughput (files/s) is below this
    pub rule_throughput: f64,
    /// Encoder binary invoked for JXL conversions
    pub converter_bin: String,
    /// Encoder binary invoked for AVIF conversions
    pub avif_bin: String,
    /// Comparator binary invoked for validation
    pub validator_bin: String,
    /// Probe binary invoked for file characterization
    pub probe_bin: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 0,
            memory_threshold: 0.80,
            memory_warning_threshold: 0.75,
            memory_critical_threshold: 0.90,
            memory_sample_secs: 2,
            adjust_interval_secs: 5,
            retry_count: 2,
            retry_backoff_ms: 500,
            task_timeout_secs: 300,
            tuning_cache_ttl_secs: 3600,
            checkpoint_interval: 10,
            skip_existing: true,
            rule_memory_usage: 0.8,
            rule_error_rate: 0.1,
            rule_throughput: 0.5,
            converter_bin: "cjxl".to_string(),
            avif_bin: "avifenc".to_string(),
            validator_bin: "magick".to_string(),
            probe_bin: "ffprobe".to_string(),
        }
    }
}

impl BatchConfig {
    /// Load settings from a TOML file, falling back to defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p.clone(),
            None => match default_config_path() {
                Some(p) if p.exists() => p,
                _ => {
                    info!("No config file found, using compiled defaults");
                    return Ok(Self::default());
                }
            },
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid TOML in {}: {}", path.display(), e)))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject value combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency != 0 && self.max_concurrency < self.min_concurrency {
            return Err(Error::Config(format!(
                "max_concurrency ({}) below min_concurrency ({})",
                self.max_concurrency, self.min_concurrency
            )));
        }
        for (name, v) in [
            ("memory_threshold", self.memory_threshold),
            ("memory_warning_threshold", self.memory_warning_threshold),
            ("memory_critical_threshold", self.memory_critical_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::Config(format!("{} must be in [0,1], got {}", name, v)));
            }
        }
        if self.memory_warning_threshold > self.memory_critical_threshold {
            warn!(
                "memory_warning_threshold ({}) above critical ({}); warnings will never fire first",
                self.memory_warning_threshold, self.memory_critical_threshold
            );
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn tuning_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.tuning_cache_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Resolve the data directory (knowledge database, checkpoint state)
///
/// Priority: CLI argument, `RECODE_DATA_DIR`, TOML `data_dir`, OS default.
pub fn resolve_data_dir(cli_arg: Option<&str>) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var("RECODE_DATA_DIR") {
        return PathBuf::from(path);
    }

    if let Some(config_path) = default_config_path() {
        if let Ok(content) = std::fs::read_to_string(&config_path) {
            if let Ok(value) = toml::from_str::<toml::Value>(&content) {
                if let Some(dir) = value.get("data_dir").and_then(|v| v.as_str()) {
                    return PathBuf::from(dir);
                }
            }
        }
    }

    default_data_dir()
}

/// Default configuration file location for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("recode").join("config.toml"))
}

/// Default data directory for the platform
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("recode"))
        .unwrap_or_else(|| PathBuf::from(".recode"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BatchConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: BatchConfig = toml::from_str("retry_count = 5\n").unwrap();
        assert_eq!(config.retry_count, 5);
        assert_eq!(config.min_concurrency, 1);
        assert_eq!(config.memory_threshold, 0.80);
    }

    #[test]
    fn rejects_inverted_concurrency_bounds() {
        let config: BatchConfig =
            toml::from_str("min_concurrency = 8\nmax_concurrency = 2\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let config: BatchConfig = toml::from_str("memory_threshold = 1.5\n").unwrap();
        assert!(config.validate().is_err());
    }
}
