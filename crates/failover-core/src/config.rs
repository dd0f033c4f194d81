//! Configuration for failover coordination
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the coordination layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Versioned cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Operation admission configuration
    #[serde(default)]
    pub operations: OperationConfig,

    /// Background work configuration
    #[serde(default)]
    pub work: WorkConfig,
}

impl FailoverConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.operations.validate()?;
        self.work.validate()?;
        Ok(())
    }
}

/// Versioned cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a writer waits for a locked entry (milliseconds)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    CACHE_LOCK_TIMEOUT_MS_DEFAULT
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl CacheConfig {
    /// Lock timeout as a duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Check the cache section on its own
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms > CACHE_LOCK_TIMEOUT_MS_MAX {
            return Err(Error::InvalidConfiguration {
                field: "cache.lock_timeout_ms".into(),
                reason: format!(
                    "{} exceeds limit {}",
                    self.lock_timeout_ms, CACHE_LOCK_TIMEOUT_MS_MAX
                ),
            });
        }
        Ok(())
    }
}

/// Operation admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Maximum concurrent instances of a multi-instance operation kind
    #[serde(default = "default_instances_max")]
    pub instances_count_max: usize,
}

fn default_instances_max() -> usize {
    OPERATION_INSTANCES_COUNT_MAX
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            instances_count_max: default_instances_max(),
        }
    }
}

impl OperationConfig {
    /// Check the operations section on its own
    pub fn validate(&self) -> Result<()> {
        if self.instances_count_max == 0 {
            return Err(Error::InvalidConfiguration {
                field: "operations.instances_count_max".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.instances_count_max > OPERATION_INSTANCES_COUNT_MAX {
            return Err(Error::InvalidConfiguration {
                field: "operations.instances_count_max".into(),
                reason: format!(
                    "{} exceeds limit {}",
                    self.instances_count_max, OPERATION_INSTANCES_COUNT_MAX
                ),
            });
        }
        Ok(())
    }
}

/// Background work configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkConfig {
    /// Minimum spacing between execution starts (milliseconds)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Delay before work that asked for a retry runs again (milliseconds)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_min_interval_ms() -> u64 {
    WORK_MIN_INTERVAL_MS_DEFAULT
}

fn default_retry_interval_ms() -> u64 {
    WORK_RETRY_INTERVAL_MS_DEFAULT
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl WorkConfig {
    /// Minimum interval as a duration
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Retry interval as a duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Check the work section on its own
    pub fn validate(&self) -> Result<()> {
        if self.min_interval_ms > WORK_MIN_INTERVAL_MS_MAX {
            return Err(Error::InvalidConfiguration {
                field: "work.min_interval_ms".into(),
                reason: format!(
                    "{} exceeds limit {}",
                    self.min_interval_ms, WORK_MIN_INTERVAL_MS_MAX
                ),
            });
        }

        if self.retry_interval_ms > WORK_RETRY_INTERVAL_MS_MAX {
            return Err(Error::InvalidConfiguration {
                field: "work.retry_interval_ms".into(),
                reason: format!(
                    "{} exceeds limit {}",
                    self.retry_interval_ms, WORK_RETRY_INTERVAL_MS_MAX
                ),
            });
        }

        if self.retry_interval_ms < self.min_interval_ms {
            return Err(Error::InvalidConfiguration {
                field: "work.retry_interval_ms".into(),
                reason: "must be greater than or equal to min_interval_ms".into(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FailoverConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_shorter_than_min_interval_rejected() {
        let mut config = FailoverConfig::default();
        config.work.min_interval_ms = 1000;
        config.work.retry_interval_ms = 500;

        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("work.retry_interval_ms"));
    }

    #[test]
    fn test_lock_timeout_limit() {
        let mut config = FailoverConfig::default();
        config.cache.lock_timeout_ms = CACHE_LOCK_TIMEOUT_MS_MAX + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_instances_rejected() {
        let mut config = FailoverConfig::default();
        config.operations.instances_count_max = 0;

        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("operations.instances_count_max"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FailoverConfig =
            serde_json::from_str(r#"{ "work": { "min_interval_ms": 250 } }"#).unwrap();

        assert_eq!(config.work.min_interval_ms, 250);
        assert_eq!(config.work.retry_interval_ms, WORK_RETRY_INTERVAL_MS_DEFAULT);
        assert_eq!(config.cache.lock_timeout_ms, CACHE_LOCK_TIMEOUT_MS_DEFAULT);
        assert_eq!(config.work.min_interval(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }
}
