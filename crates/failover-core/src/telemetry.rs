//! Tracing subscriber installation
//!
//! TigerStyle: One initialization point; library code only emits events.
//!
//! The coordination primitives log through `tracing` with structured fields
//! (`manager`, `kind`, `activity_id`). Hosts and test harnesses call
//! `init_telemetry` once to decide where those events go.

use crate::error::{Error, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Filter used when neither the config nor `RUST_LOG` sets one
const LOG_FILTER_DEFAULT: &str = "info";

const SERVICE_NAME_DEFAULT: &str = "failover";

/// Environment variable naming the service
pub const SERVICE_NAME_ENV: &str = "FAILOVER_SERVICE_NAME";

/// Line layout for formatted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-field lines with span context
    #[default]
    Full,
    /// One short line per event
    Compact,
}

/// Where and how events are written
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// `EnvFilter` directive, e.g. `failover_infra=debug,info`
    pub log_level: String,
    /// Write formatted events to stdout; when false events are filtered only
    pub stdout_enabled: bool,
    pub format: LogFormat,
    /// Prefix each line with the emitting module
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::new(SERVICE_NAME_DEFAULT)
    }
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_level: LOG_FILTER_DEFAULT.to_string(),
            stdout_enabled: true,
            format: LogFormat::Full,
            with_target: true,
        }
    }

    /// Service name from `FAILOVER_SERVICE_NAME`, filter from `RUST_LOG`
    pub fn from_env() -> Self {
        let service_name =
            std::env::var(SERVICE_NAME_ENV).unwrap_or_else(|_| SERVICE_NAME_DEFAULT.to_string());
        let mut config = Self::new(service_name);
        if let Ok(filter) = std::env::var(EnvFilter::DEFAULT_ENV) {
            config.log_level = filter;
        }
        config
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn without_stdout(mut self) -> Self {
        self.stdout_enabled = false;
        self
    }

    pub fn without_target(mut self) -> Self {
        self.with_target = false;
        self
    }
}

/// Install the global subscriber described by `config`
///
/// `RUST_LOG` takes precedence over `config.log_level`. Returns
/// `TelemetryInitFailed` if a global subscriber already exists.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::TelemetryInitFailed {
            reason: format!("bad log filter {:?}: {}", config.log_level, e),
        })?;

    let stdout = config.stdout_enabled.then(|| {
        let layer = tracing_subscriber::fmt::layer().with_target(config.with_target);
        match config.format {
            LogFormat::Full => layer.boxed(),
            LogFormat::Compact => layer.compact().boxed(),
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .try_init()
        .map_err(|e| Error::TelemetryInitFailed {
            reason: e.to_string(),
        })?;

    tracing::info!(
        service = %config.service_name,
        filter = %config.log_level,
        format = ?config.format,
        "telemetry installed"
    );

    Ok(TelemetryGuard {
        service_name: config.service_name,
    })
}

/// Returned by `init_telemetry`; hold it for the life of the process
#[derive(Debug)]
pub struct TelemetryGuard {
    service_name: String,
}

impl TelemetryGuard {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::debug!(service = %self.service_name, "telemetry guard released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "failover");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.format, LogFormat::Full);
        assert!(config.stdout_enabled);
        assert!(config.with_target);
    }

    #[test]
    fn test_builders() {
        let config = TelemetryConfig::new("node-7")
            .with_log_level("failover_infra=trace")
            .with_format(LogFormat::Compact)
            .without_stdout()
            .without_target();

        assert_eq!(config.service_name, "node-7");
        assert_eq!(config.log_level, "failover_infra=trace");
        assert_eq!(config.format, LogFormat::Compact);
        assert!(!config.stdout_enabled);
        assert!(!config.with_target);
    }

    #[test]
    fn test_only_one_install_succeeds() {
        let first = init_telemetry(TelemetryConfig::new("first").without_stdout());
        let second = init_telemetry(TelemetryConfig::new("second").without_stdout());

        // Another test in this binary may have installed first; two installs
        // never both succeed
        assert!(first.is_err() || second.is_err());
        if let Ok(guard) = first {
            assert_eq!(guard.service_name(), "first");
        }
        if let Err(e) = second {
            assert!(matches!(e, Error::TelemetryInitFailed { .. }));
        }
    }
}
