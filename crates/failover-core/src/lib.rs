//! Failover Core
//!
//! Core types, errors, configuration and runtime abstraction for the
//! failover coordination layer.
//!
//! # Overview
//!
//! The coordination primitives in `failover-infra` depend on a small set of
//! collaborators defined here:
//! - `Runtime`: spawning work and single-shot timers
//! - `TimeProvider`: wall-clock timestamps for diagnostics
//! - `ActivityId`: correlation ids for tracing
//! - `FailoverConfig`: validated, immutable configuration
//!
//! # TigerStyle
//!
//! - Explicit limits with big-endian naming (e.g., `CACHE_LOCK_TIMEOUT_MS_MAX`)
//! - Recoverable conditions are values, broken invariants are assertions
//! - No callbacks are ever invoked while an internal lock is held

pub mod activity;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod metrics;
pub mod runtime;
pub mod telemetry;

pub use activity::ActivityId;
pub use clock::{ManualClock, TimeProvider, WallClockTime};
pub use config::{CacheConfig, FailoverConfig, OperationConfig, WorkConfig};
pub use constants::*;
pub use error::{Error, Result};
pub use runtime::{Instant, JoinError, JoinHandle, Runtime, Timer, TokioRuntime};
pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig, TelemetryGuard};
