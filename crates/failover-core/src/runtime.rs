//! Scheduler abstraction used by the coordination primitives
//!
//! TigerStyle: Schedulers never call tokio directly; they go through `Runtime`.
//!
//! A `Runtime` offers three things:
//! - a monotonic clock (`now`) for rate limiting decisions
//! - detached task execution (`spawn`) that never runs the future inline
//! - single-shot timers (`after`) built on `sleep`, disarmed by dropping them
//!
//! `TokioRuntime` reads the tokio clock. Under
//! `#[tokio::test(start_paused = true)]` it observes virtual time, which makes
//! interval and timeout behavior deterministic in tests.
//!
//! ```rust,no_run
//! use failover_core::runtime::{Runtime, TokioRuntime};
//! use std::time::Duration;
//!
//! async fn schedule() {
//!     let runtime = TokioRuntime::new();
//!     let timer = runtime.after(Duration::from_millis(100), || {
//!         tracing::info!("timer fired");
//!     });
//!     runtime.sleep(Duration::from_millis(200)).await;
//!     drop(timer);
//! }
//! ```

use crate::constants::RUNTIME_SLEEP_MS_MAX;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::oneshot;

/// Completion of a spawned task
///
/// Dropping it detaches the task; the task keeps running.
pub type JoinHandle<T> = Pin<Box<dyn Future<Output = Result<T, JoinError>> + Send>>;

/// Why a spawned task produced no output
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("spawned task panicked")]
    Panicked,
    #[error("spawned task was cancelled")]
    Cancelled,
}

/// Point on a runtime's monotonic clock, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    /// Milliseconds since the runtime epoch
    pub millis: u64,
}

impl Instant {
    pub fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Time from `earlier` to this instant, zero if `earlier` is later
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_millis(self.millis.saturating_sub(earlier.millis))
    }
}

/// An armed single-shot timer
///
/// Dropping it before the delay elapses disarms the timer: the callback never
/// runs and the sleeping task ends promptly.
#[derive(Debug)]
#[must_use = "dropping a Timer disarms it"]
pub struct Timer {
    _disarm: oneshot::Sender<()>,
}

impl Timer {
    /// Disarm the timer
    pub fn cancel(self) {}
}

/// Clock, task spawner and timer source
///
/// Not object safe because `spawn` is generic; components are generic over
/// `R: Runtime`.
#[async_trait::async_trait]
pub trait Runtime: Send + Sync + Clone {
    /// Current instant on the monotonic clock
    fn now(&self) -> Instant;

    /// Wait for `duration`
    ///
    /// # Panics
    /// If `duration` exceeds `RUNTIME_SLEEP_MS_MAX`.
    async fn sleep(&self, duration: Duration);

    /// Run `future` as an independent task
    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;

    /// Invoke `callback` once, `delay` from now, unless the timer is dropped
    ///
    /// The callback runs on a spawned task. A timer dropped at the moment
    /// the delay elapses may still fire; callers that need exactness check
    /// their own state in the callback.
    fn after<F>(&self, delay: Duration, callback: F) -> Timer
    where
        Self: 'static,
        F: FnOnce() + Send + 'static,
    {
        let (disarm, disarmed) = oneshot::channel::<()>();
        let runtime = self.clone();
        let _task = self.spawn(async move {
            tokio::select! {
                _ = runtime.sleep(delay) => callback(),
                _ = disarmed => {}
            }
        });
        Timer { _disarm: disarm }
    }
}

// =============================================================================
// TokioRuntime
// =============================================================================

/// `Runtime` backed by the ambient tokio runtime
///
/// `now()` counts from the moment this handle was created. Instants are only
/// comparable between clones of the same handle.
#[derive(Debug, Clone)]
pub struct TokioRuntime {
    epoch: tokio::time::Instant,
}

impl TokioRuntime {
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Runtime for TokioRuntime {
    fn now(&self) -> Instant {
        let since_epoch = tokio::time::Instant::now().saturating_duration_since(self.epoch);
        Instant::from_millis(since_epoch.as_millis() as u64)
    }

    async fn sleep(&self, duration: Duration) {
        assert!(
            duration <= Duration::from_millis(RUNTIME_SLEEP_MS_MAX),
            "sleep of {:?} exceeds RUNTIME_SLEEP_MS_MAX",
            duration
        );
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let task = tokio::spawn(future);
        Box::pin(async move {
            task.await.map_err(|e| match e.is_panic() {
                true => JoinError::Panicked,
                false => JoinError::Cancelled,
            })
        })
    }
}
