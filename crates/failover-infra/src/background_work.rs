//! Debounced, rate-limited background work
//!
//! TigerStyle: At most one execution in flight, at most one pending request,
//! never user code under the lock.
//!
//! # State machine
//!
//! ```text
//!   Idle --request, interval elapsed--> Executing
//!   Idle --request, too soon---------> PendingDelayed --timer--> Executing
//!   Executing --request--------------> PendingWhileExecuting
//!   Executing --done-----------------> Idle
//!   Executing --retry----------------> PendingDelayed (after retry_interval)
//!   PendingWhileExecuting --done/retry--> Executing or PendingDelayed
//!   any --close--> Closed (terminal)
//! ```
//!
//! The minimum interval is measured between execution starts. A long
//! execution followed by a pending request may therefore run back to back.
//!
//! Requests arriving while a request is already pending are dropped; the
//! pending activity id is kept.

use async_trait::async_trait;
use failover_core::{
    metrics, ActivityId, Instant, Runtime, Timer, WorkConfig, RUNTIME_SLEEP_MS_MAX,
    WORK_MANAGER_NAME_LENGTH_BYTES_MAX,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Result of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing left to do until the next request
    Done,
    /// Run again after the retry interval
    Retry,
}

/// Work executed by a `BackgroundWorkManager`
///
/// Must be idempotent over the current state it reconciles: coalesced
/// requests are never replayed individually.
#[async_trait]
pub trait BackgroundWork: Send + Sync + 'static {
    async fn execute(&self, activity_id: ActivityId) -> WorkOutcome;
}

/// Observable phase of a `BackgroundWorkManager`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkPhase {
    Idle,
    Executing,
    PendingWhileExecuting,
    PendingDelayed,
    Closed,
}

impl fmt::Display for WorkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkPhase::Idle => write!(f, "idle"),
            WorkPhase::Executing => write!(f, "executing"),
            WorkPhase::PendingWhileExecuting => write!(f, "pending_while_executing"),
            WorkPhase::PendingDelayed => write!(f, "pending_delayed"),
            WorkPhase::Closed => write!(f, "closed"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Settings for one `BackgroundWorkManager`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundWorkConfig {
    /// Trace id, e.g. the owning node
    pub id: String,
    /// Manager name used in logs and metric labels
    pub name: String,
    /// Minimum spacing between execution starts
    pub min_interval: Duration,
    /// Delay before re-running work that returned `Retry`; `None` drops retries
    pub retry_interval: Option<Duration>,
}

impl BackgroundWorkConfig {
    pub fn new(name: impl Into<String>, min_interval: Duration) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            min_interval,
            retry_interval: None,
        }
    }

    /// Manager settings from a validated `WorkConfig`
    pub fn from_work_config(name: impl Into<String>, config: &WorkConfig) -> Self {
        Self::new(name, config.min_interval()).with_retry_interval(config.retry_interval())
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = Some(retry_interval);
        self
    }

    fn assert_valid(&self) {
        let interval_max = Duration::from_millis(RUNTIME_SLEEP_MS_MAX);

        assert!(!self.name.is_empty(), "work manager name cannot be empty");
        assert!(
            self.name.len() <= WORK_MANAGER_NAME_LENGTH_BYTES_MAX,
            "work manager name too long: {} bytes",
            self.name.len()
        );
        assert!(
            self.min_interval <= interval_max,
            "min_interval {:?} exceeds {:?}",
            self.min_interval,
            interval_max
        );
        if let Some(retry_interval) = self.retry_interval {
            assert!(
                retry_interval >= self.min_interval,
                "retry_interval {:?} shorter than min_interval {:?}",
                retry_interval,
                self.min_interval
            );
            assert!(
                retry_interval <= interval_max,
                "retry_interval {:?} exceeds {:?}",
                retry_interval,
                interval_max
            );
        }
    }
}

// =============================================================================
// Internal state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Executing,
    PendingWhileExecuting(ActivityId),
    PendingDelayed {
        activity_id: ActivityId,
        is_retry: bool,
    },
    Closed,
}

impl Phase {
    fn public(self) -> WorkPhase {
        match self {
            Phase::Idle => WorkPhase::Idle,
            Phase::Executing => WorkPhase::Executing,
            Phase::PendingWhileExecuting(_) => WorkPhase::PendingWhileExecuting,
            Phase::PendingDelayed { .. } => WorkPhase::PendingDelayed,
            Phase::Closed => WorkPhase::Closed,
        }
    }
}

struct WorkState {
    phase: Phase,
    last_execution_start: Option<Instant>,
    /// Bumped when a timer is armed or invalidated; stale timers compare unequal
    timer_generation: u64,
    /// Timer for the current generation; replacing or clearing it disarms it
    timer: Option<Timer>,
    execution_count: u64,
}

/// What to do once the state lock is released
enum Action {
    None,
    Execute(ActivityId),
    ArmTimer { generation: u64, delay: Duration },
}

struct WorkInner<R: Runtime> {
    config: BackgroundWorkConfig,
    runtime: R,
    work: Arc<dyn BackgroundWork>,
    state: Mutex<WorkState>,
}

impl<R: Runtime + 'static> WorkInner<R> {
    /// Execute now if the interval allows, otherwise arm the timer
    ///
    /// Caller holds the state lock.
    fn schedule_or_defer(&self, state: &mut WorkState, activity_id: ActivityId) -> Action {
        let now = self.runtime.now();
        let wait = match state.last_execution_start {
            Some(start) => self
                .config
                .min_interval
                .saturating_sub(now.saturating_duration_since(start)),
            None => Duration::ZERO,
        };

        if wait.is_zero() {
            Self::begin_execution(state, now, activity_id)
        } else {
            state.phase = Phase::PendingDelayed {
                activity_id,
                is_retry: false,
            };
            Self::arm(state, wait)
        }
    }

    fn begin_execution(state: &mut WorkState, now: Instant, activity_id: ActivityId) -> Action {
        state.phase = Phase::Executing;
        state.last_execution_start = Some(now);
        state.timer_generation += 1;
        state.timer = None;
        state.execution_count += 1;
        Action::Execute(activity_id)
    }

    fn arm(state: &mut WorkState, delay: Duration) -> Action {
        state.timer_generation += 1;
        state.timer = None;
        Action::ArmTimer {
            generation: state.timer_generation,
            delay,
        }
    }

    fn request(self: &Arc<Self>, activity_id: ActivityId) {
        let action = {
            let mut state = self.state.lock();
            let phase = state.phase;
            match phase {
                Phase::Closed => {
                    trace!(manager = %self.config.name, %activity_id, "request after close dropped");
                    Action::None
                }
                Phase::Idle => self.schedule_or_defer(&mut state, activity_id),
                Phase::Executing => {
                    state.phase = Phase::PendingWhileExecuting(activity_id);
                    Action::None
                }
                Phase::PendingDelayed { is_retry: true, .. } => {
                    // A fresh request does not wait out the retry backoff
                    self.schedule_or_defer(&mut state, activity_id)
                }
                Phase::PendingWhileExecuting(pending)
                | Phase::PendingDelayed {
                    activity_id: pending,
                    ..
                } => {
                    trace!(
                        manager = %self.config.name,
                        %activity_id,
                        %pending,
                        "request coalesced"
                    );
                    metrics::record_work_request_coalesced(&self.config.name);
                    Action::None
                }
            }
        };

        self.apply(action);
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let action = {
            let mut state = self.state.lock();
            if state.timer_generation != generation {
                trace!(manager = %self.config.name, generation, "stale timer ignored");
                return;
            }

            let phase = state.phase;
            match phase {
                Phase::PendingDelayed { activity_id, .. } => {
                    let now = self.runtime.now();
                    Self::begin_execution(&mut state, now, activity_id)
                }
                _ => Action::None,
            }
        };

        self.apply(action);
    }

    fn on_work_complete(self: &Arc<Self>, activity_id: ActivityId, outcome: WorkOutcome) {
        let action = {
            let mut state = self.state.lock();
            let phase = state.phase;
            match phase {
                Phase::Closed => {
                    debug!(manager = %self.config.name, %activity_id, "work completed after close");
                    Action::None
                }
                Phase::PendingWhileExecuting(pending) => {
                    self.schedule_or_defer(&mut state, pending)
                }
                Phase::Executing => match (outcome, self.config.retry_interval) {
                    (WorkOutcome::Retry, Some(retry_interval)) => {
                        debug!(
                            manager = %self.config.name,
                            %activity_id,
                            ?retry_interval,
                            "work asked for retry"
                        );
                        state.phase = Phase::PendingDelayed {
                            activity_id,
                            is_retry: true,
                        };
                        Self::arm(&mut state, retry_interval)
                    }
                    _ => {
                        state.phase = Phase::Idle;
                        Action::None
                    }
                },
                phase => {
                    panic!("work completed in phase {:?}", phase.public());
                }
            }
        };

        self.apply(action);
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Closed {
            return;
        }

        state.phase = Phase::Closed;
        state.timer_generation += 1;
        state.timer = None;
        info!(
            manager = %self.config.name,
            id = %self.config.id,
            executions = state.execution_count,
            "background work manager closed"
        );
    }

    fn apply(self: &Arc<Self>, action: Action) {
        match action {
            Action::None => {}
            Action::Execute(activity_id) => self.spawn_execution(activity_id),
            Action::ArmTimer { generation, delay } => {
                trace!(manager = %self.config.name, ?delay, generation, "timer armed");
                let inner = Arc::downgrade(self);
                let timer = self.runtime.after(delay, move || {
                    if let Some(inner) = Weak::upgrade(&inner) {
                        inner.on_timer(generation);
                    }
                });

                let superseded = {
                    let mut state = self.state.lock();
                    if state.timer_generation == generation {
                        state.timer = Some(timer);
                        None
                    } else {
                        Some(timer)
                    }
                };
                if superseded.is_some() {
                    trace!(manager = %self.config.name, generation, "timer superseded while arming");
                }
            }
        }
    }

    fn spawn_execution(self: &Arc<Self>, activity_id: ActivityId) {
        debug!(manager = %self.config.name, %activity_id, "executing background work");
        metrics::record_work_execution(&self.config.name);

        let work = self.work.clone();
        let execution = self
            .runtime
            .spawn(async move { work.execute(activity_id).await });

        let inner = self.clone();
        let _continuation = self.runtime.spawn(async move {
            let outcome = match execution.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        manager = %inner.config.name,
                        %activity_id,
                        error = %e,
                        "background work failed"
                    );
                    WorkOutcome::Done
                }
            };
            inner.on_work_complete(activity_id, outcome);
        });
    }
}

// =============================================================================
// BackgroundWorkManager
// =============================================================================

/// Coalesces work requests into rate-limited executions
///
/// Dropping the manager closes it.
pub struct BackgroundWorkManager<R: Runtime + 'static> {
    inner: Arc<WorkInner<R>>,
}

impl<R: Runtime + 'static> BackgroundWorkManager<R> {
    /// Create an idle manager
    ///
    /// # Panics
    /// If the configuration violates its limits.
    pub fn new(config: BackgroundWorkConfig, runtime: R, work: Arc<dyn BackgroundWork>) -> Self {
        config.assert_valid();
        debug!(
            manager = %config.name,
            id = %config.id,
            min_interval = ?config.min_interval,
            "background work manager created"
        );

        Self {
            inner: Arc::new(WorkInner {
                config,
                runtime,
                work,
                state: Mutex::new(WorkState {
                    phase: Phase::Idle,
                    last_execution_start: None,
                    timer_generation: 0,
                    timer: None,
                    execution_count: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &BackgroundWorkConfig {
        &self.inner.config
    }

    /// Ask for the work to run
    ///
    /// Never runs the work inline and never waits.
    pub fn request(&self, activity_id: ActivityId) {
        self.inner.request(activity_id);
    }

    /// Stop scheduling; in-flight work finishes on its own
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn phase(&self) -> WorkPhase {
        self.inner.state.lock().phase.public()
    }

    /// Activity id waiting for the next execution
    pub fn pending_activity_id(&self) -> Option<ActivityId> {
        match self.inner.state.lock().phase {
            Phase::PendingWhileExecuting(activity_id)
            | Phase::PendingDelayed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Executions started so far
    pub fn execution_count(&self) -> u64 {
        self.inner.state.lock().execution_count
    }

    /// Start of the most recent execution on the runtime clock
    pub fn last_execution_start(&self) -> Option<Instant> {
        self.inner.state.lock().last_execution_start
    }
}

impl<R: Runtime + 'static> Drop for BackgroundWorkManager<R> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<R: Runtime + 'static> fmt::Debug for BackgroundWorkManager<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BackgroundWorkManager")
            .field("name", &self.inner.config.name)
            .field("phase", &state.phase.public())
            .field("execution_count", &state.execution_count)
            .finish()
    }
}
