//! Guarded wait for a condition protected by an external lock
//!
//! A `WaitGate` pairs a broadcast notification with a count of registered
//! waiters, so the side that changes the condition only signals when
//! somebody is actually waiting.
//!
//! Protocol:
//! 1. While holding the lock that guards the condition, observe it is not
//!    yet satisfied and call `register()`.
//! 2. Release the lock, then `wait_until(deadline)`.
//! 3. Re-acquire the lock and re-check the condition.
//!
//! The side that changes the condition does so under the same lock, releases
//! it, then calls `signal_all()`. A waiter registered before the signal is
//! always woken, even if it has not started waiting yet.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Broadcast wake-up with waiter accounting
#[derive(Debug, Default)]
pub struct WaitGate {
    notify: Notify,
    waiters: AtomicUsize,
}

impl WaitGate {
    /// Create a gate with no waiters
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next signal
    ///
    /// Call while holding the lock guarding the condition.
    pub fn register(&self) -> Waiter<'_> {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        Waiter {
            notified: self.notify.notified(),
            _registration: Registration {
                waiters: &self.waiters,
            },
        }
    }

    /// Number of currently registered waiters
    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Wake every registered waiter
    ///
    /// Returns false without touching the notifier when nobody waits.
    pub fn signal_all(&self) -> bool {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return false;
        }
        self.notify.notify_waiters();
        true
    }
}

/// A registered waiter; deregisters on drop
pub struct Waiter<'a> {
    notified: Notified<'a>,
    _registration: Registration<'a>,
}

impl Waiter<'_> {
    /// Wait for a signal or the deadline
    ///
    /// Returns true if woken by a signal, false on timeout.
    pub async fn wait_until(self, deadline: Instant) -> bool {
        let Waiter {
            notified,
            _registration,
        } = self;
        tokio::time::timeout_at(deadline, notified).await.is_ok()
    }

    /// Wait for a signal with no deadline
    pub async fn wait(self) {
        let Waiter {
            notified,
            _registration,
        } = self;
        notified.await;
    }
}

struct Registration<'a> {
    waiters: &'a AtomicUsize,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let previous = self.waiters.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "waiter count underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_signal_without_waiters() {
        let gate = WaitGate::new();
        assert!(!gate.signal_all());
        assert_eq!(gate.waiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_before_wait_is_not_lost() {
        let gate = WaitGate::new();
        let waiter = gate.register();
        assert_eq!(gate.waiter_count(), 1);

        // Signal lands between registration and the await
        assert!(gate.signal_all());

        let woken = waiter
            .wait_until(Instant::now() + Duration::from_secs(10))
            .await;
        assert!(woken);
        assert_eq!(gate.waiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let gate = WaitGate::new();
        let start = Instant::now();

        let woken = gate
            .register()
            .wait_until(start + Duration::from_millis(50))
            .await;

        assert!(!woken);
        assert!(Instant::now() - start >= Duration::from_millis(50));
        assert_eq!(gate.waiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_wait_woken_by_signal() {
        let gate = Arc::new(WaitGate::new());
        let waiter_gate = gate.clone();
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            let waiter = waiter_gate.register();
            let _ = registered_tx.send(());
            waiter.wait().await;
        });
        registered_rx.await.unwrap();

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!handle.is_finished());
        assert_eq!(gate.waiter_count(), 1);

        assert!(gate.signal_all());
        handle.await.unwrap();
        assert_eq!(gate.waiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_wakes_all_waiters() {
        let gate = Arc::new(WaitGate::new());
        let deadline = Instant::now() + Duration::from_secs(10);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let (registered_tx, registered_rx) = tokio::sync::oneshot::channel();
            handles.push(tokio::spawn(async move {
                let waiter = gate.register();
                let _ = registered_tx.send(());
                waiter.wait_until(deadline).await
            }));
            registered_rx.await.unwrap();
        }

        assert_eq!(gate.waiter_count(), 4);
        assert!(gate.signal_all());

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(gate.waiter_count(), 0);
    }
}
