//! Synchronization primitives shared across the net, worker and slot layers.
//!
//! `Trigger` is a one-shot, broadcast, idempotent cancellation signal: any
//! number of tasks can `wait_async()` on it, and `trigger()` wakes all of
//! them, including any that call `wait_async()` afterwards. It is the
//! mechanism by which a blocked `recv`/`accept`/`condvar.wait` is cancelled,
//! replacing a raw `shutdown(2)` on the socket.
//!
//! `CondVar` pairs a condition variable with the value it protects, in the
//! spirit of a POSIX `pthread_cond_t` + `pthread_mutex_t` pair: `wait`
//! atomically releases the lock while parked and reacquires it on wake.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Mutex, MutexGuard, Notify};

#[derive(Clone, Debug, Default)]
pub struct Trigger(Arc<TriggerInner>);

#[derive(Debug, Default)]
struct TriggerInner {
    fired: AtomicBool,
    notify: Notify,
}

impl Trigger {
    pub fn new() -> Self {
        Trigger(Arc::new(TriggerInner {
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    /// Fires the trigger. Idempotent: subsequent calls are no-ops.
    pub fn trigger(&self) {
        self.0.fired.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.0.fired.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already triggered; otherwise resolves the
    /// first time `trigger()` is called. Safe to race in `tokio::select!`
    /// against the operation being cancelled.
    pub async fn wait_async(&self) {
        if self.is_triggered() {
            return;
        }
        // Register interest before the re-check to avoid the lost-wakeup
        // window between the check above and `notified()` registering.
        let notified = self.0.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// A reader-preferring RW lock is provided directly by `tokio::sync::RwLock`
/// at call sites; `CondVar` below is only needed where a wait must be
/// paired with state mutated under a plain exclusive lock, as in `Worker`.
pub struct CondVar<T> {
    state: Mutex<T>,
    notify: Notify,
}

pub struct WaitResult {
    pub timed_out: bool,
}

impl<T> CondVar<T> {
    pub fn new(initial: T) -> Self {
        CondVar {
            state: Mutex::new(initial),
            notify: Notify::new(),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().await
    }

    /// Releases `guard`, waits for a notification, then reacquires the lock
    /// and returns the new guard.
    pub async fn wait<'a>(&'a self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let notified = self.notify.notified();
        drop(guard);
        notified.await;
        self.state.lock().await
    }

    /// As `wait`, but returns after `timeout` even without a notification.
    pub async fn wait_timeout<'a>(
        &'a self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitResult) {
        let notified = self.notify.notified();
        drop(guard);
        let timed_out = tokio::time::timeout(timeout, notified).await.is_err();
        (self.state.lock().await, WaitResult { timed_out })
    }

    pub fn notify_one(&self) {
        self.notify.notify_one();
    }

    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn trigger_wakes_existing_waiters() {
        let trigger = Trigger::new();
        let waiter = trigger.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_async().await;
        });
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        trigger.trigger();
        tokio::time::timeout(StdDuration::from_millis(200), handle)
            .await
            .expect("waiter did not wake")
            .unwrap();
    }

    #[tokio::test]
    async fn trigger_resolves_immediately_once_fired() {
        let trigger = Trigger::new();
        trigger.trigger();
        tokio::time::timeout(StdDuration::from_millis(50), trigger.wait_async())
            .await
            .expect("already-fired trigger should resolve immediately");
    }

    #[tokio::test]
    async fn condvar_wait_timeout_reports_timeout() {
        let cv: CondVar<bool> = CondVar::new(false);
        let guard = cv.lock().await;
        let (_guard, result) = cv.wait_timeout(guard, StdDuration::from_millis(20)).await;
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn condvar_notify_one_wakes_waiter() {
        let cv: Arc<CondVar<bool>> = Arc::new(CondVar::new(false));
        let waiter_cv = cv.clone();
        let handle = tokio::spawn(async move {
            let guard = waiter_cv.lock().await;
            waiter_cv.wait(guard).await;
        });
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        cv.notify_one();
        tokio::time::timeout(StdDuration::from_millis(200), handle)
            .await
            .expect("waiter did not wake")
            .unwrap();
    }
}
