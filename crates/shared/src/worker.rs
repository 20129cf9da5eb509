//! Single-slot signalable worker: a task that runs a user-supplied body on
//! demand, with at-most-one pending wakeup and ordered idle/run/stop
//! transitions.
//!
//! The state machine is the six states laid out for the per-slot manager
//! and the registration reporter:
//!
//! ```text
//! Stopped --start--> Starting --> Idle --wake--> Signaled --> Busy
//!                                   ^                          |
//!                                   +--------------------------+
//!   Idle/Busy/Signaled --join--> Stopping{,AfterWork} --> Stopped
//! ```

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use tokio::{sync::Mutex, task::JoinHandle, time::Instant};

use crate::sync::{CondVar, WaitResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Idle,
    Signaled,
    Busy,
    Stopping,
    StoppingAfterWork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalid;

impl fmt::Display for Invalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("worker is not in a state that accepts this operation")
    }
}

impl std::error::Error for Invalid {}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Inner {
    cv: CondVar<WorkerState>,
    periodic_wake: Option<Duration>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// A cloneable handle to a running (or not-yet-started) worker.
#[derive(Clone)]
pub struct Worker(Arc<Inner>);

impl Worker {
    pub fn new(periodic_wake: Option<Duration>) -> Self {
        Worker(Arc::new(Inner {
            cv: CondVar::new(WorkerState::Stopped),
            periodic_wake,
            handle: Mutex::new(None),
        }))
    }

    /// Starts the worker's task if not already started. Idempotent while
    /// not `Stopped`.
    pub async fn start<F, Fut>(&self, body: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.0.cv.lock().await;
            if *state != WorkerState::Stopped {
                return;
            }
            *state = WorkerState::Starting;
        }
        let inner = self.0.clone();
        let body: Arc<dyn Fn() -> BoxFuture + Send + Sync> =
            Arc::new(move || Box::pin(body()) as BoxFuture);
        let handle = tokio::spawn(run_loop(inner, body));
        *self.0.handle.lock().await = Some(handle);

        let mut state = self.0.cv.lock().await;
        *state = WorkerState::Idle;
        self.0.cv.notify_all();
    }

    /// Signals the worker to run its body. Coalesces with any
    /// already-pending signal.
    pub async fn wake(&self) -> Result<(), Invalid> {
        let mut state = self.0.cv.lock().await;
        match *state {
            WorkerState::Idle | WorkerState::Signaled => {
                *state = WorkerState::Signaled;
                self.0.cv.notify_all();
                Ok(())
            }
            WorkerState::Busy => {
                *state = WorkerState::Signaled;
                Ok(())
            }
            WorkerState::Stopped
            | WorkerState::Starting
            | WorkerState::Stopping
            | WorkerState::StoppingAfterWork => Err(Invalid),
        }
    }

    /// Blocks until the worker is `Idle`. Fails if the worker will never be
    /// idle again (stopped or stopping).
    pub async fn wait_idle(&self) -> Result<(), Invalid> {
        loop {
            let state = self.0.cv.lock().await;
            match *state {
                WorkerState::Idle => return Ok(()),
                WorkerState::Stopped | WorkerState::Stopping | WorkerState::StoppingAfterWork => {
                    return Err(Invalid);
                }
                _ => {
                    self.0.cv.wait(state).await;
                }
            }
        }
    }

    /// Non-blocking query of the most recently observed state.
    pub async fn is_idle(&self) -> bool {
        *self.0.cv.lock().await == WorkerState::Idle
    }

    pub async fn state(&self) -> WorkerState {
        *self.0.cv.lock().await
    }

    /// Requests the worker stop and blocks until its task exits. If a wake
    /// is pending or in flight, that work runs to completion first.
    pub async fn join(&self) {
        {
            let mut state = self.0.cv.lock().await;
            *state = match *state {
                WorkerState::Stopped => return,
                WorkerState::Idle => WorkerState::Stopping,
                WorkerState::Signaled | WorkerState::Busy => WorkerState::StoppingAfterWork,
                other @ (WorkerState::Starting
                | WorkerState::Stopping
                | WorkerState::StoppingAfterWork) => other,
            };
            self.0.cv.notify_all();
        }
        let handle = self.0.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_loop(inner: Arc<Inner>, body: Arc<dyn Fn() -> BoxFuture + Send + Sync>) {
    loop {
        let run_now = {
            let mut state = inner.cv.lock().await;
            loop {
                match *state {
                    WorkerState::Signaled => {
                        *state = WorkerState::Busy;
                        break true;
                    }
                    WorkerState::Stopping => {
                        *state = WorkerState::Stopped;
                        inner.cv.notify_all();
                        return;
                    }
                    WorkerState::StoppingAfterWork => {
                        // Pending work from the Signaled/Busy state that was
                        // in flight when join() was called; run it once more
                        // then stop.
                        *state = WorkerState::Busy;
                        break true;
                    }
                    WorkerState::Idle => {
                        let deadline = inner.periodic_wake.map(|d| Instant::now() + d);
                        state = match deadline {
                            Some(deadline) => {
                                let (new_state, result) =
                                    wait_until(&inner.cv, state, deadline).await;
                                state = new_state;
                                if result.timed_out && *state == WorkerState::Idle {
                                    *state = WorkerState::Signaled;
                                }
                                state
                            }
                            None => inner.cv.wait(state).await,
                        };
                    }
                    WorkerState::Busy | WorkerState::Starting => {
                        // Not reachable: Busy is only observed by this task,
                        // and Starting only precedes the first Idle.
                        state = inner.cv.wait(state).await;
                    }
                }
            }
        };

        if run_now {
            body().await;
            let mut state = inner.cv.lock().await;
            *state = match *state {
                WorkerState::Signaled => WorkerState::Signaled, // coalesced wake during this run
                WorkerState::StoppingAfterWork => {
                    inner.cv.notify_all();
                    WorkerState::Stopped
                }
                _ => WorkerState::Idle,
            };
            if *state == WorkerState::Stopped {
                return;
            }
            inner.cv.notify_all();
        }
    }
}

async fn wait_until<'a>(
    cv: &'a CondVar<WorkerState>,
    guard: tokio::sync::MutexGuard<'a, WorkerState>,
    deadline: Instant,
) -> (tokio::sync::MutexGuard<'a, WorkerState>, WaitResult) {
    let timeout = deadline.saturating_duration_since(Instant::now());
    cv.wait_timeout(guard, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn start_reaches_idle() {
        let worker = Worker::new(None);
        worker.start(|| async {}).await;
        assert!(worker.is_idle().await);
        worker.join().await;
    }

    // Property 6: single-slot coalescing.
    #[tokio::test]
    async fn concurrent_wakes_coalesce() {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(None);
        {
            let runs = runs.clone();
            worker
                .start(move || {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(StdDuration::from_millis(20)).await;
                    }
                })
                .await;
        }

        for _ in 0..5 {
            let _ = worker.wake().await;
        }
        worker.wait_idle().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        worker.wait_idle().await.unwrap();

        let n = runs.load(Ordering::SeqCst);
        assert!((1..=6).contains(&n), "unexpected run count {n}");
        assert!(worker.is_idle().await);
        worker.join().await;
    }

    // Property 7: periodic wake.
    #[tokio::test(start_paused = true)]
    async fn periodic_wake_fires_in_steady_state() {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(Some(StdDuration::from_millis(50)));
        {
            let runs = runs.clone();
            worker
                .start(move || {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
        }

        tokio::time::advance(StdDuration::from_millis(170)).await;
        worker.wait_idle().await.unwrap();

        assert!(runs.load(Ordering::SeqCst) >= 3);
        worker.join().await;
    }

    #[tokio::test]
    async fn wake_after_stop_is_invalid() {
        let worker = Worker::new(None);
        worker.start(|| async {}).await;
        worker.join().await;
        assert_eq!(worker.wake().await, Err(Invalid));
    }
}
