//! Shared timer pool
//!
//! Every delayed or periodic callback in the server runs through one
//! `TimerManager`. Callbacks execute on tokio worker threads, never on the
//! thread that scheduled them.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Callback type accepted by the timer pool.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("No tokio runtime available to drive timers")]
    NoRuntime,

    #[error("Timer manager has been stopped")]
    Stopped,
}

/// Handle to a task scheduled on the timer pool.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    id: u64,
    abort: AbortHandle,
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the task. A callback already running is allowed to finish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True once the task will never run its callback again.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.abort.is_finished()
    }
}

struct TimerInner {
    handle: Handle,
    tasks: Mutex<Vec<ScheduledTask>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

/// Cloneable handle to the shared timer pool.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<TimerInner>,
}

impl TimerManager {
    /// Start a timer pool on the given runtime.
    pub fn start(handle: Handle) -> Self {
        tracing::info!("[timer] [started]");
        Self {
            inner: Arc::new(TimerInner {
                handle,
                tasks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Start a timer pool on the runtime the caller is running in.
    pub fn current() -> Result<Self, TimerError> {
        let handle = Handle::try_current().map_err(|_| TimerError::NoRuntime)?;
        Ok(Self::start(handle))
    }

    /// Run `callback` once after `delay`.
    pub fn schedule_once(
        &self,
        callback: TimerCallback,
        delay: Duration,
    ) -> Result<ScheduledTask, TimerError> {
        self.spawn_tracked(move |id, cancelled| async move {
            tokio::time::sleep(delay).await;
            if !cancelled.load(Ordering::SeqCst) {
                run_isolated("timer", || callback());
            }
            tracing::trace!("[timer] [once_done] task={}", id);
        })
    }

    /// Run `callback` every `period`, first after `initial_delay`.
    pub fn schedule_repeating(
        &self,
        callback: TimerCallback,
        period: Duration,
        initial_delay: Duration,
    ) -> Result<ScheduledTask, TimerError> {
        // tokio intervals reject a zero period
        let period = period.max(Duration::from_millis(1));
        self.spawn_tracked(move |_id, cancelled| async move {
            tokio::time::sleep(initial_delay).await;
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                run_isolated("timer", || callback());
            }
        })
    }

    /// Forget tasks that are finished or cancelled.
    pub fn purge(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| !t.is_done());
        let purged = before - tasks.len();
        tracing::debug!("[timer] [purge] removed={} remaining={}", purged, tasks.len());
        purged
    }

    /// Cancel every task and refuse new ones.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in &tasks {
            task.cancel();
        }
        tracing::info!("[timer] [stopped] cancelled={}", tasks.len());
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Number of tasks still tracked (including finished ones not yet purged).
    pub fn task_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    fn spawn_tracked<F, Fut>(&self, make: F) -> Result<ScheduledTask, TimerError>
    where
        F: FnOnce(u64, Arc<AtomicBool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            return Err(TimerError::Stopped);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let join = self.inner.handle.spawn(make(id, cancelled.clone()));
        let task = ScheduledTask {
            id,
            abort: join.abort_handle(),
            cancelled,
        };

        self.inner.tasks.lock().push(task.clone());
        Ok(task)
    }
}

/// Run a callback, logging instead of unwinding if it panics.
///
/// Returns false when the callback panicked.
pub(crate) fn run_isolated<F: FnOnce()>(tag: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "(non-string panic)".to_string());
            tracing::error!("[{}] [callback_panic] {}", tag, msg);
            false
        }
    }
}
