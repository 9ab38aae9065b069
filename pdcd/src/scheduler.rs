//! Cancellable repeating tasks.
//!
//! Every active rollout and every attached trigger owns one repeating task.
//! Cancellation must be race-free: after `cancel()` no further tick runs,
//! and a tick that was already in flight is expected to re-check its
//! subject's status before acting (the engines do).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Returned by a tick callback to keep the task alive or stop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

/// Handle to a spawned repeating task. Dropping the handle cancels it.
pub struct RepeatingTask {
    name: String,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    /// Spawn a task invoking `tick` every `period`, starting one period from
    /// now (never immediately — the first stage dwell must elapse first).
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TaskControl> + Send,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                match tick().await {
                    TaskControl::Continue => {}
                    TaskControl::Stop => {
                        flag.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
            debug!("Task '{}' stopped", task_name);
        });
        Self {
            name,
            running,
            handle,
        }
    }

    /// Stop the task; no tick runs after this returns.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.handle.is_finished()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn ticks_repeat_until_cancelled() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let task = RepeatingTask::spawn("counter", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                TaskControl::Continue
            }
        });

        tokio::time::sleep(Duration::from_millis(65)).await;
        task.cancel();
        let observed = count.load(Ordering::SeqCst);
        assert!(observed >= 3, "expected several ticks, got {observed}");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            count.load(Ordering::SeqCst),
            observed,
            "tick ran after cancel"
        );
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn first_tick_waits_one_period() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let _task = RepeatingTask::spawn("delayed", Duration::from_millis(50), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                TaskControl::Continue
            }
        });

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "tick fired immediately");
    }

    #[tokio::test]
    async fn callback_can_stop_the_task() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let task = RepeatingTask::spawn("one-shot", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                TaskControl::Stop
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let task = RepeatingTask::spawn("dropped", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                TaskControl::Continue
            }
        });
        drop(task);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
