//! One-shot and periodic timers on the tokio runtime.
//!
//! Every timer is a spawned task; its [`TimerHandle`] aborts the task when
//! cancelled or dropped, so replacing a handle re-arms a timer.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Schedules callbacks on the current tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerService;

impl TimerService {
    pub fn new() -> Self {
        Self
    }

    /// Run `callback` once after `delay`.
    pub fn schedule<F, Fut>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback().await;
        });
        TimerHandle { task }
    }

    /// Run `callback` every `period`, the first time after one period.
    pub fn every<F, Fut>(&self, period: Duration, mut callback: F) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback().await;
            }
        });
        TimerHandle { task }
    }
}

/// Handle to a scheduled timer; dropping it cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the timer. Has no effect once it fired.
    pub fn cancel(self) {
        drop(self);
    }

    /// Returns true if the timer fired (or was cancelled).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            debug!("Cancelling timer");
            self.task.abort();
        }
    }
}
