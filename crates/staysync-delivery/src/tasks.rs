//! Recurring and one-shot background tasks.
//!
//! [`TaskScheduler`] is the registration seam used by the poller's
//! self-healing recovery. Registration is keyed by task, so registering a
//! task that is already live is a no-op and never produces a duplicate
//! timer.
//!
//! [`TokioTaskScheduler`] runs one tokio timer per registration and emits
//! [`ScheduledTask`] values on an mpsc channel. The binary drains the
//! channel and hands each task to the poller.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, Result};

/// Background work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledTask {
    /// Short-interval poll for new reservations.
    ContinuousPoll,
    /// Long-interval trailing-window re-scan.
    DeepCheck,
    /// Retry queue pass.
    RetryQueue,
    /// Poll silence check and self-healing.
    HealthCheck,
    /// Expired key and lock purge.
    Cleanup,
}

impl ScheduledTask {
    /// Stable name.
    pub const fn key(self) -> &'static str {
        match self {
            Self::ContinuousPoll => "continuous_poll",
            Self::DeepCheck => "deep_check",
            Self::RetryQueue => "retry_queue",
            Self::HealthCheck => "health_check",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Registers background tasks.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Whether a recurring registration for `task` is live.
    async fn is_scheduled(&self, task: ScheduledTask) -> bool;

    /// Registers `task` to run every `interval`.
    ///
    /// Returns `false` without changes when it is already scheduled.
    async fn schedule_recurring(&self, task: ScheduledTask, interval: Duration) -> Result<bool>;

    /// Runs `task` once after `delay`.
    ///
    /// Returns `false` when a one-shot run of `task` is already pending.
    async fn schedule_once(&self, task: ScheduledTask, delay: Duration) -> Result<bool>;

    /// Cancels every registration of `task`. Returns whether any existed.
    async fn cancel(&self, task: ScheduledTask) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Registration {
    Recurring(ScheduledTask),
    Once(ScheduledTask),
}

/// Tokio timer-based scheduler.
#[derive(Clone)]
pub struct TokioTaskScheduler {
    sender: mpsc::Sender<ScheduledTask>,
    handles: Arc<Mutex<HashMap<Registration, JoinHandle<()>>>>,
    cancel: CancellationToken,
}

impl fmt::Debug for TokioTaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTaskScheduler").finish_non_exhaustive()
    }
}

impl TokioTaskScheduler {
    /// Creates a scheduler and the receiver that yields due tasks.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ScheduledTask>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let scheduler = Self {
            sender,
            handles: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        };
        (scheduler, receiver)
    }

    /// Stops every timer. Later registrations fail.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain() {
            handle.abort();
        }
        tracing::info!("task scheduler stopped");
    }

    async fn register<F>(&self, registration: Registration, spawn: F) -> Result<bool>
    where
        F: FnOnce(mpsc::Sender<ScheduledTask>, CancellationToken) -> JoinHandle<()>,
    {
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::scheduling("task scheduler is shut down"));
        }

        let mut handles = self.handles.lock().await;
        if handles.get(&registration).is_some_and(|handle| !handle.is_finished()) {
            return Ok(false);
        }

        let handle = spawn(self.sender.clone(), self.cancel.child_token());
        handles.insert(registration, handle);
        Ok(true)
    }
}

#[async_trait]
impl TaskScheduler for TokioTaskScheduler {
    async fn is_scheduled(&self, task: ScheduledTask) -> bool {
        let handles = self.handles.lock().await;
        handles.get(&Registration::Recurring(task)).is_some_and(|handle| !handle.is_finished())
    }

    async fn schedule_recurring(&self, task: ScheduledTask, interval: Duration) -> Result<bool> {
        if interval.is_zero() {
            return Err(DeliveryError::scheduling(format!("interval for {task} must be positive")));
        }

        let registered = self
            .register(Registration::Recurring(task), |sender, cancel| {
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                if sender.send(task).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .await?;

        if registered {
            tracing::info!(%task, interval_secs = interval.as_secs(), "recurring task registered");
        }
        Ok(registered)
    }

    async fn schedule_once(&self, task: ScheduledTask, delay: Duration) -> Result<bool> {
        let registered = self
            .register(Registration::Once(task), |sender, cancel| {
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {},
                        () = tokio::time::sleep(delay) => {
                            let _ = sender.send(task).await;
                        }
                    }
                })
            })
            .await?;

        if registered {
            tracing::info!(%task, delay_secs = delay.as_secs(), "one-shot task registered");
        }
        Ok(registered)
    }

    async fn cancel(&self, task: ScheduledTask) -> bool {
        let mut handles = self.handles.lock().await;
        let mut found = false;
        for registration in [Registration::Recurring(task), Registration::Once(task)] {
            if let Some(handle) = handles.remove(&registration) {
                handle.abort();
                found = true;
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn recurring_task_emits_on_interval() {
        let (scheduler, mut rx) = TokioTaskScheduler::new(8);

        scheduler.schedule_recurring(ScheduledTask::ContinuousPoll, Duration::from_secs(60)).await.unwrap();

        assert_eq!(rx.recv().await, Some(ScheduledTask::ContinuousPoll));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(rx.recv().await, Some(ScheduledTask::ContinuousPoll));
    }

    #[tokio::test]
    async fn re_registration_is_idempotent() {
        let (scheduler, _rx) = TokioTaskScheduler::new(8);

        assert!(scheduler.schedule_recurring(ScheduledTask::DeepCheck, Duration::from_secs(3600)).await.unwrap());
        assert!(!scheduler.schedule_recurring(ScheduledTask::DeepCheck, Duration::from_secs(3600)).await.unwrap());
        assert!(scheduler.is_scheduled(ScheduledTask::DeepCheck).await);
        assert_eq!(scheduler.handles.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        let (scheduler, mut rx) = TokioTaskScheduler::new(8);

        scheduler.schedule_once(ScheduledTask::Cleanup, Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(rx.recv().await, Some(ScheduledTask::Cleanup));
        assert!(!scheduler.is_scheduled(ScheduledTask::Cleanup).await);
    }

    #[tokio::test]
    async fn cancel_and_shutdown() {
        let (scheduler, _rx) = TokioTaskScheduler::new(8);
        scheduler.schedule_recurring(ScheduledTask::RetryQueue, Duration::from_secs(30)).await.unwrap();

        assert!(scheduler.cancel(ScheduledTask::RetryQueue).await);
        assert!(!scheduler.is_scheduled(ScheduledTask::RetryQueue).await);

        scheduler.shutdown().await;
        let err = scheduler
            .schedule_recurring(ScheduledTask::RetryQueue, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::SchedulingError { .. }));
    }
}
