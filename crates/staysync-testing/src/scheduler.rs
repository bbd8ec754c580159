//! Task scheduler double that records registrations without timers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use staysync_delivery::{
    tasks::{ScheduledTask, TaskScheduler},
    DeliveryError, Result,
};

#[derive(Default)]
struct State {
    recurring: HashMap<ScheduledTask, Duration>,
    once: Vec<(ScheduledTask, Duration)>,
    registrations: usize,
    failing: bool,
}

/// [`TaskScheduler`] keeping registrations in memory.
///
/// [`RecordingTaskScheduler::drop_all`] simulates timers dying with the
/// process so self-healing can be exercised.
#[derive(Clone, Default)]
pub struct RecordingTaskScheduler {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for RecordingTaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingTaskScheduler").finish_non_exhaustive()
    }
}

impl RecordingTaskScheduler {
    /// Creates a scheduler with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every registration.
    pub fn drop_all(&self) {
        let mut state = self.lock();
        state.recurring.clear();
        state.once.clear();
    }

    /// Makes registration fail.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Interval of a recurring registration.
    pub fn interval(&self, task: ScheduledTask) -> Option<Duration> {
        self.lock().recurring.get(&task).copied()
    }

    /// Pending one-shot registrations.
    pub fn one_shots(&self) -> Vec<(ScheduledTask, Duration)> {
        self.lock().once.clone()
    }

    /// Successful registrations so far, including one-shots.
    pub fn registrations(&self) -> usize {
        self.lock().registrations
    }

    /// Simulates pending one-shots firing.
    pub fn fire_one_shots(&self) -> Vec<ScheduledTask> {
        self.lock().once.drain(..).map(|(task, _)| task).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl TaskScheduler for RecordingTaskScheduler {
    async fn is_scheduled(&self, task: ScheduledTask) -> bool {
        self.lock().recurring.contains_key(&task)
    }

    async fn schedule_recurring(&self, task: ScheduledTask, interval: Duration) -> Result<bool> {
        let mut state = self.lock();
        if state.failing {
            return Err(DeliveryError::scheduling(format!("cannot register {task}")));
        }
        if state.recurring.contains_key(&task) {
            return Ok(false);
        }
        state.recurring.insert(task, interval);
        state.registrations += 1;
        Ok(true)
    }

    async fn schedule_once(&self, task: ScheduledTask, delay: Duration) -> Result<bool> {
        let mut state = self.lock();
        if state.failing {
            return Err(DeliveryError::scheduling(format!("cannot register {task}")));
        }
        if state.once.iter().any(|(pending, _)| *pending == task) {
            return Ok(false);
        }
        state.once.push((task, delay));
        state.registrations += 1;
        Ok(true)
    }

    async fn cancel(&self, task: ScheduledTask) -> bool {
        let mut state = self.lock();
        let before = state.once.len();
        state.once.retain(|(pending, _)| *pending != task);
        state.recurring.remove(&task).is_some() || state.once.len() != before
    }
}
