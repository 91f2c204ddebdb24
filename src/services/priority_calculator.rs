use crate::domain::models::{QueueConfig, Task};
use chrono::{DateTime, Utc};

/// Effective scheduling priority with aging.
///
/// Priority formula: base_priority + min(aging_per_minute * minutes_waited, max_aging_boost)
///
/// Waiting time is measured from task creation, so a task that keeps losing
/// to higher-priority work eventually overtakes it.
#[derive(Debug, Clone)]
pub struct PriorityCalculator {
    aging_per_minute: f64,
    max_aging_boost: f64,
}

impl Default for PriorityCalculator {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl PriorityCalculator {
    pub fn new(aging_per_minute: f64, max_aging_boost: f64) -> Self {
        Self {
            aging_per_minute: aging_per_minute.max(0.0),
            max_aging_boost: max_aging_boost.max(0.0),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.aging_per_minute, config.max_aging_boost)
    }

    /// Effective priority of `task` at `now`.
    pub fn calculate(&self, task: &Task, now: DateTime<Utc>) -> f64 {
        f64::from(task.priority) + self.aging_boost(task.created_at, now)
    }

    /// Boost earned by waiting since `since`, between 0 and the cap.
    pub fn aging_boost(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let waited_ms = (now - since).num_milliseconds().max(0) as f64;
        let minutes = waited_ms / 60_000.0;
        (minutes * self.aging_per_minute).min(self.max_aging_boost)
    }
}
