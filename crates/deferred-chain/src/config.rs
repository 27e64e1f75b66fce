use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Name attached to the scheduler's log events
    #[serde(default = "default_name")]
    pub name: String,

    /// Maximum tasks a single drain may run before the queue must be empty
    #[serde(default = "default_max_tasks_per_drain")]
    pub max_tasks_per_drain: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_tasks_per_drain: default_max_tasks_per_drain(),
        }
    }
}

impl SchedulerConfig {
    /// Tight limits for tests that exercise runaway rescheduling.
    pub fn strict(max_tasks_per_drain: usize) -> Self {
        Self {
            max_tasks_per_drain,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_tasks_per_drain == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_tasks_per_drain must be at least 1".into(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_name() -> String {
    "main".to_string()
}

fn default_max_tasks_per_drain() -> usize {
    100_000
}
