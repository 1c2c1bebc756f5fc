// dbvault/src/entities/planned_task.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::TaskId;
use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlannedTaskState {
    Waiting,
    Executing,
}

impl PlannedTaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannedTaskState::Waiting => "WAITING",
            PlannedTaskState::Executing => "EXECUTING",
        }
    }
}

impl FromStr for PlannedTaskState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(PlannedTaskState::Waiting),
            "EXECUTING" => Ok(PlannedTaskState::Executing),
            other => Err(AppError::InvalidInput(format!(
                "unknown planned task state '{}'",
                other
            ))),
        }
    }
}

/// Which planned tasks a poller wants to claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedTaskFilter {
    /// `WAITING` rows whose interval has elapsed since they last started.
    Due,
    /// `EXECUTING` rows whose spawned backups still need settling.
    Executing,
}

/// A recurring backup: every `interval` one create task is started per
/// storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: i64,
    pub database_settings_name: String,
    pub storage_settings_names: Vec<String>,
    pub processors: Vec<String>,
    pub interval_seconds: i64,
    pub last_started_at: DateTime<Utc>,
    pub state: PlannedTaskState,
    pub executing_tasks: Vec<TaskId>,
}

impl PlannedTask {
    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_seconds)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == PlannedTaskState::Waiting && self.last_started_at + self.interval() <= now
    }
}

/// Input for registering a new planned task.
#[derive(Debug, Clone)]
pub struct NewPlannedTask {
    pub database_settings_name: String,
    pub storage_settings_names: Vec<String>,
    pub processors: Vec<String>,
    pub interval_seconds: i64,
    /// The first run fires one interval after this instant.
    pub last_started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(last_started_at: DateTime<Utc>, state: PlannedTaskState) -> PlannedTask {
        PlannedTask {
            id: 1,
            database_settings_name: "main".to_string(),
            storage_settings_names: vec!["local".to_string()],
            processors: vec![],
            interval_seconds: 60,
            last_started_at,
            state,
            executing_tasks: vec![],
        }
    }

    #[test]
    fn test_planned_task_is_due_after_interval() {
        let now = Utc::now();
        assert!(planned(now - Duration::seconds(61), PlannedTaskState::Waiting).is_due(now));
        assert!(!planned(now - Duration::seconds(10), PlannedTaskState::Waiting).is_due(now));
    }

    #[test]
    fn test_executing_planned_task_is_never_due() {
        let now = Utc::now();
        assert!(!planned(now - Duration::days(1), PlannedTaskState::Executing).is_due(now));
    }
}
