// dbvault/src/entities/task.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

pub type TaskId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    CreateBackup,
    RestoreBackup,
    DeleteBackup,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CreateBackup => "CREATE_BACKUP",
            TaskType::RestoreBackup => "RESTORE_BACKUP",
            TaskType::DeleteBackup => "DELETE_BACKUP",
        }
    }
}

impl FromStr for TaskType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE_BACKUP" => Ok(TaskType::CreateBackup),
            "RESTORE_BACKUP" => Ok(TaskType::RestoreBackup),
            "DELETE_BACKUP" => Ok(TaskType::DeleteBackup),
            other => Err(AppError::InvalidInput(format!("unknown task type '{}'", other))),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for the task: an operator, or the system itself (planned
/// backups, reverts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    User,
    Internal,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::User => "USER",
            RunType::Internal => "INTERNAL",
        }
    }
}

impl FromStr for RunType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(RunType::User),
            "INTERNAL" => Ok(RunType::Internal),
            other => Err(AppError::InvalidInput(format!("unknown run type '{}'", other))),
        }
    }
}

/// Stage of a task. Each workflow walks its own linear path:
///
/// * create: `Planned -> Creating -> ApplyingProcessors -> Uploading -> Completed`
/// * restore: `Planned -> Downloading -> ApplyingDeprocessors -> Restoring -> Completed`
/// * delete: `Planned -> Deleting -> Completed`
///
/// Any stage after `Planned` may end in `Interrupted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Planned,
    Creating,
    ApplyingProcessors,
    Uploading,
    Downloading,
    ApplyingDeprocessors,
    Restoring,
    Deleting,
    Completed,
    Interrupted,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Planned => "PLANNED",
            TaskState::Creating => "CREATING",
            TaskState::ApplyingProcessors => "APPLYING_PROCESSORS",
            TaskState::Uploading => "UPLOADING",
            TaskState::Downloading => "DOWNLOADING",
            TaskState::ApplyingDeprocessors => "APPLYING_DEPROCESSORS",
            TaskState::Restoring => "RESTORING",
            TaskState::Deleting => "DELETING",
            TaskState::Completed => "COMPLETED",
            TaskState::Interrupted => "INTERRUPTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Interrupted)
    }
}

impl FromStr for TaskState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "PLANNED" => TaskState::Planned,
            "CREATING" => TaskState::Creating,
            "APPLYING_PROCESSORS" => TaskState::ApplyingProcessors,
            "UPLOADING" => TaskState::Uploading,
            "DOWNLOADING" => TaskState::Downloading,
            "APPLYING_DEPROCESSORS" => TaskState::ApplyingDeprocessors,
            "RESTORING" => TaskState::Restoring,
            "DELETING" => TaskState::Deleting,
            "COMPLETED" => TaskState::Completed,
            "INTERRUPTED" => TaskState::Interrupted,
            other => return Err(AppError::InvalidInput(format!("unknown task state '{}'", other))),
        };
        Ok(state)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub run_type: RunType,
    pub state: TaskState,
    pub backup_properties_id: i64,
    pub created_at: DateTime<Utc>,
    /// Set once by the error callback; never cleared.
    pub error: bool,
}
