// dbvault/src/entities/queue.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// A task that failed and still has to be reverted by the error watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTask {
    pub id: i64,
    pub task_id: TaskId,
    pub error_handled: bool,
}

/// A durable request to cancel a running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTask {
    pub id: i64,
    pub task_id: TaskId,
    pub put_time: DateTime<Utc>,
}
