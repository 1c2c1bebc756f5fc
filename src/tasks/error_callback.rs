// dbvault/src/tasks/error_callback.rs
use std::sync::Arc;
use tracing::{error, info, warn};

use super::registry::HandleRegistry;
use crate::entities::TaskId;
use crate::errors::AppError;
use crate::store::{ErrorTaskStore, TaskStore};

/// Single sink for faults of a task, whether they surface on the workflow
/// itself or on one of its auxiliary drains.
pub struct ErrorCallback {
    registry: Arc<HandleRegistry>,
    tasks: Arc<dyn TaskStore>,
    error_tasks: Arc<dyn ErrorTaskStore>,
}

impl ErrorCallback {
    pub fn new(
        registry: Arc<HandleRegistry>,
        tasks: Arc<dyn TaskStore>,
        error_tasks: Arc<dyn ErrorTaskStore>,
    ) -> Self {
        ErrorCallback {
            registry,
            tasks,
            error_tasks,
        }
    }

    /// Stops the workflow of `task_id` if it is still running and marks the
    /// task erroneous. Safe to call repeatedly and from several tasks.
    pub async fn on_error(&self, cause: AppError, task_id: TaskId) {
        error!(task_id, error = %cause, "Task failed");

        match self.registry.get(task_id) {
            Some(handle) => {
                if handle.cancel() {
                    info!(task_id, "Cancelled workflow after failure");
                } else {
                    warn!(task_id, "Workflow was already cancelled");
                }
            }
            None => warn!(task_id, "No running workflow to cancel"),
        }

        self.mark_erroneous(task_id).await;
    }

    /// Marks the task erroneous and queues it for the error watcher without
    /// touching its workflow.
    pub async fn mark_erroneous(&self, task_id: TaskId) {
        if let Err(e) = self.tasks.set_error(task_id).await {
            error!(task_id, error = %e, "Failed to set task error flag");
        }
        match self.error_tasks.add(task_id).await {
            Ok(true) => info!(task_id, "Error task recorded"),
            Ok(false) => {}
            Err(e) => error!(task_id, error = %e, "Failed to record error task"),
        }
    }
}
