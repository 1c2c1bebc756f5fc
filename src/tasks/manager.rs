// dbvault/src/tasks/manager.rs
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::orchestrator::TaskOrchestrator;
use crate::entities::{
    BackupProperties, NewBackupProperties, RunType, Task, TaskId, TaskState, TaskType,
    backup_name,
};
use crate::errors::Result;
use crate::store::{BackupPropertiesStore, TaskStore};

/// Bookkeeping around task rows and the backup properties they refer to.
pub struct TasksManager {
    tasks: Arc<dyn TaskStore>,
    backup_properties: Arc<dyn BackupPropertiesStore>,
}

impl TasksManager {
    pub fn new(tasks: Arc<dyn TaskStore>, backup_properties: Arc<dyn BackupPropertiesStore>) -> Self {
        TasksManager {
            tasks,
            backup_properties,
        }
    }

    pub async fn init_backup_properties(
        &self,
        database_name: &str,
        storage_settings_name: &str,
        processors: Vec<String>,
    ) -> Result<BackupProperties> {
        let created_at = Utc::now();
        self.backup_properties
            .create(NewBackupProperties {
                created_at,
                backup_name: backup_name(database_name, created_at),
                processors,
                storage_settings_name: storage_settings_name.to_string(),
            })
            .await
    }

    pub async fn init_task(
        &self,
        task_type: TaskType,
        run_type: RunType,
        backup_properties_id: i64,
    ) -> Result<TaskId> {
        let task = self
            .tasks
            .create(task_type, run_type, backup_properties_id)
            .await?;
        debug!(task_id = task.id, task_type = %task_type, "Task created");
        Ok(task.id)
    }

    pub async fn update_state(&self, task_id: TaskId, state: TaskState) -> Result<()> {
        self.tasks.update_state(task_id, state).await?;
        debug!(task_id, state = %state, "Task state updated");
        Ok(())
    }

    pub async fn find_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        self.tasks.find_by_id(task_id).await
    }

    pub async fn find_backup_properties(&self, id: i64) -> Result<Option<BackupProperties>> {
        self.backup_properties.find_by_id(id).await
    }

    pub async fn delete_backup_properties(&self, id: i64) -> Result<()> {
        self.backup_properties.delete(id).await
    }

    /// Undoes what a failed or cancelled task left behind, judged by the stage
    /// it had reached.
    pub async fn revert_task(&self, task: &Task, orchestrator: &TaskOrchestrator) -> Result<()> {
        info!(task_id = task.id, state = %task.state, "Reverting task");
        match (task.task_type, task.state) {
            (_, TaskState::Planned | TaskState::Completed) => {}
            (
                _,
                TaskState::Downloading
                | TaskState::ApplyingDeprocessors
                | TaskState::Restoring
                | TaskState::Deleting,
            ) => {}
            (TaskType::CreateBackup, TaskState::Creating | TaskState::ApplyingProcessors) => {
                self.delete_backup_properties(task.backup_properties_id)
                    .await?;
            }
            // Upload may have written part of the backup; storage deletes are
            // idempotent, so clean up whenever that is possible.
            (TaskType::CreateBackup, TaskState::Uploading | TaskState::Interrupted) => {
                let Some(properties) = self
                    .find_backup_properties(task.backup_properties_id)
                    .await?
                else {
                    warn!(task_id = task.id, "Backup properties already gone, nothing to delete");
                    return Ok(());
                };
                let delete_task_id = self
                    .init_task(TaskType::DeleteBackup, RunType::Internal, properties.id)
                    .await?;
                let properties_id = properties.id;
                orchestrator.start_delete(delete_task_id, properties)?;
                self.delete_backup_properties(properties_id).await?;
            }
            (task_type, state) => {
                warn!(task_id = task.id, task_type = %task_type, state = %state, "Nothing to revert");
            }
        }
        Ok(())
    }
}
