// dbvault/src/watchers/planned.rs
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::entities::{
    PlannedTask, PlannedTaskFilter, PlannedTaskState, RunType, SettingsCatalog, TaskId, TaskState,
    TaskType,
};
use crate::errors::Result;
use crate::store::{PlannedTaskClaim, PlannedTaskStore};
use crate::tasks::{ErrorCallback, TaskOrchestrator};

/// Fires due planned tasks and settles the ones whose backups are running.
///
/// Rows are claimed with row locks, so several servers can poll the same
/// tables. A claim dropped without commit (crash, error) releases its rows.
pub struct PlannedTasksWatcher {
    planned_tasks: Arc<dyn PlannedTaskStore>,
    orchestrator: TaskOrchestrator,
    catalog: Arc<SettingsCatalog>,
    error_callback: Arc<ErrorCallback>,
    batch_size: i64,
}

/// How the backups of one executing planned task ended up.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl PlannedTasksWatcher {
    pub fn new(
        planned_tasks: Arc<dyn PlannedTaskStore>,
        orchestrator: TaskOrchestrator,
        catalog: Arc<SettingsCatalog>,
        error_callback: Arc<ErrorCallback>,
        batch_size: i64,
    ) -> Self {
        PlannedTasksWatcher {
            planned_tasks,
            orchestrator,
            catalog,
            error_callback,
            batch_size,
        }
    }

    /// Starts one create task per storage for every due planned task.
    pub async fn watch_planned_tasks(&self) -> Result<usize> {
        let mut claim = self
            .planned_tasks
            .claim(PlannedTaskFilter::Due, self.batch_size)
            .await?;
        let planned = claim.rows().to_vec();
        let mut fired = 0;

        for planned_task in &planned {
            info!(
                planned_task_id = planned_task.id,
                database = %planned_task.database_settings_name,
                storages = ?planned_task.storage_settings_names,
                "Planned backup task fired"
            );
            let Some(started) = self.fire(planned_task).await else {
                continue;
            };
            claim
                .set_executing_tasks(planned_task.id, &started)
                .await?;
            claim
                .update_state(planned_task.id, PlannedTaskState::Executing)
                .await?;
            fired += 1;
            info!(planned_task_id = planned_task.id, tasks = ?started, "Planned backup task started");
        }

        claim.commit().await?;
        Ok(fired)
    }

    /// Returns the started task ids, or `None` when the planned task refers to
    /// a database that is not configured.
    async fn fire(&self, planned_task: &PlannedTask) -> Option<Vec<TaskId>> {
        let database = match self.catalog.database(&planned_task.database_settings_name) {
            Ok(database) => database.clone(),
            Err(e) => {
                error!(planned_task_id = planned_task.id, error = %e, "Can't handle planned task");
                return None;
            }
        };

        let tasks = self.orchestrator.tasks();
        let mut started = Vec::with_capacity(planned_task.storage_settings_names.len());
        for storage_name in &planned_task.storage_settings_names {
            if let Err(e) = self.catalog.storage(storage_name) {
                error!(planned_task_id = planned_task.id, error = %e, "Skipping storage of planned task");
                continue;
            }
            let result = async {
                let properties = tasks
                    .init_backup_properties(
                        &database.name,
                        storage_name,
                        planned_task.processors.clone(),
                    )
                    .await?;
                let task_id = tasks
                    .init_task(TaskType::CreateBackup, RunType::Internal, properties.id)
                    .await?;
                self.orchestrator
                    .start_create(task_id, properties, database.clone())?;
                Ok::<TaskId, crate::errors::AppError>(task_id)
            }
            .await;
            match result {
                Ok(task_id) => started.push(task_id),
                Err(e) => error!(
                    planned_task_id = planned_task.id,
                    storage = %storage_name,
                    error = %e,
                    "Failed to start backup of planned task"
                ),
            }
        }
        Some(started)
    }

    /// Returns finished planned tasks to `WAITING`. The timer only resets
    /// when every backup completed.
    pub async fn watch_executing_planned_tasks(&self) -> Result<usize> {
        let mut claim = self
            .planned_tasks
            .claim(PlannedTaskFilter::Executing, self.batch_size)
            .await?;
        let planned = claim.rows().to_vec();
        let mut settled = 0;

        for planned_task in &planned {
            let outcome = self.outcome(planned_task).await?;
            match outcome {
                Outcome::Running => continue,
                Outcome::Completed => {
                    claim.reset_timer(planned_task.id, Utc::now()).await?;
                    info!(planned_task_id = planned_task.id, "✅ Planned backup task completed");
                }
                Outcome::Failed => {
                    self.fail_all(planned_task).await;
                    warn!(
                        planned_task_id = planned_task.id,
                        "Planned backup task failed, it will fire again"
                    );
                }
                Outcome::Interrupted => {
                    warn!(
                        planned_task_id = planned_task.id,
                        "Planned backup task interrupted, it will fire again"
                    );
                }
            }
            settle(claim.as_mut(), planned_task.id).await?;
            settled += 1;
        }

        claim.commit().await?;
        Ok(settled)
    }

    async fn outcome(&self, planned_task: &PlannedTask) -> Result<Outcome> {
        let mut running = false;
        let mut interrupted = false;
        for &task_id in &planned_task.executing_tasks {
            let Some(task) = self.orchestrator.tasks().find_task(task_id).await? else {
                error!(
                    planned_task_id = planned_task.id,
                    task_id, "Task of planned task does not exist, skipping it"
                );
                continue;
            };
            if task.error {
                return Ok(Outcome::Failed);
            }
            match task.state {
                TaskState::Completed => {}
                TaskState::Interrupted => interrupted = true,
                _ => running = true,
            }
        }
        Ok(if running {
            Outcome::Running
        } else if interrupted {
            Outcome::Interrupted
        } else {
            Outcome::Completed
        })
    }

    /// Stops the sibling backups of a failed run and queues them for revert.
    async fn fail_all(&self, planned_task: &PlannedTask) {
        for &task_id in &planned_task.executing_tasks {
            if let Some(handle) = self.orchestrator.get_handle(task_id) {
                handle.cancel();
            }
            self.error_callback.mark_erroneous(task_id).await;
        }
    }
}

async fn settle(claim: &mut dyn PlannedTaskClaim, planned_task_id: i64) -> Result<()> {
    claim.set_executing_tasks(planned_task_id, &[]).await?;
    claim
        .update_state(planned_task_id, PlannedTaskState::Waiting)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::NewPlannedTask;
    use crate::tasks::testing::{FailingStorage, Harness};
    use chrono::Duration;

    fn watcher(harness: &Harness) -> PlannedTasksWatcher {
        PlannedTasksWatcher::new(
            harness.stores.planned_tasks.clone(),
            harness.orchestrator.clone(),
            harness.catalog.clone(),
            harness.callback.clone(),
            10,
        )
    }

    async fn add_due(harness: &Harness) -> anyhow::Result<PlannedTask> {
        Ok(harness
            .stores
            .planned_tasks
            .add(NewPlannedTask {
                database_settings_name: "shop".to_string(),
                storage_settings_names: vec!["local".to_string()],
                processors: vec!["compressor".to_string()],
                interval_seconds: 3600,
                last_started_at: Utc::now() - Duration::hours(2),
            })
            .await?)
    }

    /// Puts `planned` into `EXECUTING` with the given tasks.
    async fn executing_with(
        harness: &Harness,
        planned: &PlannedTask,
        tasks: &[TaskId],
    ) -> anyhow::Result<()> {
        let mut claim = harness
            .stores
            .planned_tasks
            .claim(PlannedTaskFilter::Due, 10)
            .await?;
        claim.set_executing_tasks(planned.id, tasks).await?;
        claim.update_state(planned.id, PlannedTaskState::Executing).await?;
        claim.commit().await?;
        Ok(())
    }

    async fn reload(harness: &Harness, id: i64) -> anyhow::Result<PlannedTask> {
        harness
            .stores
            .planned_tasks
            .find_by_id(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("planned task {} missing", id))
    }

    #[tokio::test]
    async fn test_due_planned_task_runs_and_resets_timer() -> anyhow::Result<()> {
        let harness = Harness::builder().build()?;
        let planned = add_due(&harness).await?;
        let watcher = watcher(&harness);

        assert_eq!(watcher.watch_planned_tasks().await?, 1);
        let executing = reload(&harness, planned.id).await?;
        assert_eq!(executing.state, PlannedTaskState::Executing);
        assert_eq!(executing.executing_tasks.len(), 1);
        let task_id = executing.executing_tasks[0];
        let task = harness.task(task_id).await?;
        assert_eq!(task.task_type, TaskType::CreateBackup);
        assert_eq!(task.run_type, RunType::Internal);

        // A second pass must not fire it again.
        assert_eq!(watcher.watch_planned_tasks().await?, 0);

        harness.wait_until_idle().await;
        assert_eq!(harness.task(task_id).await?.state, TaskState::Completed);

        assert_eq!(watcher.watch_executing_planned_tasks().await?, 1);
        let waiting = reload(&harness, planned.id).await?;
        assert_eq!(waiting.state, PlannedTaskState::Waiting);
        assert!(waiting.executing_tasks.is_empty());
        assert!(waiting.last_started_at > planned.last_started_at);
        assert!(!waiting.is_due(Utc::now()));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_backup_marks_siblings_and_keeps_timer() -> anyhow::Result<()> {
        let harness = Harness::builder().build()?;
        let planned = add_due(&harness).await?;
        let (failed, _) = harness.create_task(vec![]).await?;
        let (finished, _) = harness.create_task(vec![]).await?;
        harness.tasks.update_state(finished, TaskState::Completed).await?;
        harness.stores.tasks.set_error(failed).await?;
        executing_with(&harness, &planned, &[failed, finished]).await?;

        assert_eq!(watcher(&harness).watch_executing_planned_tasks().await?, 1);

        let waiting = reload(&harness, planned.id).await?;
        assert_eq!(waiting.state, PlannedTaskState::Waiting);
        assert_eq!(waiting.last_started_at, planned.last_started_at);
        assert!(harness.task(finished).await?.error);
        assert!(harness.stores.error_tasks.find_by_task_id(finished).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_backup_returns_to_waiting_without_reset() -> anyhow::Result<()> {
        let harness = Harness::builder().build()?;
        let planned = add_due(&harness).await?;
        let (interrupted, _) = harness.create_task(vec![]).await?;
        harness.tasks.update_state(interrupted, TaskState::Interrupted).await?;
        executing_with(&harness, &planned, &[interrupted]).await?;

        assert_eq!(watcher(&harness).watch_executing_planned_tasks().await?, 1);

        let waiting = reload(&harness, planned.id).await?;
        assert_eq!(waiting.state, PlannedTaskState::Waiting);
        assert_eq!(waiting.last_started_at, planned.last_started_at);
        assert!(!harness.task(interrupted).await?.error);
        Ok(())
    }

    #[tokio::test]
    async fn test_running_backup_keeps_planned_task_executing() -> anyhow::Result<()> {
        let harness = Harness::builder().build()?;
        let planned = add_due(&harness).await?;
        let (uploading, _) = harness.create_task(vec![]).await?;
        harness.tasks.update_state(uploading, TaskState::Uploading).await?;
        executing_with(&harness, &planned, &[uploading]).await?;

        assert_eq!(watcher(&harness).watch_executing_planned_tasks().await?, 0);
        assert_eq!(
            reload(&harness, planned.id).await?.state,
            PlannedTaskState::Executing
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_upload_settles_as_failed() -> anyhow::Result<()> {
        let harness = Harness::builder().storage(Arc::new(FailingStorage)).build()?;
        let planned = add_due(&harness).await?;
        let watcher = watcher(&harness);

        watcher.watch_planned_tasks().await?;
        harness.wait_until_idle().await;
        watcher.watch_executing_planned_tasks().await?;

        let waiting = reload(&harness, planned.id).await?;
        assert_eq!(waiting.state, PlannedTaskState::Waiting);
        assert!(waiting.is_due(Utc::now()));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_database_leaves_planned_task_waiting() -> anyhow::Result<()> {
        let harness = Harness::builder().build()?;
        let planned = harness
            .stores
            .planned_tasks
            .add(NewPlannedTask {
                database_settings_name: "gone".to_string(),
                storage_settings_names: vec!["local".to_string()],
                processors: vec![],
                interval_seconds: 60,
                last_started_at: Utc::now() - Duration::hours(1),
            })
            .await?;

        assert_eq!(watcher(&harness).watch_planned_tasks().await?, 0);
        assert_eq!(
            reload(&harness, planned.id).await?.state,
            PlannedTaskState::Waiting
        );
        Ok(())
    }
}
