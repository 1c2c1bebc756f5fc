// dbvault/src/watchers/cancel_tasks.rs
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::errors::Result;
use crate::store::CancelTaskStore;
use crate::tasks::TaskOrchestrator;

/// Applies durable cancellation requests to workflows running on this server.
///
/// A request stays queued until the server that owns the workflow picks it
/// up. Requests older than `timeout` are dropped: their workflow was lost
/// with a restart and can no longer be cancelled.
pub struct CancelTasksWatcher {
    cancel_tasks: Arc<dyn CancelTaskStore>,
    orchestrator: TaskOrchestrator,
    timeout: Duration,
}

impl CancelTasksWatcher {
    pub fn new(
        cancel_tasks: Arc<dyn CancelTaskStore>,
        orchestrator: TaskOrchestrator,
        timeout: Duration,
    ) -> Self {
        CancelTasksWatcher {
            cancel_tasks,
            orchestrator,
            timeout,
        }
    }

    pub async fn watch_tasks_to_cancel(&self) -> Result<usize> {
        let tasks = self.orchestrator.tasks();
        let timeout = chrono::Duration::from_std(self.timeout).ok();
        let mut cancelled = 0;

        for request in self.cancel_tasks.find_all().await? {
            let task_id = request.task_id;
            if tasks.find_task(task_id).await?.is_none() {
                error!(task_id, "Can't cancel task: no such task");
                self.cancel_tasks.delete_by_task_id(task_id).await?;
                continue;
            }

            let expired = timeout
                .and_then(|timeout| request.put_time.checked_add_signed(timeout))
                .is_some_and(|deadline| Utc::now() >= deadline);
            if expired {
                error!(task_id, put_time = %request.put_time, "Can't cancel task: timeout exceeded");
                self.cancel_tasks.delete_by_task_id(task_id).await?;
                continue;
            }

            // Owned by another server, or not started yet.
            let Some(handle) = self.orchestrator.get_handle(task_id) else {
                continue;
            };

            info!(task_id, "Cancelling task");
            handle.cancel();
            // Re-read after cancelling: the stage can no longer advance.
            if let Some(task) = tasks.find_task(task_id).await? {
                if let Err(e) = tasks.revert_task(&task, &self.orchestrator).await {
                    error!(task_id, error = %e, "Failed to revert cancelled task");
                }
            }
            self.cancel_tasks.delete_by_task_id(task_id).await?;
            cancelled += 1;
            info!(task_id, "Task cancelled");
        }

        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TaskState;
    use crate::tasks::testing::{Harness, StallingStorage};

    fn watcher(harness: &Harness, timeout: Duration) -> CancelTasksWatcher {
        CancelTasksWatcher::new(
            harness.stores.cancel_tasks.clone(),
            harness.orchestrator.clone(),
            timeout,
        )
    }

    #[tokio::test]
    async fn test_request_cancels_running_upload_and_reverts_it() -> anyhow::Result<()> {
        let stalling = Arc::new(StallingStorage::default());
        let harness = Harness::builder().storage(stalling.clone()).build()?;
        let (task_id, properties) = harness.create_task(vec![]).await?;
        let workflow = harness
            .orchestrator
            .start_create(task_id, properties.clone(), harness.database())?;
        stalling.started.notified().await;

        harness.stores.cancel_tasks.add(task_id).await?;
        let watcher = watcher(&harness, Duration::from_secs(600));
        assert_eq!(watcher.watch_tasks_to_cancel().await?, 1);

        workflow.wait().await;
        let task = harness.task(task_id).await?;
        assert_eq!(task.state, TaskState::Interrupted);
        assert!(!task.error);
        assert!(harness.stores.cancel_tasks.find_all().await?.is_empty());
        assert!(harness.tasks.find_backup_properties(properties.id).await?.is_none());
        harness.wait_until_idle().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_request_without_live_workflow_stays_queued() -> anyhow::Result<()> {
        let harness = Harness::builder().build()?;
        let (task_id, _) = harness.create_task(vec![]).await?;
        harness.stores.cancel_tasks.add(task_id).await?;

        assert_eq!(
            watcher(&harness, Duration::from_secs(600))
                .watch_tasks_to_cancel()
                .await?,
            0
        );
        assert_eq!(harness.stores.cancel_tasks.find_all().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_request_is_dropped_without_cancelling() -> anyhow::Result<()> {
        let harness = Harness::builder().workers(0).build()?;
        let (task_id, properties) = harness.create_task(vec![]).await?;
        let workflow = harness
            .orchestrator
            .start_create(task_id, properties, harness.database())?;
        harness.stores.cancel_tasks.add(task_id).await?;

        assert_eq!(watcher(&harness, Duration::ZERO).watch_tasks_to_cancel().await?, 0);
        assert!(harness.stores.cancel_tasks.find_all().await?.is_empty());
        assert!(!workflow.handle().is_cancelled());

        workflow.cancel();
        workflow.wait().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_request_for_unknown_task_is_dropped() -> anyhow::Result<()> {
        let harness = Harness::builder().build()?;
        harness.stores.cancel_tasks.add(4242).await?;

        watcher(&harness, Duration::from_secs(600))
            .watch_tasks_to_cancel()
            .await?;
        assert!(harness.stores.cancel_tasks.find_all().await?.is_empty());
        Ok(())
    }
}
