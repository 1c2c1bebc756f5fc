// dbvault/src/watchers/error_tasks.rs
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::store::ErrorTaskStore;
use crate::tasks::TaskOrchestrator;

/// Reverts erroneous tasks, at most `batch_size` per pass.
pub struct ErrorTasksWatcher {
    error_tasks: Arc<dyn ErrorTaskStore>,
    orchestrator: TaskOrchestrator,
    batch_size: i64,
}

impl ErrorTasksWatcher {
    pub fn new(
        error_tasks: Arc<dyn ErrorTaskStore>,
        orchestrator: TaskOrchestrator,
        batch_size: i64,
    ) -> Self {
        ErrorTasksWatcher {
            error_tasks,
            orchestrator,
            batch_size,
        }
    }

    pub async fn watch_error_tasks(&self) -> Result<usize> {
        let mut claim = self.error_tasks.claim_unhandled(self.batch_size).await?;
        let rows = claim.rows().to_vec();
        let tasks = self.orchestrator.tasks();
        let mut handled = 0;

        for error_task in &rows {
            let task_id = error_task.task_id;
            if self
                .orchestrator
                .get_handle(task_id)
                .is_some_and(|handle| handle.cancel())
            {
                info!(task_id, "Cancelled workflow of erroneous task");
            }

            match tasks.find_task(task_id).await? {
                Some(task) => {
                    if let Err(e) = tasks.revert_task(&task, &self.orchestrator).await {
                        // Left unhandled; the next pass retries it.
                        error!(task_id, error = %e, "Failed to revert erroneous task");
                        continue;
                    }
                }
                None => warn!(task_id, "Erroneous task no longer exists"),
            }

            claim.mark_handled(task_id).await?;
            handled += 1;
            info!(task_id, "Erroneous task handled");
        }

        claim.commit().await?;
        Ok(handled)
    }
}
