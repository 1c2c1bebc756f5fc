// dbvault/src/tasks/orchestrator.rs
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::error_callback::ErrorCallback;
use super::manager::TasksManager;
use super::registry::{HandleRegistry, TaskHandle};
use crate::backup::DatabaseBackup;
use crate::entities::{BackupProperties, DatabaseSettings, TaskId, TaskState};
use crate::errors::{AppError, Result};
use crate::processor::BackupProcessorManager;
use crate::storage::BackupLoadManager;
use crate::stream::CancellableStream;

/// Starts backup workflows on the runtime and tracks them in the handle
/// registry until they end.
#[derive(Clone)]
pub struct TaskOrchestrator {
    registry: Arc<HandleRegistry>,
    tasks: Arc<TasksManager>,
    database_backup: Arc<dyn DatabaseBackup>,
    processors: Arc<BackupProcessorManager>,
    loader: Arc<BackupLoadManager>,
    error_callback: Arc<ErrorCallback>,
    workers: Arc<Semaphore>,
}

/// A started workflow.
pub struct WorkflowHandle {
    handle: TaskHandle,
    join: JoinHandle<()>,
}

impl WorkflowHandle {
    pub fn task_id(&self) -> TaskId {
        self.handle.task_id()
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Waits until the workflow has settled its task row.
    pub async fn wait(self) {
        let task_id = self.handle.task_id();
        if let Err(e) = self.join.await {
            error!(task_id, error = %e, "Workflow task panicked");
        }
    }
}

enum Job {
    Create {
        properties: BackupProperties,
        database: DatabaseSettings,
    },
    Restore {
        properties: BackupProperties,
        storage_settings_name: String,
        database: DatabaseSettings,
    },
    Delete {
        properties: BackupProperties,
    },
}

impl Job {
    fn backup_name(&self) -> &str {
        match self {
            Job::Create { properties, .. }
            | Job::Restore { properties, .. }
            | Job::Delete { properties } => &properties.backup_name,
        }
    }
}

/// Stage bookkeeping of one running workflow.
struct Workflow {
    task_id: TaskId,
    token: CancellationToken,
    tasks: Arc<TasksManager>,
    stage: Option<TaskState>,
}

impl Workflow {
    fn checkpoint(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(AppError::Interrupted);
        }
        Ok(())
    }

    async fn enter(&mut self, state: TaskState) -> Result<()> {
        self.checkpoint()?;
        self.tasks.update_state(self.task_id, state).await?;
        self.stage = Some(state);
        info!(task_id = self.task_id, stage = %state, "Task stage started");
        Ok(())
    }

    /// Runs one step of the current stage, abandoning it on cancellation.
    async fn run<T, F>(&self, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.checkpoint()?;
        let value = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(AppError::Interrupted),
            result = step => result?,
        };
        self.checkpoint()?;
        Ok(value)
    }
}

impl TaskOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<HandleRegistry>,
        tasks: Arc<TasksManager>,
        database_backup: Arc<dyn DatabaseBackup>,
        processors: Arc<BackupProcessorManager>,
        loader: Arc<BackupLoadManager>,
        error_callback: Arc<ErrorCallback>,
        max_concurrent_tasks: usize,
    ) -> Self {
        TaskOrchestrator {
            registry,
            tasks,
            database_backup,
            processors,
            loader,
            error_callback,
            workers: Arc::new(Semaphore::new(max_concurrent_tasks)),
        }
    }

    pub fn tasks(&self) -> &Arc<TasksManager> {
        &self.tasks
    }

    pub fn processors(&self) -> &Arc<BackupProcessorManager> {
        &self.processors
    }

    pub fn get_handle(&self, task_id: TaskId) -> Option<TaskHandle> {
        self.registry.get(task_id)
    }

    pub fn start_create(
        &self,
        task_id: TaskId,
        properties: BackupProperties,
        database: DatabaseSettings,
    ) -> Result<WorkflowHandle> {
        self.processors.validate(&properties.processors)?;
        self.start(task_id, Job::Create { properties, database })
    }

    pub fn start_restore(
        &self,
        task_id: TaskId,
        properties: BackupProperties,
        storage_settings_name: String,
        database: DatabaseSettings,
    ) -> Result<WorkflowHandle> {
        self.processors.validate(&properties.processors)?;
        self.start(
            task_id,
            Job::Restore {
                properties,
                storage_settings_name,
                database,
            },
        )
    }

    pub fn start_delete(&self, task_id: TaskId, properties: BackupProperties) -> Result<WorkflowHandle> {
        self.start(task_id, Job::Delete { properties })
    }

    fn start(&self, task_id: TaskId, job: Job) -> Result<WorkflowHandle> {
        let (handle, guard) = self.registry.register(task_id)?;
        let token = handle.token().clone();
        let this = self.clone();

        let join = tokio::spawn(async move {
            let _guard = guard;
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(task_id, "Task cancelled before it started");
                    return;
                }
                permit = this.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(task_id, "Worker pool closed, task not started");
                        return;
                    }
                },
            };

            let backup_name = job.backup_name().to_string();
            let mut workflow = Workflow {
                task_id,
                token,
                tasks: this.tasks.clone(),
                stage: None,
            };
            let result = this.execute(&mut workflow, job).await;
            this.settle(&workflow, &backup_name, result).await;
        });

        Ok(WorkflowHandle { handle, join })
    }

    async fn execute(&self, workflow: &mut Workflow, job: Job) -> Result<()> {
        match job {
            Job::Create {
                properties,
                database,
            } => self.create_backup(workflow, &properties, &database).await,
            Job::Restore {
                properties,
                storage_settings_name,
                database,
            } => {
                self.restore_backup(workflow, &properties, &storage_settings_name, &database)
                    .await
            }
            Job::Delete { properties } => self.delete_backup(workflow, &properties).await,
        }
    }

    async fn create_backup(
        &self,
        workflow: &mut Workflow,
        properties: &BackupProperties,
        database: &DatabaseSettings,
    ) -> Result<()> {
        let task_id = workflow.task_id;
        workflow.enter(TaskState::Creating).await?;
        let dump = workflow
            .run(self.database_backup.create_backup(database, task_id, &workflow.token))
            .await?;
        let Some(dump) = dump else {
            return Err(AppError::Interrupted);
        };
        let (stream, supervisor) = dump.into_parts();

        workflow.enter(TaskState::ApplyingProcessors).await?;
        let processed = self.processors.process(stream, &properties.processors)?;
        let processed = CancellableStream::boxed(processed, workflow.token.clone());

        workflow.enter(TaskState::Uploading).await?;
        workflow
            .run(self.loader.upload_backup(processed, properties, task_id))
            .await?;
        workflow
            .run(async {
                supervisor.finish().await;
                Ok::<(), AppError>(())
            })
            .await?;

        workflow.enter(TaskState::Completed).await
    }

    async fn restore_backup(
        &self,
        workflow: &mut Workflow,
        properties: &BackupProperties,
        storage_settings_name: &str,
        database: &DatabaseSettings,
    ) -> Result<()> {
        let task_id = workflow.task_id;
        workflow.enter(TaskState::Downloading).await?;
        let downloaded = workflow
            .run(
                self.loader
                    .download_backup(&properties.backup_name, storage_settings_name, task_id),
            )
            .await?;
        let Some(downloaded) = downloaded else {
            warn!(
                task_id,
                backup = %properties.backup_name,
                storage = %storage_settings_name,
                "Backup not found in storage, restore interrupted"
            );
            return Err(AppError::Interrupted);
        };

        workflow.enter(TaskState::ApplyingDeprocessors).await?;
        let stream = CancellableStream::boxed(downloaded, workflow.token.clone());
        let stream = self.processors.deprocess(stream, &properties.processors)?;

        workflow.enter(TaskState::Restoring).await?;
        workflow
            .run(
                self.database_backup
                    .restore_backup(stream, database, task_id, &workflow.token),
            )
            .await?;

        workflow.enter(TaskState::Completed).await
    }

    async fn delete_backup(&self, workflow: &mut Workflow, properties: &BackupProperties) -> Result<()> {
        workflow.enter(TaskState::Deleting).await?;
        workflow
            .run(self.loader.delete_backup(properties, workflow.task_id))
            .await?;
        workflow.enter(TaskState::Completed).await
    }

    async fn settle(&self, workflow: &Workflow, backup_name: &str, result: Result<()>) {
        let task_id = workflow.task_id;
        match result {
            Ok(()) => info!(task_id, backup = %backup_name, "✅ Task completed"),
            Err(e) if e.is_interrupted() || workflow.token.is_cancelled() => match workflow.stage {
                None => info!(task_id, "Task cancelled before its first stage"),
                Some(stage) => {
                    info!(task_id, stage = %stage, backup = %backup_name, "Task interrupted");
                    if let Err(e) = self.tasks.update_state(task_id, TaskState::Interrupted).await {
                        error!(task_id, error = %e, "Failed to mark task interrupted");
                    }
                }
            },
            Err(e) => {
                error!(
                    task_id,
                    stage = ?workflow.stage,
                    backup = %backup_name,
                    error = %e,
                    "❌ Task failed"
                );
                self.error_callback.on_error(e, task_id).await;
            }
        }
    }
}
