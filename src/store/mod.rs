// dbvault/src/store/mod.rs
//! Persistence of tasks, planned tasks, error and cancel requests, and backup
//! properties.
//!
//! Pollers that must not double-process rows use the claim API: a claim
//! hands out a batch of rows that stay invisible to every other claimer until
//! the claim is committed or dropped. Updates to claimed rows go through the
//! claim itself, so on PostgreSQL they run inside the transaction that holds
//! the row locks.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::entities::{
    BackupProperties, CancelTask, ErrorTask, NewBackupProperties, NewPlannedTask, PlannedTask,
    PlannedTaskFilter, PlannedTaskState, RunType, Task, TaskId, TaskState, TaskType,
};
use crate::errors::Result;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a task in its initial `PLANNED` state.
    async fn create(
        &self,
        task_type: TaskType,
        run_type: RunType,
        backup_properties_id: i64,
    ) -> Result<Task>;

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>>;

    async fn update_state(&self, id: TaskId, state: TaskState) -> Result<()>;

    /// Raises the error flag. Calling it again is a no-op.
    async fn set_error(&self, id: TaskId) -> Result<()>;
}

#[async_trait]
pub trait BackupPropertiesStore: Send + Sync {
    async fn create(&self, properties: NewBackupProperties) -> Result<BackupProperties>;

    async fn find_by_id(&self, id: i64) -> Result<Option<BackupProperties>>;

    async fn delete(&self, id: i64) -> Result<()>;
}

/// Planned tasks held by one poller.
#[async_trait]
pub trait PlannedTaskClaim: Send {
    fn rows(&self) -> &[PlannedTask];

    async fn update_state(&mut self, id: i64, state: PlannedTaskState) -> Result<()>;

    async fn set_executing_tasks(&mut self, id: i64, tasks: &[TaskId]) -> Result<()>;

    /// Restarts the interval countdown from `now`.
    async fn reset_timer(&mut self, id: i64, now: DateTime<Utc>) -> Result<()>;

    /// Persists the updates and releases the claimed rows.
    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait PlannedTaskStore: Send + Sync {
    async fn add(&self, planned: NewPlannedTask) -> Result<PlannedTask>;

    async fn find_by_id(&self, id: i64) -> Result<Option<PlannedTask>>;

    async fn claim(&self, filter: PlannedTaskFilter, limit: i64)
    -> Result<Box<dyn PlannedTaskClaim>>;
}

/// Unhandled error tasks held by one poller.
#[async_trait]
pub trait ErrorTaskClaim: Send {
    fn rows(&self) -> &[ErrorTask];

    async fn mark_handled(&mut self, task_id: TaskId) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait ErrorTaskStore: Send + Sync {
    /// Records the failure of `task_id`. Returns `false` when an entry already
    /// existed.
    async fn add(&self, task_id: TaskId) -> Result<bool>;

    async fn find_by_task_id(&self, task_id: TaskId) -> Result<Option<ErrorTask>>;

    async fn claim_unhandled(&self, limit: i64) -> Result<Box<dyn ErrorTaskClaim>>;
}

#[async_trait]
pub trait CancelTaskStore: Send + Sync {
    /// Returns `false` when a request for `task_id` is already pending.
    async fn add(&self, task_id: TaskId) -> Result<bool>;

    async fn find_all(&self) -> Result<Vec<CancelTask>>;

    async fn delete_by_task_id(&self, task_id: TaskId) -> Result<()>;
}

/// Every store the engine needs, behind trait objects.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn TaskStore>,
    pub backup_properties: Arc<dyn BackupPropertiesStore>,
    pub planned_tasks: Arc<dyn PlannedTaskStore>,
    pub error_tasks: Arc<dyn ErrorTaskStore>,
    pub cancel_tasks: Arc<dyn CancelTaskStore>,
}

impl Stores {
    pub fn postgres(store: PgStore) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn in_memory() -> Self {
        Self::from_shared(Arc::new(MemoryStore::default()))
    }

    fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: TaskStore
            + BackupPropertiesStore
            + PlannedTaskStore
            + ErrorTaskStore
            + CancelTaskStore
            + 'static,
    {
        Stores {
            tasks: store.clone(),
            backup_properties: store.clone(),
            planned_tasks: store.clone(),
            error_tasks: store.clone(),
            cancel_tasks: store,
        }
    }
}
