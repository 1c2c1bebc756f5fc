// dbvault/src/store/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use super::{
    BackupPropertiesStore, CancelTaskStore, ErrorTaskClaim, ErrorTaskStore, PlannedTaskClaim,
    PlannedTaskStore, TaskStore,
};
use crate::entities::{
    BackupProperties, CancelTask, ErrorTask, NewBackupProperties, NewPlannedTask, PlannedTask,
    PlannedTaskFilter, PlannedTaskState, RunType, Task, TaskId, TaskState, TaskType,
};
use crate::errors::{AppError, Result};

const TASK_COLUMNS: &str =
    "id, task_type, run_type, state, backup_properties_id, created_at, error";
const PLANNED_TASK_COLUMNS: &str = "id, database_settings_name, storage_settings_names, processors, \
     interval_seconds, last_started_at, state, executing_tasks";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(PgStore { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Metadata database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        task_type: row.try_get::<String, _>("task_type")?.parse()?,
        run_type: row.try_get::<String, _>("run_type")?.parse()?,
        state: row.try_get::<String, _>("state")?.parse()?,
        backup_properties_id: row.try_get("backup_properties_id")?,
        created_at: row.try_get("created_at")?,
        error: row.try_get("error")?,
    })
}

fn backup_properties_from_row(row: &PgRow) -> Result<BackupProperties> {
    Ok(BackupProperties {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        backup_name: row.try_get("backup_name")?,
        processors: row.try_get("processors")?,
        storage_settings_name: row.try_get("storage_settings_name")?,
    })
}

fn planned_task_from_row(row: &PgRow) -> Result<PlannedTask> {
    Ok(PlannedTask {
        id: row.try_get("id")?,
        database_settings_name: row.try_get("database_settings_name")?,
        storage_settings_names: row.try_get("storage_settings_names")?,
        processors: row.try_get("processors")?,
        interval_seconds: row.try_get("interval_seconds")?,
        last_started_at: row.try_get("last_started_at")?,
        state: row.try_get::<String, _>("state")?.parse()?,
        executing_tasks: row.try_get("executing_tasks")?,
    })
}

fn error_task_from_row(row: &PgRow) -> Result<ErrorTask> {
    Ok(ErrorTask {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        error_handled: row.try_get("error_handled")?,
    })
}

fn ensure_updated(rows_affected: u64, what: impl FnOnce() -> String) -> Result<()> {
    if rows_affected == 0 {
        return Err(AppError::NotFound(what()));
    }
    Ok(())
}

#[async_trait]
impl TaskStore for PgStore {
    async fn create(
        &self,
        task_type: TaskType,
        run_type: RunType,
        backup_properties_id: i64,
    ) -> Result<Task> {
        let row = sqlx::query(&format!(
            "INSERT INTO tasks (task_type, run_type, state, backup_properties_id) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            TASK_COLUMNS
        ))
        .bind(task_type.as_str())
        .bind(run_type.as_str())
        .bind(TaskState::Planned.as_str())
        .bind(backup_properties_id)
        .fetch_one(&self.pool)
        .await?;
        task_from_row(&row)
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn update_state(&self, id: TaskId, state: TaskState) -> Result<()> {
        let result = sqlx::query("UPDATE tasks SET state = $1 WHERE id = $2")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        ensure_updated(result.rows_affected(), || format!("task {}", id))
    }

    async fn set_error(&self, id: TaskId) -> Result<()> {
        let result = sqlx::query("UPDATE tasks SET error = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        ensure_updated(result.rows_affected(), || format!("task {}", id))
    }
}

#[async_trait]
impl BackupPropertiesStore for PgStore {
    async fn create(&self, properties: NewBackupProperties) -> Result<BackupProperties> {
        let row = sqlx::query(
            "INSERT INTO backup_properties (created_at, backup_name, processors, storage_settings_name) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, created_at, backup_name, processors, storage_settings_name",
        )
        .bind(properties.created_at)
        .bind(&properties.backup_name)
        .bind(&properties.processors)
        .bind(&properties.storage_settings_name)
        .fetch_one(&self.pool)
        .await?;
        backup_properties_from_row(&row)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<BackupProperties>> {
        let row = sqlx::query(
            "SELECT id, created_at, backup_name, processors, storage_settings_name \
             FROM backup_properties WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(backup_properties_from_row).transpose()
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM backup_properties WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Planned task rows locked by an open transaction.
struct PgPlannedTaskClaim {
    tx: Transaction<'static, Postgres>,
    rows: Vec<PlannedTask>,
}

#[async_trait]
impl PlannedTaskClaim for PgPlannedTaskClaim {
    fn rows(&self) -> &[PlannedTask] {
        &self.rows
    }

    async fn update_state(&mut self, id: i64, state: PlannedTaskState) -> Result<()> {
        let result = sqlx::query("UPDATE planned_tasks SET state = $1 WHERE id = $2")
            .bind(state.as_str())
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        ensure_updated(result.rows_affected(), || format!("planned task {}", id))
    }

    async fn set_executing_tasks(&mut self, id: i64, tasks: &[TaskId]) -> Result<()> {
        let result = sqlx::query("UPDATE planned_tasks SET executing_tasks = $1 WHERE id = $2")
            .bind(tasks.to_vec())
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        ensure_updated(result.rows_affected(), || format!("planned task {}", id))
    }

    async fn reset_timer(&mut self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE planned_tasks SET last_started_at = $1 WHERE id = $2")
            .bind(now)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        ensure_updated(result.rows_affected(), || format!("planned task {}", id))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PlannedTaskStore for PgStore {
    async fn add(&self, planned: NewPlannedTask) -> Result<PlannedTask> {
        let row = sqlx::query(&format!(
            "INSERT INTO planned_tasks (database_settings_name, storage_settings_names, processors, \
             interval_seconds, last_started_at, state) VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            PLANNED_TASK_COLUMNS
        ))
        .bind(&planned.database_settings_name)
        .bind(&planned.storage_settings_names)
        .bind(&planned.processors)
        .bind(planned.interval_seconds)
        .bind(planned.last_started_at)
        .bind(PlannedTaskState::Waiting.as_str())
        .fetch_one(&self.pool)
        .await?;
        planned_task_from_row(&row)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<PlannedTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM planned_tasks WHERE id = $1",
            PLANNED_TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(planned_task_from_row).transpose()
    }

    async fn claim(
        &self,
        filter: PlannedTaskFilter,
        limit: i64,
    ) -> Result<Box<dyn PlannedTaskClaim>> {
        let condition = match filter {
            PlannedTaskFilter::Due => {
                "state = $1 AND last_started_at + interval_seconds * INTERVAL '1 second' <= now()"
            }
            PlannedTaskFilter::Executing => "state = $1",
        };
        let state = match filter {
            PlannedTaskFilter::Due => PlannedTaskState::Waiting,
            PlannedTaskFilter::Executing => PlannedTaskState::Executing,
        };

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM planned_tasks WHERE {} ORDER BY id LIMIT $2 FOR UPDATE SKIP LOCKED",
            PLANNED_TASK_COLUMNS, condition
        ))
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        let rows = rows
            .iter()
            .map(planned_task_from_row)
            .collect::<Result<Vec<_>>>()?;
        debug!(?filter, claimed = rows.len(), "Claimed planned tasks");
        Ok(Box::new(PgPlannedTaskClaim { tx, rows }))
    }
}

/// Unhandled error task rows locked by an open transaction.
struct PgErrorTaskClaim {
    tx: Transaction<'static, Postgres>,
    rows: Vec<ErrorTask>,
}

#[async_trait]
impl ErrorTaskClaim for PgErrorTaskClaim {
    fn rows(&self) -> &[ErrorTask] {
        &self.rows
    }

    async fn mark_handled(&mut self, task_id: TaskId) -> Result<()> {
        let result = sqlx::query("UPDATE error_tasks SET error_handled = TRUE WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *self.tx)
            .await?;
        ensure_updated(result.rows_affected(), || format!("error task for task {}", task_id))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ErrorTaskStore for PgStore {
    async fn add(&self, task_id: TaskId) -> Result<bool> {
        let result =
            sqlx::query("INSERT INTO error_tasks (task_id) VALUES ($1) ON CONFLICT (task_id) DO NOTHING")
                .bind(task_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_task_id(&self, task_id: TaskId) -> Result<Option<ErrorTask>> {
        let row = sqlx::query("SELECT id, task_id, error_handled FROM error_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(error_task_from_row).transpose()
    }

    async fn claim_unhandled(&self, limit: i64) -> Result<Box<dyn ErrorTaskClaim>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT id, task_id, error_handled FROM error_tasks WHERE NOT error_handled \
             ORDER BY id LIMIT $1 FOR UPDATE SKIP LOCKED",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        let rows = rows
            .iter()
            .map(error_task_from_row)
            .collect::<Result<Vec<_>>>()?;
        debug!(claimed = rows.len(), "Claimed error tasks");
        Ok(Box::new(PgErrorTaskClaim { tx, rows }))
    }
}

#[async_trait]
impl CancelTaskStore for PgStore {
    async fn add(&self, task_id: TaskId) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO cancel_tasks (task_id, put_time) VALUES ($1, now()) \
             ON CONFLICT (task_id) DO NOTHING",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_all(&self) -> Result<Vec<CancelTask>> {
        let rows = sqlx::query("SELECT id, task_id, put_time FROM cancel_tasks ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<CancelTask> {
                Ok(CancelTask {
                    id: row.try_get("id")?,
                    task_id: row.try_get("task_id")?,
                    put_time: row.try_get("put_time")?,
                })
            })
            .collect()
    }

    async fn delete_by_task_id(&self, task_id: TaskId) -> Result<()> {
        sqlx::query("DELETE FROM cancel_tasks WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
