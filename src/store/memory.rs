// dbvault/src/store/memory.rs
//! In-process store used by tests and dry runs. Claims are modelled as leases:
//! a leased row is skipped by other claimers until its claim goes away, and
//! writes made through a claim are discarded unless it is committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    BackupPropertiesStore, CancelTaskStore, ErrorTaskClaim, ErrorTaskStore, PlannedTaskClaim,
    PlannedTaskStore, TaskStore,
};
use crate::entities::{
    BackupProperties, CancelTask, ErrorTask, NewBackupProperties, NewPlannedTask, PlannedTask,
    PlannedTaskFilter, PlannedTaskState, RunType, Task, TaskId, TaskState, TaskType,
};
use crate::errors::{AppError, Result};

#[derive(Default)]
struct State {
    next_id: i64,
    tasks: BTreeMap<TaskId, Task>,
    backup_properties: BTreeMap<i64, BackupProperties>,
    planned_tasks: BTreeMap<i64, PlannedTask>,
    error_tasks: BTreeMap<i64, ErrorTask>,
    cancel_tasks: BTreeMap<i64, CancelTask>,
    leased_planned: HashSet<i64>,
    leased_errors: HashSet<i64>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    // A panic while holding the lock leaves plain data behind; keep serving it.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(
        &self,
        task_type: TaskType,
        run_type: RunType,
        backup_properties_id: i64,
    ) -> Result<Task> {
        let mut state = self.lock();
        let task = Task {
            id: state.next_id(),
            task_type,
            run_type,
            state: TaskState::Planned,
            backup_properties_id,
            created_at: Utc::now(),
            error: false,
        };
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.lock().tasks.get(&id).cloned())
    }

    async fn update_state(&self, id: TaskId, new_state: TaskState) -> Result<()> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("task {}", id)))?;
        task.state = new_state;
        Ok(())
    }

    async fn set_error(&self, id: TaskId) -> Result<()> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("task {}", id)))?;
        task.error = true;
        Ok(())
    }
}

#[async_trait]
impl BackupPropertiesStore for MemoryStore {
    async fn create(&self, properties: NewBackupProperties) -> Result<BackupProperties> {
        let mut state = self.lock();
        let created = BackupProperties {
            id: state.next_id(),
            created_at: properties.created_at,
            backup_name: properties.backup_name,
            processors: properties.processors,
            storage_settings_name: properties.storage_settings_name,
        };
        state.backup_properties.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<BackupProperties>> {
        Ok(self.lock().backup_properties.get(&id).cloned())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.lock().backup_properties.remove(&id);
        Ok(())
    }
}

/// Updates land on the claimed copies and reach the store only on commit.
struct MemoryPlannedClaim {
    state: Arc<Mutex<State>>,
    rows: Vec<PlannedTask>,
    dirty: HashSet<i64>,
}

impl MemoryPlannedClaim {
    fn with_row<F>(&mut self, id: i64, update: F) -> Result<()>
    where
        F: FnOnce(&mut PlannedTask),
    {
        let Some(row) = self.rows.iter_mut().find(|row| row.id == id) else {
            return Err(AppError::InvalidInput(format!(
                "planned task {} is not part of this claim",
                id
            )));
        };
        if !lock(&self.state).planned_tasks.contains_key(&id) {
            return Err(AppError::NotFound(format!("planned task {}", id)));
        }
        update(row);
        self.dirty.insert(id);
        Ok(())
    }
}

impl Drop for MemoryPlannedClaim {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for row in &self.rows {
            state.leased_planned.remove(&row.id);
        }
    }
}

#[async_trait]
impl PlannedTaskClaim for MemoryPlannedClaim {
    fn rows(&self) -> &[PlannedTask] {
        &self.rows
    }

    async fn update_state(&mut self, id: i64, new_state: PlannedTaskState) -> Result<()> {
        self.with_row(id, |row| row.state = new_state)
    }

    async fn set_executing_tasks(&mut self, id: i64, tasks: &[TaskId]) -> Result<()> {
        self.with_row(id, |row| row.executing_tasks = tasks.to_vec())
    }

    async fn reset_timer(&mut self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.with_row(id, |row| row.last_started_at = now)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = lock(&self.state);
        for row in self.rows.iter().filter(|row| self.dirty.contains(&row.id)) {
            if let Some(stored) = state.planned_tasks.get_mut(&row.id) {
                *stored = row.clone();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PlannedTaskStore for MemoryStore {
    async fn add(&self, planned: NewPlannedTask) -> Result<PlannedTask> {
        let mut state = self.lock();
        let created = PlannedTask {
            id: state.next_id(),
            database_settings_name: planned.database_settings_name,
            storage_settings_names: planned.storage_settings_names,
            processors: planned.processors,
            interval_seconds: planned.interval_seconds,
            last_started_at: planned.last_started_at,
            state: PlannedTaskState::Waiting,
            executing_tasks: Vec::new(),
        };
        state.planned_tasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<PlannedTask>> {
        Ok(self.lock().planned_tasks.get(&id).cloned())
    }

    async fn claim(
        &self,
        filter: PlannedTaskFilter,
        limit: i64,
    ) -> Result<Box<dyn PlannedTaskClaim>> {
        let now = Utc::now();
        let mut state = self.lock();
        let rows: Vec<PlannedTask> = state
            .planned_tasks
            .values()
            .filter(|row| !state.leased_planned.contains(&row.id))
            .filter(|row| match filter {
                PlannedTaskFilter::Due => row.is_due(now),
                PlannedTaskFilter::Executing => row.state == PlannedTaskState::Executing,
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        for row in &rows {
            state.leased_planned.insert(row.id);
        }
        drop(state);
        Ok(Box::new(MemoryPlannedClaim {
            state: self.state.clone(),
            rows,
            dirty: HashSet::new(),
        }))
    }
}

struct MemoryErrorClaim {
    state: Arc<Mutex<State>>,
    rows: Vec<ErrorTask>,
}

impl Drop for MemoryErrorClaim {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for row in &self.rows {
            state.leased_errors.remove(&row.id);
        }
    }
}

#[async_trait]
impl ErrorTaskClaim for MemoryErrorClaim {
    fn rows(&self) -> &[ErrorTask] {
        &self.rows
    }

    async fn mark_handled(&mut self, task_id: TaskId) -> Result<()> {
        let Some(row) = self.rows.iter_mut().find(|row| row.task_id == task_id) else {
            return Err(AppError::InvalidInput(format!(
                "error task for task {} is not part of this claim",
                task_id
            )));
        };
        row.error_handled = true;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = lock(&self.state);
        for row in self.rows.iter().filter(|row| row.error_handled) {
            if let Some(stored) = state.error_tasks.get_mut(&row.id) {
                stored.error_handled = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ErrorTaskStore for MemoryStore {
    async fn add(&self, task_id: TaskId) -> Result<bool> {
        let mut state = self.lock();
        if state.error_tasks.values().any(|row| row.task_id == task_id) {
            return Ok(false);
        }
        let id = state.next_id();
        state.error_tasks.insert(
            id,
            ErrorTask {
                id,
                task_id,
                error_handled: false,
            },
        );
        Ok(true)
    }

    async fn find_by_task_id(&self, task_id: TaskId) -> Result<Option<ErrorTask>> {
        Ok(self
            .lock()
            .error_tasks
            .values()
            .find(|row| row.task_id == task_id)
            .cloned())
    }

    async fn claim_unhandled(&self, limit: i64) -> Result<Box<dyn ErrorTaskClaim>> {
        let mut state = self.lock();
        let rows: Vec<ErrorTask> = state
            .error_tasks
            .values()
            .filter(|row| !row.error_handled && !state.leased_errors.contains(&row.id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        for row in &rows {
            state.leased_errors.insert(row.id);
        }
        drop(state);
        Ok(Box::new(MemoryErrorClaim {
            state: self.state.clone(),
            rows,
        }))
    }
}

#[async_trait]
impl CancelTaskStore for MemoryStore {
    async fn add(&self, task_id: TaskId) -> Result<bool> {
        let mut state = self.lock();
        if state.cancel_tasks.values().any(|row| row.task_id == task_id) {
            return Ok(false);
        }
        let id = state.next_id();
        state.cancel_tasks.insert(
            id,
            CancelTask {
                id,
                task_id,
                put_time: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn find_all(&self) -> Result<Vec<CancelTask>> {
        Ok(self.lock().cancel_tasks.values().cloned().collect())
    }

    async fn delete_by_task_id(&self, task_id: TaskId) -> Result<()> {
        self.lock().cancel_tasks.retain(|_, row| row.task_id != task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Stores;
    use std::collections::HashSet;

    fn new_planned(database: &str) -> NewPlannedTask {
        NewPlannedTask {
            database_settings_name: database.to_string(),
            storage_settings_names: vec!["local".to_string()],
            processors: vec![],
            interval_seconds: 60,
            last_started_at: Utc::now() - chrono::Duration::seconds(120),
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_disjoint() -> anyhow::Result<()> {
        let stores = Stores::in_memory();
        for i in 0..10 {
            stores.planned_tasks.add(new_planned(&format!("db{}", i))).await?;
        }

        let first = stores.planned_tasks.claim(PlannedTaskFilter::Due, 6).await?;
        let second = stores.planned_tasks.claim(PlannedTaskFilter::Due, 6).await?;

        let a: HashSet<i64> = first.rows().iter().map(|row| row.id).collect();
        let b: HashSet<i64> = second.rows().iter().map(|row| row.id).collect();
        assert_eq!(a.len(), 6);
        assert_eq!(b.len(), 4);
        assert!(a.is_disjoint(&b));
        assert_eq!(a.union(&b).count(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_claim_releases_rows() -> anyhow::Result<()> {
        let stores = Stores::in_memory();
        stores.planned_tasks.add(new_planned("db")).await?;

        let claim = stores.planned_tasks.claim(PlannedTaskFilter::Due, 10).await?;
        assert_eq!(claim.rows().len(), 1);
        assert!(
            stores
                .planned_tasks
                .claim(PlannedTaskFilter::Due, 10)
                .await?
                .rows()
                .is_empty()
        );
        drop(claim);

        let again = stores.planned_tasks.claim(PlannedTaskFilter::Due, 10).await?;
        assert_eq!(again.rows().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_updates_are_visible_after_commit() -> anyhow::Result<()> {
        let stores = Stores::in_memory();
        let planned = stores.planned_tasks.add(new_planned("db")).await?;

        let mut claim = stores.planned_tasks.claim(PlannedTaskFilter::Due, 10).await?;
        claim.set_executing_tasks(planned.id, &[7, 8]).await?;
        claim
            .update_state(planned.id, PlannedTaskState::Executing)
            .await?;
        claim.commit().await?;

        let stored = stores
            .planned_tasks
            .find_by_id(planned.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("planned task vanished"))?;
        assert_eq!(stored.state, PlannedTaskState::Executing);
        assert_eq!(stored.executing_tasks, vec![7, 8]);

        let executing = stores
            .planned_tasks
            .claim(PlannedTaskFilter::Executing, 10)
            .await?;
        assert_eq!(executing.rows().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_uncommitted_planned_claim_is_rolled_back() -> anyhow::Result<()> {
        let stores = Stores::in_memory();
        let planned = stores.planned_tasks.add(new_planned("db")).await?;

        let mut claim = stores.planned_tasks.claim(PlannedTaskFilter::Due, 10).await?;
        claim
            .update_state(planned.id, PlannedTaskState::Executing)
            .await?;
        claim.set_executing_tasks(planned.id, &[3]).await?;
        drop(claim);

        let stored = stores
            .planned_tasks
            .find_by_id(planned.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("planned task vanished"))?;
        assert_eq!(stored.state, PlannedTaskState::Waiting);
        assert!(stored.executing_tasks.is_empty());
        assert_eq!(
            stores
                .planned_tasks
                .claim(PlannedTaskFilter::Due, 10)
                .await?
                .rows()
                .len(),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_uncommitted_error_claim_leaves_row_unhandled() -> anyhow::Result<()> {
        let stores = Stores::in_memory();
        stores.error_tasks.add(7).await?;

        let mut claim = stores.error_tasks.claim_unhandled(10).await?;
        claim.mark_handled(7).await?;
        drop(claim);

        let stored = stores
            .error_tasks
            .find_by_task_id(7)
            .await?
            .ok_or_else(|| anyhow::anyhow!("error task vanished"))?;
        assert!(!stored.error_handled);
        assert_eq!(stores.error_tasks.claim_unhandled(10).await?.rows().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_error_task_insert_is_idempotent() -> anyhow::Result<()> {
        let stores = Stores::in_memory();
        assert!(stores.error_tasks.add(42).await?);
        assert!(!stores.error_tasks.add(42).await?);

        let mut claim = stores.error_tasks.claim_unhandled(10).await?;
        assert_eq!(claim.rows().len(), 1);
        claim.mark_handled(42).await?;
        claim.commit().await?;

        assert!(stores.error_tasks.claim_unhandled(10).await?.rows().is_empty());
        Ok(())
    }
}
