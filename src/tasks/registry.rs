// dbvault/src/tasks/registry.rs
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::entities::TaskId;
use crate::errors::{AppError, Result};

/// Cancellation handle of one running workflow.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: TaskId,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Requests cancellation. Returns `false` when it had already been
    /// requested.
    pub fn cancel(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Live workflows keyed by task id. At most one handle per task.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: DashMap<TaskId, TaskHandle>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh handle for `task_id`. The entry lives as long as the
    /// returned guard.
    pub fn register(self: &Arc<Self>, task_id: TaskId) -> Result<(TaskHandle, RegistrationGuard)> {
        match self.handles.entry(task_id) {
            Entry::Occupied(_) => Err(AppError::AlreadyRunning(task_id)),
            Entry::Vacant(vacant) => {
                let handle = TaskHandle {
                    task_id,
                    token: CancellationToken::new(),
                };
                vacant.insert(handle.clone());
                debug!(task_id, "Registered task handle");
                Ok((
                    handle,
                    RegistrationGuard {
                        registry: Arc::clone(self),
                        task_id,
                    },
                ))
            }
        }
    }

    pub fn get(&self, task_id: TaskId) -> Option<TaskHandle> {
        self.handles.get(&task_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.handles.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Removes the handle from the registry when dropped.
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: Arc<HandleRegistry>,
    task_id: TaskId,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.handles.remove(&self.task_id);
        debug!(task_id = self.task_id, "Removed task handle");
    }
}
