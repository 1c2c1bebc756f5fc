// dbvault/src/backup/mod.rs
pub mod drain;
pub mod postgres;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::warn;

use crate::entities::{DatabaseSettings, TaskId};
use crate::errors::Result;
use crate::stream::BackupStream;

pub use postgres::PostgresDatabaseBackup;

/// Drives the external dump and restore tools of one database engine.
#[async_trait]
pub trait DatabaseBackup: Send + Sync {
    /// Starts a dump. Returns `None` when `cancel` fired before the tool was
    /// started. Faults after the start are reported through the error
    /// callback by the handle's auxiliary tasks.
    async fn create_backup(
        &self,
        settings: &DatabaseSettings,
        task_id: TaskId,
        cancel: &CancellationToken,
    ) -> Result<Option<DumpHandle>>;

    /// Feeds `backup` into the restore tool and waits for it to finish.
    async fn restore_backup(
        &self,
        backup: BackupStream,
        settings: &DatabaseSettings,
        task_id: TaskId,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// A running dump: its output stream plus the tasks watching the process.
pub struct DumpHandle {
    stream: BackupStream,
    supervisor: DumpSupervisor,
}

impl DumpHandle {
    pub fn new(stream: BackupStream, supervisor: DumpSupervisor) -> Self {
        DumpHandle { stream, supervisor }
    }

    pub fn into_parts(self) -> (BackupStream, DumpSupervisor) {
        (self.stream, self.supervisor)
    }
}

/// Auxiliary tasks of a dump. Dropping the supervisor before `finish` stops
/// the dump.
pub struct DumpSupervisor {
    tasks: Vec<JoinHandle<()>>,
    _stop: DropGuard,
}

impl DumpSupervisor {
    /// `stop` is cancelled when the supervisor goes away; the auxiliary tasks
    /// watch it to kill a tool nobody reads from anymore.
    pub fn new(tasks: Vec<JoinHandle<()>>, stop: CancellationToken) -> Self {
        DumpSupervisor {
            tasks,
            _stop: stop.drop_guard(),
        }
    }

    /// Waits for every auxiliary task, so any fault they report is recorded
    /// before the caller moves on.
    pub async fn finish(mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Backup auxiliary task ended abnormally");
            }
        }
    }
}
