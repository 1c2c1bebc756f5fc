// dbvault/src/entities/mod.rs
pub mod backup_properties;
pub mod planned_task;
pub mod queue;
pub mod settings;
pub mod task;

pub use backup_properties::{BackupProperties, NewBackupProperties, backup_name};
pub use planned_task::{NewPlannedTask, PlannedTask, PlannedTaskFilter, PlannedTaskState};
pub use queue::{CancelTask, ErrorTask};
pub use settings::{
    DatabaseSettings, LocalFileSystemSettings, S3Settings, SettingsCatalog, StorageKind,
    StorageSettings, StorageType,
};
pub use task::{RunType, Task, TaskId, TaskState, TaskType};
