// dbvault/src/storage/mod.rs
pub mod local;
pub mod s3;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::entities::{BackupProperties, SettingsCatalog, StorageSettings, StorageType, TaskId};
use crate::errors::{AppError, Result};
use crate::stream::BackupStream;

pub use local::LocalFileSystemStorage;
pub use s3::S3Storage;

/// A place backups are kept. Implementations receive the settings of the
/// storage entry they are asked to use.
#[async_trait]
pub trait Storage: Send + Sync {
    fn storage_type(&self) -> StorageType;

    async fn upload(
        &self,
        backup: BackupStream,
        settings: &StorageSettings,
        backup_name: &str,
        task_id: TaskId,
    ) -> Result<()>;

    /// `None` when no backup with this name exists.
    async fn download(
        &self,
        settings: &StorageSettings,
        backup_name: &str,
        task_id: TaskId,
    ) -> Result<Option<BackupStream>>;

    /// Deleting a backup that does not exist succeeds.
    async fn delete(&self, settings: &StorageSettings, backup_name: &str, task_id: TaskId)
    -> Result<()>;
}

/// Routes backup transfers to the storage backend behind a settings name.
pub struct BackupLoadManager {
    catalog: Arc<SettingsCatalog>,
    storages: HashMap<StorageType, Arc<dyn Storage>>,
}

impl BackupLoadManager {
    pub fn new(catalog: Arc<SettingsCatalog>) -> Self {
        BackupLoadManager {
            catalog,
            storages: HashMap::new(),
        }
        .with_storage(Arc::new(LocalFileSystemStorage::default()))
        .with_storage(Arc::new(S3Storage::default()))
    }

    /// Registers `storage` for its type, replacing any earlier backend.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storages.insert(storage.storage_type(), storage);
        self
    }

    fn resolve(&self, storage_settings_name: &str) -> Result<(&StorageSettings, &Arc<dyn Storage>)> {
        let settings = self.catalog.storage(storage_settings_name)?;
        let storage = self.storages.get(&settings.storage_type()).ok_or_else(|| {
            AppError::Storage(format!(
                "no backend registered for storage type {}",
                settings.storage_type().as_str()
            ))
        })?;
        Ok((settings, storage))
    }

    pub async fn upload_backup(
        &self,
        backup: BackupStream,
        properties: &BackupProperties,
        task_id: TaskId,
    ) -> Result<()> {
        let (settings, storage) = self.resolve(&properties.storage_settings_name)?;
        info!(
            task_id,
            backup = %properties.backup_name,
            storage = %settings.name,
            "Uploading backup"
        );
        storage
            .upload(backup, settings, &properties.backup_name, task_id)
            .await
    }

    pub async fn download_backup(
        &self,
        backup_name: &str,
        storage_settings_name: &str,
        task_id: TaskId,
    ) -> Result<Option<BackupStream>> {
        let (settings, storage) = self.resolve(storage_settings_name)?;
        info!(task_id, backup = %backup_name, storage = %settings.name, "Downloading backup");
        storage.download(settings, backup_name, task_id).await
    }

    pub async fn delete_backup(&self, properties: &BackupProperties, task_id: TaskId) -> Result<()> {
        let (settings, storage) = self.resolve(&properties.storage_settings_name)?;
        info!(
            task_id,
            backup = %properties.backup_name,
            storage = %settings.name,
            "Deleting backup"
        );
        storage
            .delete(settings, &properties.backup_name, task_id)
            .await
    }
}
