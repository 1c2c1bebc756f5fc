// dbvault/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::operation::get_object::GetObjectError;
use s3::primitives::ByteStream;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::Storage;
use crate::entities::{S3Settings, StorageKind, StorageSettings, StorageType, TaskId};
use crate::errors::{AppError, Result};
use crate::stream::BackupStream;

/// S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO). One object
/// per backup.
#[derive(Default)]
pub struct S3Storage;

fn s3_settings(settings: &StorageSettings) -> Result<&S3Settings> {
    match &settings.kind {
        StorageKind::S3(s3) => Ok(s3),
        _ => Err(AppError::Storage(format!(
            "storage '{}' is not an S3 storage",
            settings.name
        ))),
    }
}

async fn client(settings: &S3Settings) -> s3::Client {
    let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
        .endpoint_url(&settings.endpoint_url)
        .region(Region::new(settings.region.clone()))
        .credentials_provider(s3::config::Credentials::new(
            &settings.access_key_id,
            &settings.secret_access_key,
            None, // session_token
            None, // expiry
            "Static", // provider_name
        ))
        .load()
        .await;
    s3::Client::new(&sdk_config)
}

/// Copies the backup into a temporary file. `put_object` needs a sized body.
async fn spool(backup: &mut BackupStream) -> Result<(NamedTempFile, u64)> {
    let spool = tempfile::Builder::new()
        .prefix("dbvault_upload_")
        .tempfile()?;
    let mut file = tokio::fs::File::from_std(spool.reopen()?);
    let bytes = tokio::io::copy(backup, &mut file).await?;
    file.flush().await?;
    Ok((spool, bytes))
}

/// A missing key means there is no such backup; anything else is a failure.
fn missing_object<T>(error: GetObjectError, bucket: &str, key: &str) -> Result<Option<T>> {
    if error.is_no_such_key() {
        return Ok(None);
    }
    Err(AppError::Storage(format!(
        "failed to get object s3://{}/{}: {}",
        bucket, key, error
    )))
}

#[async_trait]
impl Storage for S3Storage {
    fn storage_type(&self) -> StorageType {
        StorageType::S3
    }

    async fn upload(
        &self,
        mut backup: BackupStream,
        settings: &StorageSettings,
        backup_name: &str,
        task_id: TaskId,
    ) -> Result<()> {
        let s3_settings = s3_settings(settings)?;
        let key = s3_settings.object_key(backup_name);

        let (spool, bytes) = spool(&mut backup).await?;
        let body = ByteStream::from_path(spool.path()).await.map_err(|e| {
            AppError::Storage(format!(
                "failed to read spooled backup {}: {}",
                spool.path().display(),
                e
            ))
        })?;
        client(s3_settings)
            .await
            .put_object()
            .bucket(&s3_settings.bucket_name)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "failed to upload s3://{}/{}: {}",
                    s3_settings.bucket_name, key, e
                ))
            })?;

        info!(
            task_id,
            bucket = %s3_settings.bucket_name,
            key = %key,
            bytes,
            "✅ Backup uploaded to S3"
        );
        Ok(())
    }

    async fn download(
        &self,
        settings: &StorageSettings,
        backup_name: &str,
        task_id: TaskId,
    ) -> Result<Option<BackupStream>> {
        let s3_settings = s3_settings(settings)?;
        let key = s3_settings.object_key(backup_name);

        let object = match client(s3_settings)
            .await
            .get_object()
            .bucket(&s3_settings.bucket_name)
            .key(&key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(e) => {
                let missing = missing_object(e.into_service_error(), &s3_settings.bucket_name, &key);
                if matches!(missing, Ok(None)) {
                    info!(task_id, key = %key, "Backup object does not exist");
                }
                return missing;
            }
        };

        info!(task_id, bucket = %s3_settings.bucket_name, key = %key, "Streaming backup from S3");
        Ok(Some(Box::pin(object.body.into_async_read())))
    }

    async fn delete(
        &self,
        settings: &StorageSettings,
        backup_name: &str,
        task_id: TaskId,
    ) -> Result<()> {
        let s3_settings = s3_settings(settings)?;
        let key = s3_settings.object_key(backup_name);

        // DeleteObject succeeds for keys that do not exist.
        client(s3_settings)
            .await
            .delete_object()
            .bucket(&s3_settings.bucket_name)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "failed to delete s3://{}/{}: {}",
                    s3_settings.bucket_name, key, e
                ))
            })?;
        info!(task_id, bucket = %s3_settings.bucket_name, key = %key, "✓ Backup deleted from S3");
        Ok(())
    }
}
