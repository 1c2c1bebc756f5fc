//! S3 storage against a real bucket.
//!
//! Run with `TEST_S3_ENDPOINT=... TEST_S3_BUCKET=... TEST_S3_ACCESS_KEY_ID=...
//! TEST_S3_SECRET_ACCESS_KEY=... cargo test -- --ignored`. `TEST_S3_REGION`
//! defaults to `us-east-1`.

use chrono::Utc;
use tokio::io::AsyncReadExt;

use dbvault::entities::{S3Settings, StorageKind, StorageSettings};
use dbvault::storage::{S3Storage, Storage};
use dbvault::stream::BackupStream;

fn settings() -> Option<StorageSettings> {
    let var = |name: &str| std::env::var(name).ok();
    let (Some(endpoint_url), Some(bucket_name), Some(access_key_id), Some(secret_access_key)) = (
        var("TEST_S3_ENDPOINT"),
        var("TEST_S3_BUCKET"),
        var("TEST_S3_ACCESS_KEY_ID"),
        var("TEST_S3_SECRET_ACCESS_KEY"),
    ) else {
        eprintln!("TEST_S3_* not set, skipping");
        return None;
    };
    Some(StorageSettings {
        name: "s3".to_string(),
        kind: StorageKind::S3(S3Settings {
            bucket_name,
            region: var("TEST_S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            endpoint_url,
            access_key_id,
            secret_access_key,
            folder_prefix: Some("dbvault-tests".to_string()),
        }),
    })
}

#[tokio::test]
#[ignore = "needs TEST_S3_* credentials"]
async fn test_upload_download_delete_round_trip() -> anyhow::Result<()> {
    let Some(settings) = settings() else {
        return Ok(());
    };
    let storage = S3Storage;
    let backup_name = format!("round_trip_{}", Utc::now().timestamp_micros());
    let content: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 241) as u8).collect();

    let upload: BackupStream = Box::pin(std::io::Cursor::new(content.clone()));
    storage.upload(upload, &settings, &backup_name, 1).await?;

    let mut downloaded = storage
        .download(&settings, &backup_name, 1)
        .await?
        .ok_or_else(|| anyhow::anyhow!("uploaded backup is missing"))?;
    let mut read_back = Vec::new();
    downloaded.read_to_end(&mut read_back).await?;
    assert_eq!(read_back, content);

    storage.delete(&settings, &backup_name, 1).await?;
    storage.delete(&settings, &backup_name, 1).await?;
    assert!(storage.download(&settings, &backup_name, 1).await?.is_none());
    Ok(())
}

#[tokio::test]
#[ignore = "needs TEST_S3_* credentials"]
async fn test_missing_backup_downloads_as_none() -> anyhow::Result<()> {
    let Some(settings) = settings() else {
        return Ok(());
    };
    let backup_name = format!("never_uploaded_{}", Utc::now().timestamp_micros());
    assert!(S3Storage.download(&settings, &backup_name, 1).await?.is_none());
    Ok(())
}
