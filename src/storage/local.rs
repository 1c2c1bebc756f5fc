// dbvault/src/storage/local.rs
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use super::Storage;
use crate::entities::{LocalFileSystemSettings, StorageKind, StorageSettings, StorageType, TaskId};
use crate::errors::{AppError, Result};
use crate::stream::BackupStream;

/// Largest part file written for one backup.
pub const DEFAULT_PART_SIZE: u64 = 192 * 1024 * 1024;
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Stores every backup in its own folder, split into numbered part files.
pub struct LocalFileSystemStorage {
    part_size: u64,
}

impl Default for LocalFileSystemStorage {
    fn default() -> Self {
        LocalFileSystemStorage::with_part_size(DEFAULT_PART_SIZE)
    }
}

impl LocalFileSystemStorage {
    pub fn with_part_size(part_size: u64) -> Self {
        LocalFileSystemStorage {
            part_size: part_size.max(1),
        }
    }
}

fn local_settings(settings: &StorageSettings) -> Result<&LocalFileSystemSettings> {
    match &settings.kind {
        StorageKind::LocalFileSystem(local) => Ok(local),
        _ => Err(AppError::Storage(format!(
            "storage '{}' is not a local file system storage",
            settings.name
        ))),
    }
}

fn backup_folder(settings: &LocalFileSystemSettings, backup_name: &str) -> PathBuf {
    settings.backup_path.join(backup_name)
}

fn part_path(folder: &Path, backup_name: &str, part: usize) -> PathBuf {
    folder.join(format!("{}_part{}.dat", backup_name, part))
}

/// Index of a part file of `backup_name`, `None` for any other file.
fn part_index(file_name: &str, backup_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(backup_name)?
        .strip_prefix("_part")?
        .strip_suffix(".dat")?
        .parse()
        .ok()
}

async fn create_part(folder: &Path, backup_name: &str, part: usize) -> Result<fs::File> {
    let path = part_path(folder, backup_name, part);
    fs::File::create(&path).await.map_err(|e| {
        AppError::Storage(format!("failed to create part file {}: {}", path.display(), e))
    })
}

#[async_trait]
impl Storage for LocalFileSystemStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::LocalFileSystem
    }

    async fn upload(
        &self,
        mut backup: BackupStream,
        settings: &StorageSettings,
        backup_name: &str,
        task_id: TaskId,
    ) -> Result<()> {
        let local = local_settings(settings)?;
        fs::create_dir_all(&local.backup_path).await?;
        let folder = backup_folder(local, backup_name);
        fs::create_dir(&folder).await.map_err(|e| {
            AppError::Storage(format!(
                "failed to create backup folder {}: {}",
                folder.display(),
                e
            ))
        })?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut part = 0usize;
        let mut written_in_part = 0u64;
        let mut total = 0u64;
        let mut file = create_part(&folder, backup_name, part).await?;
        loop {
            let read = backup.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            let mut offset = 0usize;
            while offset < read {
                if written_in_part == self.part_size {
                    file.flush().await?;
                    part += 1;
                    written_in_part = 0;
                    file = create_part(&folder, backup_name, part).await?;
                }
                let room = (self.part_size - written_in_part) as usize;
                let chunk = room.min(read - offset);
                file.write_all(&buf[offset..offset + chunk]).await?;
                offset += chunk;
                written_in_part += chunk as u64;
                total += chunk as u64;
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        info!(
            task_id,
            backup = %backup_name,
            bytes = total,
            parts = part + 1,
            folder = %folder.display(),
            "✓ Backup written to local storage"
        );
        Ok(())
    }

    async fn download(
        &self,
        settings: &StorageSettings,
        backup_name: &str,
        task_id: TaskId,
    ) -> Result<Option<BackupStream>> {
        let local = local_settings(settings)?;
        let folder = backup_folder(local, backup_name);
        let mut entries = match fs::read_dir(&folder).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(task_id, folder = %folder.display(), "Backup folder does not exist");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(index) = part_index(&entry.file_name().to_string_lossy(), backup_name) {
                indices.push(index);
            }
        }
        if indices.is_empty() {
            warn!(task_id, folder = %folder.display(), "Backup folder holds no part files");
            return Ok(None);
        }
        indices.sort_unstable();
        // Parts are numbered from zero without gaps.
        if let Some(missing) = indices.iter().enumerate().find(|(i, index)| i != *index) {
            return Err(AppError::Storage(format!(
                "missing part file {}",
                part_path(&folder, backup_name, missing.0).display()
            )));
        }

        let parts = indices.len();
        let mut stream: BackupStream = Box::pin(tokio::io::empty());
        for part in indices {
            let path = part_path(&folder, backup_name, part);
            let file = fs::File::open(&path).await.map_err(|e| {
                AppError::Storage(format!("failed to open part file {}: {}", path.display(), e))
            })?;
            stream = Box::pin(stream.chain(file));
        }
        info!(task_id, backup = %backup_name, parts, "Reading backup from local storage");
        Ok(Some(stream))
    }

    async fn delete(
        &self,
        settings: &StorageSettings,
        backup_name: &str,
        task_id: TaskId,
    ) -> Result<()> {
        let local = local_settings(settings)?;
        let folder = backup_folder(local, backup_name);
        match fs::remove_dir_all(&folder).await {
            Ok(()) => {
                info!(task_id, folder = %folder.display(), "✓ Backup deleted from local storage");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(task_id, folder = %folder.display(), "Backup already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(path: &Path) -> StorageSettings {
        StorageSettings {
            name: "local".to_string(),
            kind: StorageKind::LocalFileSystem(LocalFileSystemSettings {
                backup_path: path.to_path_buf(),
            }),
        }
    }

    async fn read_all(mut stream: BackupStream) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_upload_splits_into_parts_and_download_joins_them() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let storage = LocalFileSystemStorage::with_part_size(1000);
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();

        storage
            .upload(Box::pin(std::io::Cursor::new(data.clone())), &settings, "backup_a", 1)
            .await?;

        let folder = dir.path().join("backup_a");
        assert!(folder.join("backup_a_part0.dat").exists());
        assert!(folder.join("backup_a_part2.dat").exists());
        assert!(!folder.join("backup_a_part3.dat").exists());
        assert_eq!(std::fs::metadata(folder.join("backup_a_part2.dat"))?.len(), 500);

        let downloaded = storage
            .download(&settings, "backup_a", 2)
            .await?
            .ok_or_else(|| anyhow::anyhow!("backup missing"))?;
        assert_eq!(read_all(downloaded).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_backup_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let storage = LocalFileSystemStorage::default();

        storage
            .upload(Box::pin(tokio::io::empty()), &settings, "backup_empty", 1)
            .await?;
        let downloaded = storage
            .download(&settings, "backup_empty", 1)
            .await?
            .ok_or_else(|| anyhow::anyhow!("backup missing"))?;
        assert!(read_all(downloaded).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_backup_downloads_as_none() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalFileSystemStorage::default();
        assert!(storage.download(&settings(dir.path()), "nope", 1).await?.is_none());
        Ok(())
    }

    #[test]
    fn test_part_index_only_matches_own_parts() {
        assert_eq!(part_index("backup_a_part0.dat", "backup_a"), Some(0));
        assert_eq!(part_index("backup_a_part12.dat", "backup_a"), Some(12));
        assert_eq!(part_index("notes.dat", "backup_a"), None);
        assert_eq!(part_index("backup_a_partx.dat", "backup_a"), None);
        assert_eq!(part_index("backup_ab_part0.dat", "backup_a"), None);
    }

    #[tokio::test]
    async fn test_download_orders_parts_and_ignores_other_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let storage = LocalFileSystemStorage::with_part_size(4);
        let data = b"0123456789abcdefghijklmnopqrstuvwxyz0123456789".to_vec();
        storage
            .upload(Box::pin(std::io::Cursor::new(data.clone())), &settings, "backup_d", 1)
            .await?;
        std::fs::write(dir.path().join("backup_d").join("stray.dat"), b"junk")?;

        let downloaded = storage
            .download(&settings, "backup_d", 1)
            .await?
            .ok_or_else(|| anyhow::anyhow!("backup missing"))?;
        assert_eq!(read_all(downloaded).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_folder_without_parts_downloads_as_none() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("backup_e"))?;
        std::fs::write(dir.path().join("backup_e").join("stray.dat"), b"junk")?;

        let storage = LocalFileSystemStorage::default();
        assert!(storage.download(&settings(dir.path()), "backup_e", 1).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_gap_in_parts_is_a_storage_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let folder = dir.path().join("backup_f");
        std::fs::create_dir(&folder)?;
        std::fs::write(folder.join("backup_f_part0.dat"), b"a")?;
        std::fs::write(folder.join("backup_f_part2.dat"), b"c")?;

        let storage = LocalFileSystemStorage::default();
        let result = storage.download(&settings(dir.path()), "backup_f", 1).await;
        assert!(matches!(result, Err(AppError::Storage(message)) if message.contains("backup_f_part1.dat")));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_twice_succeeds() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let storage = LocalFileSystemStorage::default();
        storage
            .upload(Box::pin(std::io::Cursor::new(b"data".to_vec())), &settings, "backup_b", 1)
            .await?;

        storage.delete(&settings, "backup_b", 1).await?;
        storage.delete(&settings, "backup_b", 1).await?;
        assert!(!dir.path().join("backup_b").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_uploading_same_name_twice_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let storage = LocalFileSystemStorage::default();
        storage
            .upload(Box::pin(std::io::Cursor::new(b"one".to_vec())), &settings, "backup_c", 1)
            .await?;
        let second = storage
            .upload(Box::pin(std::io::Cursor::new(b"two".to_vec())), &settings, "backup_c", 2)
            .await;
        assert!(matches!(second, Err(AppError::Storage(_))));
        Ok(())
    }
}
