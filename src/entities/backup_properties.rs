// dbvault/src/entities/backup_properties.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable description of one stored backup: where it lives and how it was
/// transformed on the way there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupProperties {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub backup_name: String,
    pub processors: Vec<String>,
    pub storage_settings_name: String,
}

#[derive(Debug, Clone)]
pub struct NewBackupProperties {
    pub created_at: DateTime<Utc>,
    pub backup_name: String,
    pub processors: Vec<String>,
    pub storage_settings_name: String,
}

/// `backup_<database>_<dd-MM-yyyy_HH-mm-ss-SSS>`
pub fn backup_name(database_name: &str, date: DateTime<Utc>) -> String {
    format!(
        "backup_{}_{}",
        database_name,
        date.format("%d-%m-%Y_%H-%M-%S-%3f")
    )
}
