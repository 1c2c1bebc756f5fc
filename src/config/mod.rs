// dbvault/src/config/mod.rs
use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::entities::{
    DatabaseSettings, LocalFileSystemSettings, S3Settings, SettingsCatalog, StorageKind,
    StorageSettings, StorageType,
};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 8;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonToolsConfig {
    pub pg_dump_path: Option<PathBuf>,
    pub psql_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonWorkersConfig {
    pub max_concurrent_tasks: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonWatchersConfig {
    pub batch_size: Option<i64>,
    pub cancel_timeout_secs: Option<u64>,
    pub planned_interval_secs: Option<u64>,
    pub executing_interval_secs: Option<u64>,
    pub error_interval_secs: Option<u64>,
    pub cancel_interval_secs: Option<u64>,
}

/// A database entry: either `url` or the explicit connection fields.
#[derive(Clone, Deserialize)]
pub struct JsonDatabaseConfig {
    pub name: Option<String>,
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Deserialize)]
pub struct JsonStorageConfig {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub storage_type: Option<StorageType>,
    pub backup_path: Option<PathBuf>,
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub metadata_database_url: Option<String>,
    pub tools: Option<JsonToolsConfig>,
    pub workers: Option<JsonWorkersConfig>,
    pub watchers: Option<JsonWatchersConfig>,
    pub databases: Option<Vec<JsonDatabaseConfig>>,
    pub storages: Option<Vec<JsonStorageConfig>>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, Default)]
pub struct ToolsConfig {
    /// Looked up on `PATH` when unset.
    pub pg_dump_path: Option<PathBuf>,
    pub psql_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchersConfig {
    pub batch_size: i64,
    pub cancel_timeout: Duration,
    pub planned_interval: Duration,
    pub executing_interval: Duration,
    pub error_interval: Duration,
    pub cancel_interval: Duration,
}

impl Default for WatchersConfig {
    fn default() -> Self {
        WatchersConfig {
            batch_size: 10,
            cancel_timeout: Duration::from_secs(10 * 60),
            planned_interval: Duration::from_secs(60),
            executing_interval: Duration::from_secs(30),
            error_interval: Duration::from_secs(60),
            cancel_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub metadata_database_url: String,
    pub tools: ToolsConfig,
    pub max_concurrent_tasks: usize,
    pub watchers: WatchersConfig,
    pub catalog: SettingsCatalog,
}

impl AppConfig {
    /// Reads `config_path`; a `DATABASE_URL` environment variable overrides
    /// `metadata_database_url`.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        let database_url_override = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        Self::from_raw(raw_json_config, database_url_override)
    }

    pub fn from_raw(raw: RawJsonConfig, database_url_override: Option<String>) -> Result<Self> {
        let metadata_database_url = database_url_override
            .or(raw.metadata_database_url)
            .filter(|url| !url.trim().is_empty())
            .context("metadata_database_url must be set in config.json or DATABASE_URL")?;

        let tools = raw
            .tools
            .map(|t| ToolsConfig {
                pg_dump_path: t.pg_dump_path.filter(|p| !p.as_os_str().is_empty()),
                psql_path: t.psql_path.filter(|p| !p.as_os_str().is_empty()),
            })
            .unwrap_or_default();

        let max_concurrent_tasks = raw
            .workers
            .and_then(|w| w.max_concurrent_tasks)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_TASKS);
        if max_concurrent_tasks == 0 {
            bail!("workers.max_concurrent_tasks must be at least 1");
        }

        let watchers = parse_watchers(raw.watchers.unwrap_or_default())?;

        let databases = raw
            .databases
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, db)| parse_database(index, db))
            .collect::<Result<Vec<_>>>()?;
        let storages = raw
            .storages
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, storage)| parse_storage(index, storage))
            .collect::<Result<Vec<_>>>()?;
        let catalog = SettingsCatalog::new(databases, storages)
            .context("Invalid databases/storages in config.json")?;

        Ok(AppConfig {
            metadata_database_url,
            tools,
            max_concurrent_tasks,
            watchers,
            catalog,
        })
    }
}

fn parse_watchers(raw: JsonWatchersConfig) -> Result<WatchersConfig> {
    let defaults = WatchersConfig::default();
    let batch_size = raw.batch_size.unwrap_or(defaults.batch_size);
    if batch_size <= 0 {
        bail!("watchers.batch_size must be positive");
    }
    let interval = |secs: Option<u64>, default: Duration, field: &str| -> Result<Duration> {
        match secs {
            Some(0) => Err(anyhow!("watchers.{} must be positive", field)),
            Some(secs) => Ok(Duration::from_secs(secs)),
            None => Ok(default),
        }
    };
    Ok(WatchersConfig {
        batch_size,
        cancel_timeout: raw
            .cancel_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.cancel_timeout),
        planned_interval: interval(
            raw.planned_interval_secs,
            defaults.planned_interval,
            "planned_interval_secs",
        )?,
        executing_interval: interval(
            raw.executing_interval_secs,
            defaults.executing_interval,
            "executing_interval_secs",
        )?,
        error_interval: interval(
            raw.error_interval_secs,
            defaults.error_interval,
            "error_interval_secs",
        )?,
        cancel_interval: interval(
            raw.cancel_interval_secs,
            defaults.cancel_interval,
            "cancel_interval_secs",
        )?,
    })
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    value
        .filter(|s| !s.trim().is_empty())
        .with_context(|| format!("{} must be set and non-empty", what))
}

fn parse_database(index: usize, raw: JsonDatabaseConfig) -> Result<DatabaseSettings> {
    let name = required(raw.name, &format!("databases[{}].name", index))?;
    if let Some(url) = raw.url.filter(|u| !u.trim().is_empty()) {
        return DatabaseSettings::from_url(&name, &url)
            .with_context(|| format!("Invalid url for database '{}'", name));
    }
    Ok(DatabaseSettings {
        host: required(raw.host, &format!("databases '{}' host", name))?,
        port: raw.port.unwrap_or(5432),
        database: required(raw.database, &format!("databases '{}' database", name))?,
        login: required(raw.login, &format!("databases '{}' login", name))?,
        password: raw.password.unwrap_or_default(),
        name,
    })
}

fn parse_storage(index: usize, raw: JsonStorageConfig) -> Result<StorageSettings> {
    let name = required(raw.name, &format!("storages[{}].name", index))?;
    let storage_type = raw
        .storage_type
        .with_context(|| format!("storage '{}' needs a type", name))?;
    let kind = match storage_type {
        StorageType::LocalFileSystem => {
            let backup_path = raw
                .backup_path
                .filter(|p| !p.as_os_str().is_empty())
                .with_context(|| format!("storage '{}' needs backup_path", name))?;
            StorageKind::LocalFileSystem(LocalFileSystemSettings { backup_path })
        }
        StorageType::S3 => StorageKind::S3(S3Settings {
            bucket_name: required(raw.bucket_name, &format!("storage '{}' bucket_name", name))?,
            region: required(raw.region, &format!("storage '{}' region", name))?,
            endpoint_url: required(raw.endpoint_url, &format!("storage '{}' endpoint_url", name))?,
            access_key_id: required(
                raw.access_key_id,
                &format!("storage '{}' access_key_id", name),
            )?,
            secret_access_key: required(
                raw.secret_access_key,
                &format!("storage '{}' secret_access_key", name),
            )?,
            folder_prefix: raw.folder_prefix.filter(|s| !s.is_empty()),
        }),
    };
    Ok(StorageSettings { name, kind })
}
