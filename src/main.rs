//! dbvault command line
//!
//! Runs the backup server (`serve`) or a single backup, restore, delete,
//! plan or cancel operation.

// dbvault/src/main.rs
use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dbvault::backup::PostgresDatabaseBackup;
use dbvault::config::{AppConfig, DEFAULT_CONFIG_PATH};
use dbvault::entities::{NewPlannedTask, RunType, SettingsCatalog, TaskId, TaskState, TaskType};
use dbvault::processor::BackupProcessorManager;
use dbvault::storage::BackupLoadManager;
use dbvault::store::{PgStore, Stores};
use dbvault::tasks::{ErrorCallback, HandleRegistry, TaskOrchestrator, TasksManager, WorkflowHandle};
use dbvault::telemetry;
use dbvault::watchers::{self, CancelTasksWatcher, ErrorTasksWatcher, PlannedTasksWatcher};

/// Connections kept for watchers on top of one per worker.
const EXTRA_POOL_CONNECTIONS: u32 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    telemetry::init_telemetry();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

/// Everything a command needs, wired against the metadata database.
struct App {
    config: AppConfig,
    stores: Stores,
    catalog: Arc<SettingsCatalog>,
    error_callback: Arc<ErrorCallback>,
    orchestrator: TaskOrchestrator,
}

async fn run_app() -> Result<()> {
    let config_path = env::var("DBVAULT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    let args: Vec<String> = env::args().skip(1).collect();
    let args = if args.is_empty() { prompt_command()? } else { args };
    let Some((command, rest)) = args.split_first() else {
        bail!("No command given");
    };

    let app = build_app(config).await?;
    match command.as_str() {
        "1" | "serve" => serve(&app).await.context("Server failed"),
        "2" | "backup" => {
            let [database, storages, processors @ ..] = rest else {
                bail!("usage: backup <database> <storage>[,<storage>...] [processor,...]");
            };
            backup(&app, database, &split_list(storages), optional_list(processors))
                .await
                .context("Backup process failed")
        }
        "3" | "restore" => {
            let [properties_id, database] = rest else {
                bail!("usage: restore <backup-properties-id> <database>");
            };
            restore(&app, parse_id(properties_id)?, database)
                .await
                .context("Restore process failed")
        }
        "4" | "delete" => {
            let [properties_id] = rest else {
                bail!("usage: delete <backup-properties-id>");
            };
            delete(&app, parse_id(properties_id)?)
                .await
                .context("Delete process failed")
        }
        "5" | "plan" => {
            let [database, storages, interval, processors @ ..] = rest else {
                bail!("usage: plan <database> <storage>[,...] <interval-secs> [processor,...]");
            };
            let interval_seconds: i64 = interval
                .parse()
                .with_context(|| format!("Invalid interval '{}'", interval))?;
            plan(
                &app,
                database,
                split_list(storages),
                interval_seconds,
                optional_list(processors),
            )
            .await
            .context("Failed to plan backup task")
        }
        "6" | "cancel" => {
            let [task_id] = rest else {
                bail!("usage: cancel <task-id>");
            };
            cancel(&app, parse_id(task_id)?).await.context("Failed to request cancellation")
        }
        other => {
            println!("❌ Invalid choice '{}'. Run without arguments to see the commands.", other);
            bail!("Invalid operation choice");
        }
    }
}

async fn build_app(config: AppConfig) -> Result<App> {
    let pool_size = u32::try_from(config.max_concurrent_tasks)
        .unwrap_or(u32::MAX)
        .saturating_add(EXTRA_POOL_CONNECTIONS);
    let store = PgStore::connect(&config.metadata_database_url, pool_size)
        .await
        .context("Failed to connect to the metadata database")?;
    store
        .migrate()
        .await
        .context("Failed to migrate the metadata database")?;
    let stores = Stores::postgres(store);

    let registry = Arc::new(HandleRegistry::new());
    let error_callback = Arc::new(ErrorCallback::new(
        registry.clone(),
        stores.tasks.clone(),
        stores.error_tasks.clone(),
    ));
    let database_backup = PostgresDatabaseBackup::locate(
        config.tools.pg_dump_path.clone(),
        config.tools.psql_path.clone(),
        error_callback.clone(),
    )
    .context("PostgreSQL client tools not found")?;

    let catalog = Arc::new(config.catalog.clone());
    let tasks = Arc::new(TasksManager::new(
        stores.tasks.clone(),
        stores.backup_properties.clone(),
    ));
    let orchestrator = TaskOrchestrator::new(
        registry,
        tasks,
        Arc::new(database_backup),
        Arc::new(BackupProcessorManager::with_defaults()),
        Arc::new(BackupLoadManager::new(catalog.clone())),
        error_callback.clone(),
        config.max_concurrent_tasks,
    );

    Ok(App {
        config,
        stores,
        catalog,
        error_callback,
        orchestrator,
    })
}

async fn serve(app: &App) -> Result<()> {
    println!("🚀 Starting backup server...");
    let watchers_config = &app.config.watchers;
    let shutdown = CancellationToken::new();
    let handles = watchers::spawn_watchers(
        watchers_config,
        Arc::new(PlannedTasksWatcher::new(
            app.stores.planned_tasks.clone(),
            app.orchestrator.clone(),
            app.catalog.clone(),
            app.error_callback.clone(),
            watchers_config.batch_size,
        )),
        Arc::new(ErrorTasksWatcher::new(
            app.stores.error_tasks.clone(),
            app.orchestrator.clone(),
            watchers_config.batch_size,
        )),
        Arc::new(CancelTasksWatcher::new(
            app.stores.cancel_tasks.clone(),
            app.orchestrator.clone(),
            watchers_config.cancel_timeout,
        )),
        &shutdown,
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, stopping watchers");
    shutdown.cancel();
    for handle in handles {
        handle.await.context("Watcher task panicked")?;
    }
    Ok(())
}

async fn backup(
    app: &App,
    database_name: &str,
    storages: &[String],
    processors: Vec<String>,
) -> Result<()> {
    if storages.is_empty() {
        bail!("At least one storage is required");
    }
    let database = app.catalog.database(database_name)?.clone();
    for storage in storages {
        app.catalog.storage(storage)?;
    }
    app.orchestrator.processors().validate(&processors)?;

    println!("🚀 Starting Backup Process...");
    let tasks = app.orchestrator.tasks();
    let mut workflows = Vec::with_capacity(storages.len());
    for storage in storages {
        let properties = tasks
            .init_backup_properties(&database.name, storage, processors.clone())
            .await?;
        let task_id = tasks
            .init_task(TaskType::CreateBackup, RunType::User, properties.id)
            .await?;
        println!(
            "Backup '{}' to storage '{}' (backup properties {}, task {})",
            properties.backup_name, storage, properties.id, task_id
        );
        workflows.push(app.orchestrator.start_create(task_id, properties, database.clone())?);
    }
    let task_ids = wait_for(workflows).await;
    report(app, &task_ids).await
}

async fn restore(app: &App, properties_id: i64, database_name: &str) -> Result<()> {
    let database = app.catalog.database(database_name)?.clone();
    let tasks = app.orchestrator.tasks();
    let properties = tasks
        .find_backup_properties(properties_id)
        .await?
        .with_context(|| format!("No backup properties with id {}", properties_id))?;

    println!(
        "🔄 Restoring '{}' from storage '{}' into database '{}'",
        properties.backup_name, properties.storage_settings_name, database.name
    );
    let task_id = tasks
        .init_task(TaskType::RestoreBackup, RunType::User, properties.id)
        .await?;
    let storage_settings_name = properties.storage_settings_name.clone();
    let workflow = app
        .orchestrator
        .start_restore(task_id, properties, storage_settings_name, database)?;
    let task_ids = wait_for(vec![workflow]).await;
    report(app, &task_ids).await
}

async fn delete(app: &App, properties_id: i64) -> Result<()> {
    let tasks = app.orchestrator.tasks();
    let properties = tasks
        .find_backup_properties(properties_id)
        .await?
        .with_context(|| format!("No backup properties with id {}", properties_id))?;

    println!("🗑️ Deleting backup '{}'", properties.backup_name);
    let task_id = tasks
        .init_task(TaskType::DeleteBackup, RunType::User, properties.id)
        .await?;
    let workflow = app.orchestrator.start_delete(task_id, properties)?;
    let task_ids = wait_for(vec![workflow]).await;
    report(app, &task_ids).await?;
    tasks.delete_backup_properties(properties_id).await?;
    Ok(())
}

async fn plan(
    app: &App,
    database_name: &str,
    storages: Vec<String>,
    interval_seconds: i64,
    processors: Vec<String>,
) -> Result<()> {
    if interval_seconds <= 0 {
        bail!("Interval must be a positive number of seconds");
    }
    if storages.is_empty() {
        bail!("At least one storage is required");
    }
    app.catalog.database(database_name)?;
    for storage in &storages {
        app.catalog.storage(storage)?;
    }
    app.orchestrator.processors().validate(&processors)?;

    let planned = app
        .stores
        .planned_tasks
        .add(NewPlannedTask {
            database_settings_name: database_name.to_string(),
            storage_settings_names: storages,
            processors,
            interval_seconds,
            last_started_at: Utc::now(),
        })
        .await?;
    println!(
        "⏱️ Planned task {} created: '{}' every {}s to {:?}",
        planned.id, planned.database_settings_name, planned.interval_seconds,
        planned.storage_settings_names
    );
    Ok(())
}

async fn cancel(app: &App, task_id: TaskId) -> Result<()> {
    if app.orchestrator.tasks().find_task(task_id).await?.is_none() {
        bail!("No task with id {}", task_id);
    }
    if app.stores.cancel_tasks.add(task_id).await? {
        println!("Cancellation of task {} requested", task_id);
    } else {
        println!("Cancellation of task {} was already requested", task_id);
    }
    Ok(())
}

/// Waits for every workflow; Ctrl-C cancels them and keeps waiting until
/// they have settled.
async fn wait_for(workflows: Vec<WorkflowHandle>) -> Vec<TaskId> {
    let handles: Vec<_> = workflows.iter().map(|w| w.handle().clone()).collect();
    let task_ids = handles.iter().map(|h| h.task_id()).collect();
    let waiting = async {
        for workflow in workflows {
            workflow.wait().await;
        }
    };
    tokio::pin!(waiting);

    tokio::select! {
        _ = &mut waiting => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupt received, cancelling...");
            for handle in &handles {
                handle.cancel();
            }
            waiting.await;
        }
    }
    task_ids
}

async fn report(app: &App, task_ids: &[TaskId]) -> Result<()> {
    let mut failed = 0;
    for &task_id in task_ids {
        let task = app
            .orchestrator
            .tasks()
            .find_task(task_id)
            .await?
            .with_context(|| format!("Task {} vanished", task_id))?;
        if task.state == TaskState::Completed && !task.error {
            println!("✓ Task {} completed", task_id);
        } else {
            failed += 1;
            println!(
                "✗ Task {} ended in state {}{}",
                task_id,
                task.state,
                if task.error { " with an error" } else { "" }
            );
        }
    }
    if failed > 0 {
        bail!("{} of {} tasks did not complete", failed, task_ids.len());
    }
    Ok(())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn optional_list(values: &[String]) -> Vec<String> {
    values.first().map(|v| split_list(v)).unwrap_or_default()
}

fn parse_id(value: &str) -> Result<i64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid id '{}'", value))
}

/// Asks for a command line when none was given.
fn prompt_command() -> Result<Vec<String>> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Run the backup server (or type 'serve')");
    println!("2. Take Backup: backup <database> <storage>[,...] [processor,...]");
    println!("3. Restore Backup: restore <backup-properties-id> <database>");
    println!("4. Delete Backup: delete <backup-properties-id>");
    println!("5. Plan Backups: plan <database> <storage>[,...] <interval-secs> [processor,...]");
    println!("6. Cancel Task: cancel <task-id>");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.split_whitespace().map(str::to_string).collect())
}
