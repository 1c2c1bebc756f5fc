// dbvault/src/backup/postgres.rs
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use which::which;

use super::drain::{self, Channel, DrainReport};
use super::{DatabaseBackup, DumpHandle, DumpSupervisor};
use crate::entities::{DatabaseSettings, TaskId};
use crate::errors::{AppError, Result};
use crate::stream::BackupStream;
use crate::tasks::error_callback::ErrorCallback;

const PG_DUMP: &str = "pg_dump";
const PSQL: &str = "psql";
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);

// Helper function to find a PostgreSQL client executable
fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|e| {
        AppError::Config(format!(
            "{} executable not found in PATH ({}). Please ensure PostgreSQL client tools are installed and in your PATH.",
            name, e
        ))
    })
}

/// Backs up with `pg_dump` in plain format and restores by piping the dump
/// into `psql`.
pub struct PostgresDatabaseBackup {
    pg_dump_path: PathBuf,
    psql_path: PathBuf,
    error_callback: Arc<ErrorCallback>,
}

impl PostgresDatabaseBackup {
    pub fn new(pg_dump_path: PathBuf, psql_path: PathBuf, error_callback: Arc<ErrorCallback>) -> Self {
        PostgresDatabaseBackup {
            pg_dump_path,
            psql_path,
            error_callback,
        }
    }

    /// Uses the given tool paths, falling back to a `PATH` lookup.
    pub fn locate(
        pg_dump_path: Option<PathBuf>,
        psql_path: Option<PathBuf>,
        error_callback: Arc<ErrorCallback>,
    ) -> Result<Self> {
        let pg_dump_path = match pg_dump_path {
            Some(path) => path,
            None => find_executable(PG_DUMP)?,
        };
        let psql_path = match psql_path {
            Some(path) => path,
            None => find_executable(PSQL)?,
        };
        info!(pg_dump = %pg_dump_path.display(), psql = %psql_path.display(), "Using PostgreSQL client tools");
        Ok(PostgresDatabaseBackup::new(pg_dump_path, psql_path, error_callback))
    }

    fn dump_command(&self, settings: &DatabaseSettings) -> Command {
        let mut command = Command::new(&self.pg_dump_path);
        command
            .arg("-h")
            .arg(&settings.host)
            .arg("-p")
            .arg(settings.port.to_string())
            .arg("-F")
            .arg("p")
            .arg("-w")
            .arg("-d")
            .arg(&settings.database)
            .env("PGUSER", &settings.login)
            .env("PGPASSWORD", &settings.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn restore_command(&self, settings: &DatabaseSettings) -> Command {
        let mut command = Command::new(&self.psql_path);
        command
            .arg("-X") // Do not read psqlrc
            .arg("-q")
            .arg("-v")
            .arg("ON_ERROR_STOP=1")
            .arg("-w")
            .arg("-h")
            .arg(&settings.host)
            .arg("-p")
            .arg(settings.port.to_string())
            .arg("-d")
            .arg(&settings.database)
            .env("PGUSER", &settings.login)
            .env("PGPASSWORD", &settings.password)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Reports stderr output of the dump. Silent once `stop` fired.
    fn watch_dump_stderr(
        &self,
        stderr: tokio::process::ChildStderr,
        task_id: TaskId,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let callback = self.error_callback.clone();
        tokio::spawn(async move {
            let fault = match drain::drain(stderr, PG_DUMP, Channel::Stderr, task_id).await {
                Ok(report) if report.is_empty() => None,
                Ok(report) => Some(AppError::tool(PG_DUMP, report.summary())),
                Err(e) => Some(AppError::Io(e)),
            };
            if let Some(fault) = fault {
                if stop.is_cancelled() {
                    debug!(task_id, error = %fault, "Ignoring pg_dump output after stop");
                } else {
                    callback.on_error(fault, task_id).await;
                }
            }
        })
    }

    /// Waits for the dump to exit, or kills it once `stop` fires.
    fn watch_dump_exit(&self, mut child: Child, task_id: TaskId, stop: CancellationToken) -> JoinHandle<()> {
        let callback = self.error_callback.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop.cancelled() => None,
            };
            match status {
                Some(Ok(status)) if status.success() => info!(task_id, "pg_dump finished"),
                Some(Ok(status)) => {
                    if !stop.is_cancelled() {
                        let fault = AppError::tool(PG_DUMP, format!("exited with {}", status));
                        callback.on_error(fault, task_id).await;
                    }
                }
                Some(Err(e)) => {
                    if !stop.is_cancelled() {
                        callback.on_error(AppError::Io(e), task_id).await;
                    }
                }
                None => {
                    warn!(task_id, "Stopping pg_dump before it finished");
                    if let Err(e) = child.kill().await {
                        warn!(task_id, error = %e, "Failed to kill pg_dump");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl DatabaseBackup for PostgresDatabaseBackup {
    async fn create_backup(
        &self,
        settings: &DatabaseSettings,
        task_id: TaskId,
        cancel: &CancellationToken,
    ) -> Result<Option<DumpHandle>> {
        if cancel.is_cancelled() {
            info!(task_id, "Backup cancelled before pg_dump started");
            return Ok(None);
        }

        info!(
            task_id,
            database = %settings.database,
            host = %settings.host,
            "Starting pg_dump"
        );
        let mut child = self.dump_command(settings).spawn().map_err(|e| {
            AppError::tool(
                PG_DUMP,
                format!("failed to start {}: {}", self.pg_dump_path.display(), e),
            )
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::tool(PG_DUMP, "stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::tool(PG_DUMP, "stderr was not captured"))?;

        let stop = cancel.child_token();
        let tasks = vec![
            self.watch_dump_stderr(stderr, task_id, stop.clone()),
            self.watch_dump_exit(child, task_id, stop.clone()),
        ];
        Ok(Some(DumpHandle::new(
            Box::pin(stdout),
            DumpSupervisor::new(tasks, stop),
        )))
    }

    async fn restore_backup(
        &self,
        backup: BackupStream,
        settings: &DatabaseSettings,
        task_id: TaskId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AppError::Interrupted);
        }

        info!(
            task_id,
            database = %settings.database,
            host = %settings.host,
            "Starting psql restore"
        );
        let mut child = self.restore_command(settings).spawn().map_err(|e| {
            AppError::tool(
                PSQL,
                format!("failed to start {}: {}", self.psql_path.display(), e),
            )
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::tool(PSQL, "stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::tool(PSQL, "stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::tool(PSQL, "stderr was not captured"))?;
        let stdout_drain = drain::spawn_drain(stdout, PSQL, Channel::Stdout, task_id);
        let stderr_drain = drain::spawn_drain(stderr, PSQL, Channel::Stderr, task_id);

        let mut backup = backup;
        let fed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            fed = feed_stdin(&mut backup, &mut stdin) => Some(fed),
        };
        let lines = match fed {
            None => {
                abort_restore(child, stdin, task_id).await;
                return Err(AppError::Interrupted);
            }
            Some(Err(e)) => {
                if let Err(kill_err) = child.kill().await {
                    warn!(task_id, error = %kill_err, "Failed to kill psql");
                }
                if let Ok(report) = join_drain(stderr_drain).await {
                    if !report.is_empty() {
                        error!(task_id, stderr = %report.summary(), "psql stopped reading the backup");
                    }
                }
                return Err(AppError::Io(e));
            }
            Some(Ok(lines)) => lines,
        };
        // Closing stdin lets psql see EOF after the quit directive.
        drop(stdin);

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status?),
        };
        let Some(status) = status else {
            warn!(task_id, "Restore cancelled while psql was applying the backup");
            if let Err(e) = child.kill().await {
                warn!(task_id, error = %e, "Failed to kill psql");
            }
            return Err(AppError::Interrupted);
        };

        let stdout_report = join_drain(stdout_drain).await?;
        let stderr_report = join_drain(stderr_drain).await?;
        if !stderr_report.is_empty() {
            return Err(AppError::tool(PSQL, stderr_report.summary()));
        }
        if !status.success() {
            return Err(AppError::tool(PSQL, format!("exited with {}", status)));
        }

        info!(
            task_id,
            lines,
            output_lines = stdout_report.lines,
            "✓ psql restore finished"
        );
        Ok(())
    }
}

/// Writes the backup wrapped in one transaction, then the quit directive.
async fn feed_stdin(backup: &mut BackupStream, stdin: &mut ChildStdin) -> std::io::Result<u64> {
    let mut reader = BufReader::new(backup);
    let mut writer = BufWriter::new(stdin);
    let mut line = Vec::with_capacity(8 * 1024);
    let mut lines = 0u64;

    writer.write_all(b"BEGIN;\n").await?;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        writer.write_all(&line).await?;
        if !line.ends_with(b"\n") {
            writer.write_all(b"\n").await?;
        }
        lines += 1;
    }
    writer.write_all(b"COMMIT;\n").await?;
    writer.write_all(b"\\q\n").await?;
    writer.flush().await?;
    Ok(lines)
}

async fn abort_restore(mut child: Child, mut stdin: ChildStdin, task_id: TaskId) {
    warn!(task_id, "Restore cancelled, rolling back");
    let rollback = async {
        stdin.write_all(b"ROLLBACK;\n\\q\n").await?;
        stdin.flush().await
    };
    match tokio::time::timeout(ROLLBACK_TIMEOUT, rollback).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(task_id, error = %e, "Could not send ROLLBACK to psql"),
        Err(_) => debug!(task_id, "Timed out sending ROLLBACK to psql"),
    }
    drop(stdin);
    if let Err(e) = child.kill().await {
        warn!(task_id, error = %e, "Failed to kill psql");
    }
}

async fn join_drain(handle: JoinHandle<std::io::Result<DrainReport>>) -> Result<DrainReport> {
    let report = handle
        .await
        .map_err(|e| AppError::tool(PSQL, format!("output drain failed: {}", e)))??;
    Ok(report)
}
