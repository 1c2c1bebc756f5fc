// dbvault/src/watchers/mod.rs
pub mod cancel_tasks;
pub mod error_tasks;
pub mod planned;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::WatchersConfig;
use crate::errors::Result;

pub use cancel_tasks::CancelTasksWatcher;
pub use error_tasks::ErrorTasksWatcher;
pub use planned::PlannedTasksWatcher;

/// Runs `pass` every `period` until `shutdown` fires. A pass that overruns
/// the period delays the next one instead of stacking up.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<usize>> + Send,
{
    tokio::spawn(async move {
        info!(watcher = name, period_secs = period.as_secs(), "Watcher started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match pass().await {
                Ok(0) => {}
                Ok(handled) => debug!(watcher = name, handled, "Watcher pass finished"),
                Err(e) => error!(watcher = name, error = %e, "Watcher pass failed"),
            }
        }
        info!(watcher = name, "Watcher stopped");
    })
}

/// Starts every background watcher.
pub fn spawn_watchers(
    config: &WatchersConfig,
    planned: Arc<PlannedTasksWatcher>,
    errors: Arc<ErrorTasksWatcher>,
    cancels: Arc<CancelTasksWatcher>,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let due = planned.clone();
    let executing = planned;
    vec![
        spawn_periodic(
            "planned_tasks",
            config.planned_interval,
            shutdown.clone(),
            move || {
                let watcher = due.clone();
                async move { watcher.watch_planned_tasks().await }
            },
        ),
        spawn_periodic(
            "executing_planned_tasks",
            config.executing_interval,
            shutdown.clone(),
            move || {
                let watcher = executing.clone();
                async move { watcher.watch_executing_planned_tasks().await }
            },
        ),
        spawn_periodic(
            "error_tasks",
            config.error_interval,
            shutdown.clone(),
            move || {
                let watcher = errors.clone();
                async move { watcher.watch_error_tasks().await }
            },
        ),
        spawn_periodic(
            "cancel_tasks",
            config.cancel_interval,
            shutdown.clone(),
            move || {
                let watcher = cancels.clone();
                async move { watcher.watch_tasks_to_cancel().await }
            },
        ),
    ]
}
