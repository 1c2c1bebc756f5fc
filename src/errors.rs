// dbvault/src/errors.rs
use thiserror::Error;

use crate::entities::TaskId;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task {0} already has a running workflow")]
    AlreadyRunning(TaskId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Cooperative cancellation. Never routed to the error callback.
    #[error("Operation interrupted")]
    Interrupted,
}

impl AppError {
    pub fn tool(tool: &str, message: impl Into<String>) -> Self {
        AppError::Tool {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, AppError::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
