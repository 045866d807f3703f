use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HearthError {
    // Chain definition errors
    #[error("Invalid chain definition: {0}")]
    InvalidChain(String),

    #[error("Chain not found: {0}")]
    ChainNotFound(i64),

    // Authorization errors
    #[error("Caller group '{group}' is not permitted to invoke tool '{tool}'")]
    Unauthorized { tool: String, group: String },

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Run errors
    #[error("Run cancelled")]
    Cancelled,

    #[error("Execution context key already written: {0}")]
    ContextConflict(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure class recorded against a node in an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authorization,
    Tool,
    Cancelled,
    Internal,
}

impl HearthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidChain(_) | Self::ChainNotFound(_) => ErrorKind::Configuration,
            Self::Unauthorized { .. } => ErrorKind::Authorization,
            Self::ToolNotFound(_)
            | Self::ToolExecution { .. }
            | Self::ToolTimeout { .. } => ErrorKind::Tool,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ContextConflict(_)
            | Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, HearthError>;
