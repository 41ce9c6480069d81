//! Error types and exit codes for kgraph-engine

use std::process::ExitCode;
use thiserror::Error;

/// Main error type for kgraph-engine operations
#[derive(Error, Debug)]
pub enum KgError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Entity not found: {key}")]
    EntityNotFound { key: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Extractor '{extractor}' failed: {message}")]
    Extraction { extractor: String, message: String },

    #[error("Watch error: {message}")]
    Watch { message: String },

    #[error("Worker protocol error: {message}")]
    Ipc { message: String },

    #[error("Sync worker is not running")]
    WorkerUnavailable,
}

impl KgError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn ipc(message: impl Into<String>) -> Self {
        Self::Ipc {
            message: message.into(),
        }
    }

    /// Stable machine-readable code, used in tool error payloads
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Database(_) | Self::Pool(_) => "database_error",
            Self::Serialization(_) => "serialization_error",
            Self::Config { .. } => "config_error",
            Self::EntityNotFound { .. } => "not_found",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Extraction { .. } => "extraction_error",
            Self::Watch { .. } => "watch_error",
            Self::Ipc { .. } => "ipc_error",
            Self::WorkerUnavailable => "worker_unavailable",
        }
    }

    /// Convert error to a process exit code:
    /// - 1: IO error
    /// - 2: Bad configuration or arguments
    /// - 3: Database failure
    /// - 4: Query / lookup failure
    /// - 5: Worker process failure
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Io(_) | Self::Watch { .. } => ExitCode::from(1),
            Self::Config { .. } | Self::InvalidArgument { .. } | Self::Serialization(_) => {
                ExitCode::from(2)
            }
            Self::Database(_) | Self::Pool(_) => ExitCode::from(3),
            Self::EntityNotFound { .. } | Self::Extraction { .. } => ExitCode::from(4),
            Self::Ipc { .. } | Self::WorkerUnavailable => ExitCode::from(5),
        }
    }
}

/// Result type alias for kgraph-engine operations
pub type Result<T> = std::result::Result<T, KgError>;
