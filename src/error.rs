//! Error types for the sync engine and CLI.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=storage, 3=not_found, 4=validation, etc.)
//! - Retryability flags for scripted callers
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers
//!
//! Failures of individual queued operations never surface here: they are
//! classified inside the flush loop (see [`crate::sync::classify`]).

use std::path::PathBuf;
use thiserror::Error;

use crate::model::EntityKind;

/// Result type alias for sync engine operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Storage (exit 2)
    NotInitialized,
    DatabaseError,
    UnsupportedSchema,

    // Not Found (exit 3)
    OperationNotFound,
    EntityNotFound,

    // Validation (exit 4)
    InvalidArgument,
    UnsupportedOperation,

    // Backpressure (exit 5)
    QueueFull,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::UnsupportedSchema => "UNSUPPORTED_SCHEMA",
            Self::OperationNotFound => "OPERATION_NOT_FOUND",
            Self::EntityNotFound => "ENTITY_NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            Self::QueueFull => "QUEUE_FULL",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::DatabaseError | Self::UnsupportedSchema => 2,
            Self::OperationNotFound | Self::EntityNotFound => 3,
            Self::InvalidArgument | Self::UnsupportedOperation => 4,
            Self::QueueFull => 5,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether the same call may succeed later without changing its input.
    ///
    /// A full queue drains as the engine flushes; a busy database unlocks.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull | Self::DatabaseError)
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors surfaced by the engine's public API and the CLI.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Store not initialized at {path}")]
    NotInitialized { path: PathBuf },

    #[error("Unsupported {key} schema version {found} (this build reads up to {supported})")]
    UnsupportedSchema {
        key: String,
        found: u32,
        supported: u32,
    },

    #[error("Queued operation not found: {id}")]
    OperationNotFound { id: String },

    #[error("{kind} not found: {id}")]
    EntityNotFound { kind: EntityKind, id: String },

    #[error("Cannot {action} a {kind}")]
    UnsupportedOperation { kind: EntityKind, action: String },

    #[error("Queue is full ({depth} pending operations, limit {limit})")]
    QueueFull { depth: usize, limit: usize },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized { .. } => ErrorCode::NotInitialized,
            Self::UnsupportedSchema { .. } => ErrorCode::UnsupportedSchema,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::OperationNotFound { .. } => ErrorCode::OperationNotFound,
            Self::EntityNotFound { .. } => ErrorCode::EntityNotFound,
            Self::UnsupportedOperation { .. } => ErrorCode::UnsupportedOperation,
            Self::QueueFull { .. } => ErrorCode::QueueFull,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized { path } => Some(format!(
                "No queue store at {}. Enqueue a mutation or pass --store <path>.",
                path.display()
            )),

            Self::UnsupportedSchema { .. } => Some(
                "The store was written by a newer tfsync. Upgrade before flushing.".to_string(),
            ),

            Self::OperationNotFound { id } => Some(format!(
                "No operation '{id}'. Use `tfsync queue list` or `tfsync dead-letter list`."
            )),

            Self::UnsupportedOperation { kind, .. } => Some(format!(
                "Supported for {kind}: {}",
                supported_actions(*kind)
            )),

            Self::QueueFull { .. } => Some(
                "Run `tfsync flush` once connectivity is back to drain the queue.".to_string(),
            ),

            Self::EntityNotFound { kind, .. } => Some(format!(
                "Temporary ids are only known to the store that minted them. \
                 Use `tfsync {} list` to see local records.",
                command_name(*kind)
            )),

            Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::InvalidArgument(_)
            | Self::Config(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}

fn command_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Task => "task",
        EntityKind::Project => "project",
        EntityKind::TeamMember => "member",
        EntityKind::Comment => "comment",
    }
}

fn supported_actions(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Comment => "create",
        EntityKind::Task | EntityKind::Project | EntityKind::TeamMember => {
            "create, update, delete"
        }
    }
}
