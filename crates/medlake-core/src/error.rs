// crates/medlake-core/src/error.rs

use thiserror::Error;

/// Failure classes shared by every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Source or database unreachable; retryable at the call site.
    Connectivity,
    /// Malformed record, file or identifier; skipped by batch operations.
    Validation,
    /// Duplicate natural key; absorbed by upserts.
    Conflict,
    /// Model, file or process failure scoped to one unit of work.
    Resource,
    Internal,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Partition store error: {0}")]
    Store(#[from] crate::partition_store::StoreError),

    #[error("Source error: {0}")]
    Source(#[from] crate::source::SourceError),

    #[error("Detector error: {0}")]
    Detector(#[from] crate::detector::DetectorError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unreachable: {0}")]
    Connectivity(String),

    #[error("Stage cancelled")]
    Cancelled,

    #[error("Operation '{operation}' timed out after {attempts} attempt(s)")]
    TimedOut { operation: String, attempts: u32 },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Sqlx(err) => sqlx_kind(err),
            PipelineError::Migrate(_) => ErrorKind::Internal,
            PipelineError::Io(_) => ErrorKind::Resource,
            PipelineError::Json(_) | PipelineError::Csv(_) | PipelineError::Validation(_) => {
                ErrorKind::Validation
            }
            PipelineError::Config(_) => ErrorKind::Validation,
            PipelineError::Store(err) => err.kind(),
            PipelineError::Source(err) => err.kind(),
            PipelineError::Detector(err) => err.kind(),
            PipelineError::Connectivity(_) | PipelineError::TimedOut { .. } => {
                ErrorKind::Connectivity
            }
            PipelineError::Cancelled => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }
}

pub(crate) fn sqlx_kind(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorKind::Connectivity,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            ErrorKind::Conflict
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::Encode(_) => {
            ErrorKind::Validation
        }
        _ => ErrorKind::Internal,
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
