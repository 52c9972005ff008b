use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Core internal errors.
///
/// Expected provider outcomes (invalid LLM JSON, 4xx responses, empty parse
/// results) are modeled as values here rather than panics, so jobs can skip
/// items and continue.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Authorization expired: {0}")]
    AuthExpired(String),
    #[error("Transient provider error: {0}")]
    Transient(String),
    #[error("Permanent provider error: {0}")]
    Permanent(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Tenant isolation violation: {0}")]
    TenantIsolation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Processing error: {0}")]
    Processing(String),
    #[error("Fatal error: {0}")]
    Fatal(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether the orchestrator should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Transient(_) | AppError::AuthExpired(_) | AppError::Database(_)
        )
    }

    /// Whether the error aborts the whole job instead of the current item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Fatal(_) | AppError::TenantIsolation(_))
    }
}
