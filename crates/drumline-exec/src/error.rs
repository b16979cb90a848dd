use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Materialization failure — non-retryable, raised before any backend call.
    #[error("Template error: {0}")]
    Template(#[from] drumline_template::TemplateError),

    /// Backend call failure after the retry engine gave up.
    #[error("Backend error: {0}")]
    Backend(#[from] drumline_backend::BackendError),

    /// The execution never reached a terminal state within its wall-clock
    /// budget. Distinct from a backend-reported failure.
    #[error("Poll timeout after {secs}s for execution {id}")]
    PollTimeout { id: String, secs: u64 },

    #[error("Execution not found: {id}")]
    NotFound { id: String },

    #[error("Workflow template not found: {id}")]
    TemplateNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;
