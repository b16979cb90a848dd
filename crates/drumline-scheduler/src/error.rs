use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The trigger definition is invalid or yields no future fire time.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The schedule's timezone is not a recognised IANA name.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No schedule with the given ID exists in the store.
    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    /// No run with the given ID exists in the store.
    #[error("Schedule run not found: {id}")]
    RunNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure bubbled up from the execution subsystem.
    #[error("Execution error: {0}")]
    Exec(#[from] drumline_exec::ExecError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
