use std::time::Duration;

use thiserror::Error;

/// Status codes that always warrant a retry.
const RETRYABLE_STATUS: &[u16] = &[429, 500, 502, 503, 504];
/// Status codes that are never retried, whatever the error text says.
const PERMANENT_STATUS: &[u16] = &[400, 401, 403, 404];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Connection-level failure with no HTTP status (reset, refused, timeout
    /// surfaced as text by an intermediary).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-2xx response from the backend. `retry_after` carries the server's
    /// delay hint when the response included one.
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl BackendError {
    /// Whether the retry engine may re-attempt the failed call.
    ///
    /// Status codes are authoritative: 429/5xx retry, 400/401/403/404 never
    /// do. Without a decisive status the error text is matched against known
    /// transient patterns.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Http(e) => {
                e.is_timeout() || e.is_connect() || is_transient_text(&e.to_string())
            }
            BackendError::Transport(msg) => is_transient_text(msg),
            BackendError::Api {
                status, message, ..
            } => {
                if RETRYABLE_STATUS.contains(status) {
                    true
                } else if PERMANENT_STATUS.contains(status) {
                    false
                } else {
                    is_transient_text(message)
                }
            }
            BackendError::Parse(_) => false,
        }
    }

    /// Server-provided delay hint, if any. Takes precedence over the
    /// exponential backoff formula.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn is_transient_text(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["timeout", "timed out", "connection reset", "connection refused", "temporarily unavailable", "too many requests"]
        .iter()
        .any(|pat| lower.contains(pat))
}
