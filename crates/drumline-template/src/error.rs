use thiserror::Error;

/// Errors raised while materializing a query template. All of these are
/// non-retryable and surface before any backend call is made.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// A declared placeholder has neither a bound value nor a default.
    #[error("Missing parameter: {name}")]
    MissingParameter { name: String },

    /// Malformed placeholder syntax in the template.
    #[error("Template syntax error: {detail}")]
    Syntax { detail: String },

    /// The bound value's shape cannot be rendered as a SQL literal.
    #[error("Unsupported value for parameter {name}: {kind}")]
    UnsupportedValue { name: String, kind: &'static str },

    /// The materialized query exceeds the backend's maximum query length.
    #[error("Materialized query length {len} exceeds maximum {max}")]
    LengthExceeded { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, TemplateError>;
