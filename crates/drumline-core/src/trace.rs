//! Query trace — structured stage logging for a single query's journey.
//!
//! Every query is identified by a deterministic id derived from its content
//! and submission instant, so log lines from materialization through result
//! retrieval can be correlated across processes. Parameter values are logged
//! as summaries (type tag + size); only short non-list scalars are echoed
//! literally, so sensitive payloads never land in logs verbatim.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Scalars at or below this length are echoed literally in param summaries.
const MAX_ECHO_CHARS: usize = 40;

/// Named stages a query passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Materialize,
    ValidateParams,
    ValidateLength,
    Submit,
    BackendExecution,
    FetchResults,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Materialize => "materialize",
            Stage::ValidateParams => "validate_params",
            Stage::ValidateLength => "validate_length",
            Stage::Submit => "submit",
            Stage::BackendExecution => "backend_execution",
            Stage::FetchResults => "fetch_results",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic query id: first 16 hex chars of SHA-256 over the query
/// content and the RFC 3339 submission instant.
pub fn query_id(content: &str, submitted_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(b"\n");
    hasher.update(submitted_at.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Correlates log records for one query across its lifecycle stages.
#[derive(Debug, Clone)]
pub struct QueryTrace {
    query_id: String,
    query_len: usize,
    param_count: usize,
}

impl QueryTrace {
    pub fn new(content: &str, submitted_at: DateTime<Utc>, param_count: usize) -> Self {
        Self {
            query_id: query_id(content, submitted_at),
            query_len: content.len(),
            param_count,
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Update the recorded query length after substitution changes it.
    pub fn set_query_len(&mut self, len: usize) {
        self.query_len = len;
    }

    /// Record entry into a stage.
    pub fn stage(&self, stage: Stage) {
        info!(
            query_id = %self.query_id,
            stage = %stage,
            query_len = self.query_len,
            param_count = self.param_count,
            "query stage"
        );
    }

    /// Record a stage failure. The error text is caller-provided and should
    /// already be free of raw parameter values.
    pub fn stage_error(&self, stage: Stage, error: &str) {
        warn!(
            query_id = %self.query_id,
            stage = %stage,
            query_len = self.query_len,
            param_count = self.param_count,
            error,
            "query stage failed"
        );
    }

    /// Record one parameter substitution: name, summarized value, and whether
    /// the large-list rendering path was taken.
    pub fn param(&self, name: &str, value: &Value, large_list: bool) {
        info!(
            query_id = %self.query_id,
            stage = %Stage::Materialize,
            param = name,
            value = %summarize(value),
            large_list,
            "parameter bound"
        );
    }
}

/// Summarize a parameter value for logging: type tag plus size, echoing only
/// short non-list scalars.
pub fn summarize(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) if s.chars().count() <= MAX_ECHO_CHARS => format!("{s:?}"),
        Value::String(s) => format!("string(len={})", s.chars().count()),
        Value::Array(items) => format!("list(len={})", items.len()),
        Value::Object(map) => format!("object(keys={})", map.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn query_id_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let a = query_id("SELECT 1", at);
        let b = query_id("SELECT 1", at);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn query_id_varies_with_content_and_time() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap();
        assert_ne!(query_id("SELECT 1", at), query_id("SELECT 2", at));
        assert_ne!(query_id("SELECT 1", at), query_id("SELECT 1", later));
    }

    #[test]
    fn short_scalars_are_echoed() {
        assert_eq!(summarize(&json!("ads")), "\"ads\"");
        assert_eq!(summarize(&json!(42)), "42");
        assert_eq!(summarize(&json!(true)), "true");
        assert_eq!(summarize(&json!(null)), "null");
    }

    #[test]
    fn long_strings_are_redacted_to_length() {
        let long = "x".repeat(200);
        assert_eq!(summarize(&json!(long)), "string(len=200)");
    }

    #[test]
    fn lists_and_objects_show_size_only() {
        assert_eq!(summarize(&json!([1, 2, 3])), "list(len=3)");
        assert_eq!(summarize(&json!({"a": 1, "b": 2})), "object(keys=2)");
    }
}
