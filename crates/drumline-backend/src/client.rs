use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use drumline_core::types::TargetContext;

use crate::error::BackendError;

/// Backend-reported state of a submitted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendQueryStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl BackendQueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackendQueryStatus::Succeeded
                | BackendQueryStatus::Failed
                | BackendQueryStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub execution_id: String,
}

/// Result payload attached to a terminal SUCCEEDED status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: serde_json::Value,
    #[serde(default)]
    pub total_rows: u64,
    #[serde(default)]
    pub query_runtime_seconds: f64,
    #[serde(default)]
    pub data_scanned_gb: f64,
    #[serde(default)]
    pub cost_estimate_usd: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub status: BackendQueryStatus,
    #[serde(default)]
    pub result: Option<ResultMetadata>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Common interface to the query backend. The HTTP implementation is the
/// production path; tests substitute scripted fakes.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Submit a materialized query for asynchronous execution. Returns the
    /// backend-assigned execution id.
    async fn submit_query(
        &self,
        sql: &str,
        target: &TargetContext,
    ) -> Result<SubmitResponse, BackendError>;

    /// Fetch the current status of a previously submitted execution.
    async fn get_status(&self, execution_id: &str) -> Result<StatusResponse, BackendError>;
}

/// HTTP client for an AMC-style asynchronous query service.
pub struct HttpQueryBackend {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl HttpQueryBackend {
    pub fn new(base_url: String, api_token: String, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            api_token,
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_token.is_empty() {
            builder
        } else {
            builder.header("Authorization", format!("Bearer {}", self.api_token))
        }
    }

    /// Turn a non-2xx response into an `Api` error, preserving the status
    /// code and any server delay hint for the retry engine.
    async fn api_error(resp: reqwest::Response) -> BackendError {
        let status = resp.status().as_u16();
        let retry_after = retry_after_hint(resp.headers());
        let message = resp.text().await.unwrap_or_default();
        warn!(status, body = %message, "query backend error");
        BackendError::Api {
            status,
            message,
            retry_after,
        }
    }
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    sql: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    marketplace_id: Option<&'a str>,
}

#[async_trait]
impl QueryBackend for HttpQueryBackend {
    async fn submit_query(
        &self,
        sql: &str,
        target: &TargetContext,
    ) -> Result<SubmitResponse, BackendError> {
        let url = format!(
            "{}/instances/{}/queries",
            self.base_url, target.instance_id
        );
        debug!(instance = %target.instance_id, sql_len = sql.len(), "submitting query");

        let body = SubmitBody {
            sql,
            marketplace_id: target.marketplace_id.as_deref(),
        };
        let builder = self.client.post(&url).json(&body);
        let resp = self.apply_auth(builder).send().await?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        resp.json::<SubmitResponse>()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    async fn get_status(&self, execution_id: &str) -> Result<StatusResponse, BackendError> {
        let url = format!("{}/queries/executions/{}", self.base_url, execution_id);
        let builder = self.client.get(&url);
        let resp = self.apply_auth(builder).send().await?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        resp.json::<StatusResponse>()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }
}

/// Extract a server delay hint from response headers.
///
/// `Retry-After` (whole seconds) wins; otherwise `X-RateLimit-Reset` (unix
/// timestamp) is converted to a delay relative to now, floored at zero.
pub fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }
    headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|reset| {
            let now = chrono::Utc::now().timestamp();
            Duration::from_secs(reset.saturating_sub(now).max(0) as u64)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn retry_after_header_wins() {
        let h = headers(&[
            ("retry-after", "5".to_string()),
            (
                "x-ratelimit-reset",
                (chrono::Utc::now().timestamp() + 120).to_string(),
            ),
        ]);
        assert_eq!(retry_after_hint(&h), Some(Duration::from_secs(5)));
    }

    #[test]
    fn rate_limit_reset_converts_to_delay() {
        let h = headers(&[(
            "x-ratelimit-reset",
            (chrono::Utc::now().timestamp() + 30).to_string(),
        )]);
        let hint = retry_after_hint(&h).unwrap();
        assert!(hint <= Duration::from_secs(30));
        assert!(hint >= Duration::from_secs(28));
    }

    #[test]
    fn past_reset_floors_at_zero() {
        let h = headers(&[(
            "x-ratelimit-reset",
            (chrono::Utc::now().timestamp() - 100).to_string(),
        )]);
        assert_eq!(retry_after_hint(&h), Some(Duration::ZERO));
    }

    #[test]
    fn no_hint_headers_yields_none() {
        assert_eq!(retry_after_hint(&HeaderMap::new()), None);
    }

    #[test]
    fn backend_status_terminality() {
        assert!(!BackendQueryStatus::Pending.is_terminal());
        assert!(!BackendQueryStatus::Running.is_terminal());
        assert!(BackendQueryStatus::Succeeded.is_terminal());
        assert!(BackendQueryStatus::Failed.is_terminal());
        assert!(BackendQueryStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_response_parses_wire_format() {
        let resp: StatusResponse = serde_json::from_str(
            r#"{
                "status": "SUCCEEDED",
                "result": {
                    "columns": ["brand", "impressions"],
                    "rows": [["acme", 120]],
                    "total_rows": 1,
                    "query_runtime_seconds": 4.2,
                    "data_scanned_gb": 0.5,
                    "cost_estimate_usd": 0.01
                }
            }"#,
        )
        .unwrap();
        assert_eq!(resp.status, BackendQueryStatus::Succeeded);
        let result = resp.result.unwrap();
        assert_eq!(result.total_rows, 1);
        assert_eq!(result.columns.len(), 2);
    }
}
