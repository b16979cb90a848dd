use serde::{Deserialize, Serialize};

use drumline_template::ParameterSpec;

/// Lifecycle state of a query execution. `Succeeded`, `Failed` and
/// `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created but not yet accepted by the backend.
    Pending,
    /// Accepted by the backend; status is being polled.
    Running,
    /// Backend reported successful completion; results recorded.
    Succeeded,
    /// Terminal failure: backend error, exhausted retries, or poll timeout.
    Failed,
    /// Cancelled externally or by the backend. Never overwritten.
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One persisted submission of a materialized query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUID v4 string — primary key.
    pub id: String,
    /// Owning schedule run, if this execution was fired by the scheduler.
    /// Manual runs have none.
    pub schedule_run_id: Option<String>,
    /// Backend-assigned execution id, set once the submit is accepted.
    pub backend_execution_id: Option<String>,
    pub status: ExecutionStatus,
    /// Retry attempts consumed by backend calls for this execution.
    pub retry_count: u32,
    /// Result column names (JSON array), present once succeeded.
    pub result_columns: Option<serde_json::Value>,
    /// Result row data (JSON), present once succeeded.
    pub result_rows: Option<serde_json::Value>,
    pub result_total_rows: Option<u64>,
    pub query_runtime_seconds: Option<f64>,
    pub data_scanned_gb: Option<f64>,
    pub cost_estimate_usd: Option<f64>,
    /// Human-readable failure cause; always set on failed executions.
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A stored query template: SQL with `{{name}}` placeholders plus its
/// declared parameter schema. Editing is out of scope here — the core only
/// creates and reads templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    pub sql_template: String,
    pub parameters: Vec<ParameterSpec>,
    pub created_at: String,
    pub updated_at: String,
}
