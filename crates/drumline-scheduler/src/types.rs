use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use drumline_core::types::TargetContext;

/// Defines when a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Cron expression (5-field Unix or 6-field with seconds), evaluated in
    /// the schedule's timezone.
    Cron { expression: String },

    /// Every N days at a fixed local time.
    Interval {
        days: u32,
        #[serde(default)]
        at_hour: u8,
        #[serde(default)]
        at_minute: u8,
    },
}

/// A persisted schedule: workflow template + target + trigger definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// UUID v4 string — primary key.
    pub id: String,
    /// Workflow template this schedule fires.
    pub template_id: String,
    /// Backend instance the materialized query runs against.
    pub target: TargetContext,
    pub trigger: Trigger,
    /// IANA timezone name the trigger is evaluated in.
    pub timezone: String,
    /// Parameter values bound at schedule time; template defaults fill gaps.
    pub parameters: Map<String, Value>,
    pub is_active: bool,
    /// Earliest future fire time (UTC, RFC 3339). NULL only when inactive.
    /// Doubles as the optimistic-concurrency version token for claims.
    pub next_run_at: Option<String>,
    pub last_run_at: Option<String>,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub auto_pause_on_failure: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Lifecycle state of one schedule firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One firing attempt of a schedule. `(schedule_id, run_number)` is unique —
/// the anti-duplication guard behind the optimistic claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: String,
    pub schedule_id: String,
    /// Monotonically increasing per schedule, starting at 1.
    pub run_number: i64,
    pub status: RunStatus,
    pub execution_count: u32,
    pub successful_count: u32,
    pub failed_count: u32,
    pub total_rows: u64,
    pub total_cost: f64,
    pub error_summary: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}
