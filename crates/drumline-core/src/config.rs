use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Top-level config (drumline.toml + DRUMLINE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DrumlineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Query backend endpoint and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token sent on every backend request. Empty disables the header
    /// (useful against a local stub).
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Hard cap on the materialized query length, enforced before submission.
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            max_query_length: default_max_query_length(),
        }
    }
}

/// Retry/backoff policy knobs shared by submit and poll calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "bool_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_base: default_backoff_base(),
            jitter: true,
        }
    }
}

/// Execution lifecycle knobs: poll cadence, wall-clock budget, list rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum wall-clock seconds an execution may spend before it is failed
    /// with a poll timeout.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// List parameters longer than this render via the VALUES form instead of
    /// an inline literal list.
    #[serde(default = "default_large_list_threshold")]
    pub large_list_threshold: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
            large_list_threshold: default_large_list_threshold(),
        }
    }
}

/// Scheduler loop knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_poll_secs")]
    pub poll_interval_secs: u64,
    /// Tolerance before next_run_at within which a schedule counts as due.
    /// Must stay below the poll interval or two consecutive scans could both
    /// see the same tick as due.
    #[serde(default = "default_due_buffer_secs")]
    pub due_buffer_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_scheduler_poll_secs(),
            due_buffer_secs: default_due_buffer_secs(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_base_url() -> String {
    "http://localhost:9400".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_query_length() -> usize {
    262_144
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_backoff_base() -> f64 {
    2.0
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_poll_timeout_secs() -> u64 {
    1_800
}
fn default_large_list_threshold() -> usize {
    100
}
fn default_scheduler_poll_secs() -> u64 {
    60
}
fn default_due_buffer_secs() -> u64 {
    30
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.drumline/drumline.db", home)
}

impl DrumlineConfig {
    /// Load config from a TOML file with DRUMLINE_* env var overrides.
    ///
    /// Checks the explicit path argument first, then ~/.drumline/drumline.toml.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: DrumlineConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("DRUMLINE_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate();
        Ok(config)
    }

    /// Clamp values whose interaction would break scheduler correctness.
    ///
    /// The due buffer must stay strictly below the scheduler poll interval,
    /// otherwise two consecutive scans can both consider the same tick due.
    pub fn validate(&mut self) {
        let max_buffer = self.scheduler.poll_interval_secs.saturating_sub(1);
        if self.scheduler.due_buffer_secs > max_buffer {
            warn!(
                configured = self.scheduler.due_buffer_secs,
                clamped = max_buffer,
                "scheduler.due_buffer_secs exceeds the poll interval; clamping"
            );
            self.scheduler.due_buffer_secs = max_buffer;
        }
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.drumline/drumline.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DrumlineConfig::default();
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.initial_delay_ms, 1_000);
        assert_eq!(cfg.retry.max_delay_ms, 60_000);
        assert_eq!(cfg.execution.large_list_threshold, 100);
        assert_eq!(cfg.scheduler.due_buffer_secs, 30);
        assert!(cfg.scheduler.due_buffer_secs < cfg.scheduler.poll_interval_secs);
    }

    #[test]
    fn validate_clamps_oversized_due_buffer() {
        let mut cfg = DrumlineConfig::default();
        cfg.scheduler.poll_interval_secs = 20;
        cfg.scheduler.due_buffer_secs = 120;
        cfg.validate();
        assert_eq!(cfg.scheduler.due_buffer_secs, 19);
    }

    #[test]
    fn validate_keeps_valid_buffer() {
        let mut cfg = DrumlineConfig::default();
        cfg.scheduler.poll_interval_secs = 60;
        cfg.scheduler.due_buffer_secs = 30;
        cfg.validate();
        assert_eq!(cfg.scheduler.due_buffer_secs, 30);
    }
}
