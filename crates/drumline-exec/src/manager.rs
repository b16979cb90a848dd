use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use drumline_backend::{BackendQueryStatus, QueryBackend, RetryPolicy};
use drumline_core::config::{BackendConfig, ExecutionConfig};
use drumline_core::trace::{QueryTrace, Stage};
use drumline_core::types::TargetContext;
use drumline_template::{resolve_params, Materializer, TemplateError};

use crate::error::{ExecError, Result};
use crate::store::ExecutionStore;
use crate::types::{Execution, ExecutionStatus, WorkflowTemplate};

/// Reference to an in-flight (or finished) execution.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub execution_id: String,
    /// None when the submission never made it past the retry engine.
    pub backend_execution_id: Option<String>,
}

/// Drives executions through submit → poll → terminal.
pub struct ExecutionManager {
    store: ExecutionStore,
    backend: Arc<dyn QueryBackend>,
    retry: RetryPolicy,
    materializer: Materializer,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl ExecutionManager {
    pub fn new(
        store: ExecutionStore,
        backend: Arc<dyn QueryBackend>,
        retry: RetryPolicy,
        exec_cfg: &ExecutionConfig,
        backend_cfg: &BackendConfig,
    ) -> Self {
        Self {
            store,
            backend,
            retry,
            materializer: Materializer::new(
                exec_cfg.large_list_threshold,
                backend_cfg.max_query_length,
            ),
            poll_interval: Duration::from_secs(exec_cfg.poll_interval_secs),
            poll_timeout: Duration::from_secs(exec_cfg.poll_timeout_secs),
        }
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    /// Materialize a workflow template and run it to a terminal state.
    ///
    /// Template and backend failures are recorded on the returned execution
    /// rather than raised; `Err` is reserved for infrastructure failures
    /// (database access).
    pub async fn execute_workflow(
        &self,
        template: &WorkflowTemplate,
        bound: &Map<String, Value>,
        target: &TargetContext,
        schedule_run_id: Option<&str>,
    ) -> Result<Execution> {
        let submitted_at = Utc::now();
        let mut trace = QueryTrace::new(&template.sql_template, submitted_at, bound.len());
        let exec = self.store.create(schedule_run_id)?;
        info!(
            execution_id = %exec.id,
            query_id = %trace.query_id(),
            template = %template.name,
            instance = %target.instance_id,
            "executing workflow"
        );

        trace.stage(Stage::ValidateParams);
        let params = match resolve_params(&template.parameters, bound) {
            Ok(p) => p,
            Err(e) => return self.fail_before_submit(&exec.id, &trace, Stage::ValidateParams, e),
        };

        trace.stage(Stage::Materialize);
        let sql = match self
            .materializer
            .materialize(&template.sql_template, &params, &trace)
        {
            Ok(s) => s,
            Err(e) => return self.fail_before_submit(&exec.id, &trace, Stage::Materialize, e),
        };
        trace.set_query_len(sql.len());
        trace.stage(Stage::ValidateLength);

        if let Some(backend_id) = self.submit_created(&exec.id, &sql, target, &trace).await? {
            let handle = ExecutionHandle {
                execution_id: exec.id.clone(),
                backend_execution_id: Some(backend_id),
            };
            match self.run_to_completion(&handle, Some(&trace)).await {
                Ok(_) => {}
                // Recorded on the execution row; the caller reads it from there.
                Err(ExecError::PollTimeout { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.store.get(&exec.id)
    }

    /// Submit an already materialized query, creating a fresh execution row.
    ///
    /// The returned handle carries no backend id when retries were exhausted;
    /// the execution row is then already terminal (`failed`).
    pub async fn submit(
        &self,
        sql: &str,
        target: &TargetContext,
        schedule_run_id: Option<&str>,
    ) -> Result<ExecutionHandle> {
        let exec = self.store.create(schedule_run_id)?;
        let trace = QueryTrace::new(sql, Utc::now(), 0);
        let backend_execution_id = self.submit_created(&exec.id, sql, target, &trace).await?;
        Ok(ExecutionHandle {
            execution_id: exec.id,
            backend_execution_id,
        })
    }

    /// One status check. Terminal persisted state short-circuits without a
    /// backend call, which makes re-polling idempotent: result metadata is
    /// written at most once and cancelled rows stay cancelled.
    pub async fn poll(
        &self,
        handle: &ExecutionHandle,
        trace: Option<&QueryTrace>,
    ) -> Result<ExecutionStatus> {
        let current = self.store.get(&handle.execution_id)?;
        if current.status.is_terminal() {
            return Ok(current.status);
        }
        let Some(backend_id) = current.backend_execution_id else {
            return Ok(current.status);
        };

        let backend = Arc::clone(&self.backend);
        let outcome = self
            .retry
            .run(|_attempt| {
                let backend = Arc::clone(&backend);
                let backend_id = backend_id.clone();
                async move { backend.get_status(&backend_id).await }
            })
            .await;

        let resp = match outcome {
            Ok(resp) => resp,
            Err(e) => {
                // The execution is unobservable; record the terminal error.
                warn!(execution_id = %handle.execution_id, error = %e, "status check gave up");
                self.store
                    .mark_failed(&handle.execution_id, &e.to_string(), current.retry_count)?;
                return Ok(ExecutionStatus::Failed);
            }
        };

        match resp.status {
            BackendQueryStatus::Pending | BackendQueryStatus::Running => {
                Ok(ExecutionStatus::Running)
            }
            BackendQueryStatus::Succeeded => {
                let result = resp.result.unwrap_or_default();
                if self.store.mark_succeeded(&handle.execution_id, &result)? {
                    if let Some(trace) = trace {
                        trace.stage(Stage::FetchResults);
                    }
                    info!(
                        execution_id = %handle.execution_id,
                        total_rows = result.total_rows,
                        runtime_secs = result.query_runtime_seconds,
                        "execution succeeded"
                    );
                }
                Ok(ExecutionStatus::Succeeded)
            }
            BackendQueryStatus::Failed => {
                let message = resp
                    .error
                    .unwrap_or_else(|| "backend reported failure".to_string());
                self.store
                    .mark_failed(&handle.execution_id, &message, current.retry_count)?;
                Ok(ExecutionStatus::Failed)
            }
            BackendQueryStatus::Cancelled => {
                self.store.mark_cancelled(&handle.execution_id)?;
                Ok(ExecutionStatus::Cancelled)
            }
        }
    }

    /// Poll until terminal or the wall-clock budget runs out. A timeout marks
    /// the execution failed and returns `PollTimeout` so callers can report
    /// the category distinctly from a backend-reported failure.
    pub async fn run_to_completion(
        &self,
        handle: &ExecutionHandle,
        trace: Option<&QueryTrace>,
    ) -> Result<ExecutionStatus> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            let status = self.poll(handle, trace).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                let secs = self.poll_timeout.as_secs();
                let message =
                    format!("execution did not reach a terminal state within {secs}s");
                let current = self.store.get(&handle.execution_id)?;
                self.store
                    .mark_failed(&handle.execution_id, &message, current.retry_count)?;
                return Err(ExecError::PollTimeout {
                    id: handle.execution_id.clone(),
                    secs,
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Submit through the retry engine for an existing pending row. Returns
    /// the backend execution id, or None after marking the row failed when
    /// retries were exhausted or the error was permanent.
    async fn submit_created(
        &self,
        execution_id: &str,
        sql: &str,
        target: &TargetContext,
        trace: &QueryTrace,
    ) -> Result<Option<String>> {
        trace.stage(Stage::Submit);
        let attempts = AtomicU32::new(0);
        let backend = Arc::clone(&self.backend);
        let outcome = self
            .retry
            .run(|attempt| {
                attempts.store(attempt, Ordering::SeqCst);
                let backend = Arc::clone(&backend);
                let sql = sql.to_string();
                let target = target.clone();
                async move { backend.submit_query(&sql, &target).await }
            })
            .await;

        let retry_count = attempts.load(Ordering::SeqCst);
        match outcome {
            Ok(resp) => {
                self.store
                    .mark_running(execution_id, &resp.execution_id, retry_count)?;
                trace.stage(Stage::BackendExecution);
                Ok(Some(resp.execution_id))
            }
            Err(e) => {
                trace.stage_error(Stage::Submit, &e.to_string());
                self.store
                    .mark_failed(execution_id, &e.to_string(), retry_count)?;
                Ok(None)
            }
        }
    }

    fn fail_before_submit(
        &self,
        execution_id: &str,
        trace: &QueryTrace,
        stage: Stage,
        err: TemplateError,
    ) -> Result<Execution> {
        trace.stage_error(stage, &err.to_string());
        self.store.mark_failed(execution_id, &err.to_string(), 0)?;
        self.store.get(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use drumline_backend::{BackendError, ResultMetadata, StatusResponse, SubmitResponse};
    use rusqlite::Connection;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type SubmitResult = std::result::Result<SubmitResponse, BackendError>;
    type StatusResult = std::result::Result<StatusResponse, BackendError>;

    /// Backend double that replays scripted responses. An exhausted status
    /// script keeps answering RUNNING so timeout paths can be exercised.
    struct ScriptedBackend {
        submits: Mutex<VecDeque<SubmitResult>>,
        statuses: Mutex<VecDeque<StatusResult>>,
    }

    impl ScriptedBackend {
        fn new(submits: Vec<SubmitResult>, statuses: Vec<StatusResult>) -> Arc<Self> {
            Arc::new(Self {
                submits: Mutex::new(submits.into()),
                statuses: Mutex::new(statuses.into()),
            })
        }

        fn remaining_statuses(&self) -> usize {
            self.statuses.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl QueryBackend for ScriptedBackend {
        async fn submit_query(
            &self,
            _sql: &str,
            _target: &TargetContext,
        ) -> std::result::Result<SubmitResponse, BackendError> {
            self.submits
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected submit_query call")
        }

        async fn get_status(
            &self,
            _execution_id: &str,
        ) -> std::result::Result<StatusResponse, BackendError> {
            match self.statuses.lock().unwrap().pop_front() {
                Some(resp) => resp,
                None => Ok(StatusResponse {
                    status: BackendQueryStatus::Running,
                    result: None,
                    error: None,
                }),
            }
        }
    }

    fn accepted(id: &str) -> SubmitResult {
        Ok(SubmitResponse {
            execution_id: id.to_string(),
        })
    }

    fn unavailable() -> BackendError {
        BackendError::Api {
            status: 503,
            message: "temporarily unavailable".into(),
            retry_after: None,
        }
    }

    fn running() -> StatusResult {
        Ok(StatusResponse {
            status: BackendQueryStatus::Running,
            result: None,
            error: None,
        })
    }

    fn succeeded(total_rows: u64) -> StatusResult {
        Ok(StatusResponse {
            status: BackendQueryStatus::Succeeded,
            result: Some(ResultMetadata {
                columns: vec!["brand".into()],
                rows: json!([["acme"]]),
                total_rows,
                query_runtime_seconds: 3.0,
                data_scanned_gb: 0.2,
                cost_estimate_usd: 0.05,
            }),
            error: None,
        })
    }

    fn manager(backend: Arc<ScriptedBackend>) -> ExecutionManager {
        ExecutionManager {
            store: ExecutionStore::new(Connection::open_in_memory().unwrap()).unwrap(),
            backend,
            retry: RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                base: 2.0,
                jitter: false,
            },
            materializer: Materializer::new(100, 262_144),
            poll_interval: Duration::from_millis(1),
            poll_timeout: Duration::from_millis(40),
        }
    }

    fn template(sql: &str) -> WorkflowTemplate {
        let now = Utc::now().to_rfc3339();
        WorkflowTemplate {
            id: "tpl-1".into(),
            name: "test-template".into(),
            sql_template: sql.into(),
            parameters: vec![],
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn target() -> TargetContext {
        TargetContext::new("inst-1")
    }

    #[tokio::test]
    async fn successful_workflow_records_results() {
        let backend = ScriptedBackend::new(
            vec![accepted("be-1")],
            vec![running(), succeeded(5)],
        );
        let mgr = manager(Arc::clone(&backend));
        let exec = mgr
            .execute_workflow(&template("SELECT 1"), &Map::new(), &target(), None)
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(exec.backend_execution_id.as_deref(), Some("be-1"));
        assert_eq!(exec.result_total_rows, Some(5));
        assert_eq!(exec.cost_estimate_usd, Some(0.05));
    }

    #[tokio::test]
    async fn submit_retry_exhaustion_fails_execution() {
        let backend = ScriptedBackend::new(
            vec![
                Err(unavailable()),
                Err(unavailable()),
                Err(unavailable()),
                Err(unavailable()),
            ],
            vec![],
        );
        let mgr = manager(backend);
        let exec = mgr
            .execute_workflow(&template("SELECT 1"), &Map::new(), &target(), None)
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error_message.unwrap().contains("503"));
        assert_eq!(exec.retry_count, 3);
    }

    #[tokio::test]
    async fn template_failure_never_reaches_the_backend() {
        let backend = ScriptedBackend::new(vec![], vec![]);
        let mgr = manager(backend);
        let exec = mgr
            .execute_workflow(
                &template("SELECT * FROM t WHERE id = {{missing}}"),
                &Map::new(),
                &target(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec
            .error_message
            .unwrap()
            .contains("Missing parameter: missing"));
    }

    #[tokio::test]
    async fn poll_timeout_is_a_distinct_failure() {
        // No scripted statuses: the backend answers RUNNING forever.
        let backend = ScriptedBackend::new(vec![accepted("be-1")], vec![]);
        let mgr = manager(backend);
        let exec = mgr
            .execute_workflow(&template("SELECT 1"), &Map::new(), &target(), None)
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec
            .error_message
            .unwrap()
            .contains("did not reach a terminal state"));
    }

    #[tokio::test]
    async fn backend_reported_failure_carries_its_message() {
        let backend = ScriptedBackend::new(
            vec![accepted("be-1")],
            vec![Ok(StatusResponse {
                status: BackendQueryStatus::Failed,
                result: None,
                error: Some("query exceeded memory budget".into()),
            })],
        );
        let mgr = manager(backend);
        let exec = mgr
            .execute_workflow(&template("SELECT 1"), &Map::new(), &target(), None)
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(
            exec.error_message.as_deref(),
            Some("query exceeded memory budget")
        );
    }

    #[tokio::test]
    async fn backend_cancellation_stops_polling() {
        let backend = ScriptedBackend::new(
            vec![accepted("be-1")],
            vec![
                running(),
                Ok(StatusResponse {
                    status: BackendQueryStatus::Cancelled,
                    result: None,
                    error: None,
                }),
                succeeded(99),
            ],
        );
        let mgr = manager(Arc::clone(&backend));
        let exec = mgr
            .execute_workflow(&template("SELECT 1"), &Map::new(), &target(), None)
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        // The stray success response was never consumed.
        assert_eq!(backend.remaining_statuses(), 1);
    }

    #[tokio::test]
    async fn external_cancellation_short_circuits_poll() {
        let backend = ScriptedBackend::new(vec![accepted("be-1")], vec![succeeded(1)]);
        let mgr = manager(Arc::clone(&backend));
        let handle = mgr.submit("SELECT 1", &target(), None).await.unwrap();
        mgr.store().mark_cancelled(&handle.execution_id).unwrap();

        let status = mgr.poll(&handle, None).await.unwrap();
        assert_eq!(status, ExecutionStatus::Cancelled);
        // No backend call was made; the scripted success is still queued.
        assert_eq!(backend.remaining_statuses(), 1);
        assert_eq!(
            mgr.store().get(&handle.execution_id).unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn repolling_after_terminal_state_is_idempotent() {
        let backend = ScriptedBackend::new(vec![accepted("be-1")], vec![succeeded(7)]);
        let mgr = manager(Arc::clone(&backend));
        let handle = mgr.submit("SELECT 1", &target(), None).await.unwrap();
        let first = mgr.run_to_completion(&handle, None).await.unwrap();
        assert_eq!(first, ExecutionStatus::Succeeded);

        // Statuses are exhausted: a real backend call would now see RUNNING.
        // The persisted terminal state short-circuits instead.
        let again = mgr.poll(&handle, None).await.unwrap();
        assert_eq!(again, ExecutionStatus::Succeeded);
        assert_eq!(
            mgr.store().get(&handle.execution_id).unwrap().result_total_rows,
            Some(7)
        );
    }

    #[tokio::test]
    async fn permanent_submit_error_fails_without_retries() {
        let backend = ScriptedBackend::new(
            vec![Err(BackendError::Api {
                status: 400,
                message: "invalid SQL".into(),
                retry_after: None,
            })],
            vec![],
        );
        let mgr = manager(backend);
        let exec = mgr
            .execute_workflow(&template("SELECT 1"), &Map::new(), &target(), None)
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.retry_count, 0);
        assert!(exec.error_message.unwrap().contains("invalid SQL"));
    }
}
