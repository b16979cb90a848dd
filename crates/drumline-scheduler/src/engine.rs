use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use drumline_core::config::SchedulerConfig;
use drumline_exec::{ExecutionManager, ExecutionStatus, TemplateStore};

use crate::cron::next_fire;
use crate::error::Result;
use crate::store::ScheduleStore;
use crate::types::{RunStatus, Schedule, ScheduleRun};

/// Stateless poll-claim-execute loop over persisted schedules.
///
/// Any number of engine processes may run against the same database; the
/// conditional update in [`ScheduleStore::claim`] is the only coordination
/// between them. A process can be killed and restarted at any point without
/// losing correctness — the claim is the sole source of truth for a tick.
pub struct SchedulerEngine {
    store: Arc<ScheduleStore>,
    templates: Arc<TemplateStore>,
    executions: Arc<ExecutionManager>,
    poll_interval: StdDuration,
    due_buffer: Duration,
    /// Run ids currently executing in this process.
    in_flight: DashMap<String, ()>,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<ScheduleStore>,
        templates: Arc<TemplateStore>,
        executions: Arc<ExecutionManager>,
        cfg: &SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            templates,
            executions,
            poll_interval: StdDuration::from_secs(cfg.poll_interval_secs.max(1)),
            due_buffer: Duration::seconds(cfg.due_buffer_secs as i64),
            in_flight: DashMap::new(),
        })
    }

    /// Number of claimed runs still executing in this process.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Main event loop. Scans for due schedules until `shutdown` broadcasts
    /// `true`. Claimed runs execute in their own tasks so one slow-polling
    /// execution never delays the scan.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("scheduler tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(
                            in_flight = self.in_flight_count(),
                            "scheduler engine shutting down"
                        );
                        break;
                    }
                }
            }
        }
    }

    /// One due-scan: claim every due schedule and spawn its run.
    pub async fn tick(self: &Arc<Self>) -> Result<()> {
        let now = Utc::now();
        let due = self.store.due_schedules(now, self.due_buffer)?;
        for schedule in due {
            match self.try_claim(&schedule, now) {
                Ok(Some(run)) => {
                    info!(
                        schedule_id = %schedule.id,
                        run_id = %run.id,
                        run_number = run.run_number,
                        "schedule tick claimed"
                    );
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        engine.run_claimed(schedule, run).await;
                    });
                }
                // Another process won this tick — expected, not an error.
                Ok(None) => debug!(schedule_id = %schedule.id, "tick already claimed elsewhere"),
                Err(e) => error!(schedule_id = %schedule.id, "claim failed: {e}"),
            }
        }
        Ok(())
    }

    /// Attempt the optimistic claim for one due schedule. Returns the created
    /// run when this process won, None when another process got there first.
    fn try_claim(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<ScheduleRun>> {
        let Some(token) = schedule.next_run_at.as_deref() else {
            return Ok(None);
        };
        let next = next_fire(&schedule.trigger, &schedule.timezone, now, Some(now))?;
        if !self
            .store
            .claim(&schedule.id, token, &next.to_rfc3339(), now)?
        {
            return Ok(None);
        }
        Ok(Some(self.store.create_run(&schedule.id)?))
    }

    async fn run_claimed(self: Arc<Self>, schedule: Schedule, run: ScheduleRun) {
        self.in_flight.insert(run.id.clone(), ());
        if let Err(e) = self.execute_run(&schedule, &run).await {
            error!(
                schedule_id = %schedule.id,
                run_id = %run.id,
                "schedule run failed internally: {e}"
            );
            let _ = self
                .store
                .finish_run(&run.id, RunStatus::Failed, Some(&e.to_string()));
            let _ = self.store.record_run_outcome(&schedule.id, false);
        }
        self.in_flight.remove(&run.id);
    }

    /// Materialize and execute the schedule's workflow, then fold the result
    /// into the run aggregates and the schedule's failure accounting.
    async fn execute_run(&self, schedule: &Schedule, run: &ScheduleRun) -> Result<()> {
        self.store.mark_run_running(&run.id)?;
        let template = self.templates.get(&schedule.template_id)?;
        let execution = self
            .executions
            .execute_workflow(
                &template,
                &schedule.parameters,
                &schedule.target,
                Some(&run.id),
            )
            .await?;

        if execution.status == ExecutionStatus::Cancelled {
            // A cancelled run is neither a success nor a schedule failure.
            self.store.finish_run(&run.id, RunStatus::Cancelled, None)?;
            info!(run_id = %run.id, "schedule run cancelled");
            return Ok(());
        }

        let success = execution.status == ExecutionStatus::Succeeded;
        self.store.record_execution(
            &run.id,
            success,
            execution.result_total_rows.unwrap_or(0),
            execution.cost_estimate_usd.unwrap_or(0.0),
        )?;
        let run_status = if success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.store
            .finish_run(&run.id, run_status, execution.error_message.as_deref())?;

        let (failures, active) = self.store.record_run_outcome(&schedule.id, success)?;
        if !success && !active {
            // Distinct from the individual execution failure: the schedule
            // itself has been taken out of rotation.
            warn!(
                schedule_id = %schedule.id,
                consecutive_failures = failures,
                threshold = schedule.failure_threshold,
                "schedule auto-paused after repeated failures"
            );
        }
        info!(
            run_id = %run.id,
            run_number = run.run_number,
            status = %run_status,
            "schedule run finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use drumline_backend::{
        BackendError, BackendQueryStatus, QueryBackend, ResultMetadata, RetryPolicy,
        StatusResponse, SubmitResponse,
    };
    use drumline_core::config::{BackendConfig, ExecutionConfig};
    use drumline_core::types::TargetContext;
    use drumline_exec::ExecutionStore;
    use rusqlite::Connection;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::store::NewSchedule;
    use crate::types::Trigger;

    /// Backend double: every submission is accepted (or rejected) and every
    /// status check reports immediate success.
    struct StubBackend {
        reject_submissions: bool,
        submissions: AtomicU32,
    }

    #[async_trait]
    impl QueryBackend for StubBackend {
        async fn submit_query(
            &self,
            _sql: &str,
            _target: &TargetContext,
        ) -> std::result::Result<SubmitResponse, BackendError> {
            let n = self.submissions.fetch_add(1, Ordering::SeqCst);
            if self.reject_submissions {
                Err(BackendError::Api {
                    status: 400,
                    message: "invalid SQL".into(),
                    retry_after: None,
                })
            } else {
                Ok(SubmitResponse {
                    execution_id: format!("be-{n}"),
                })
            }
        }

        async fn get_status(
            &self,
            _execution_id: &str,
        ) -> std::result::Result<StatusResponse, BackendError> {
            Ok(StatusResponse {
                status: BackendQueryStatus::Succeeded,
                result: Some(ResultMetadata {
                    columns: vec!["n".into()],
                    rows: json!([[1]]),
                    total_rows: 10,
                    query_runtime_seconds: 1.0,
                    data_scanned_gb: 0.1,
                    cost_estimate_usd: 0.25,
                }),
                error: None,
            })
        }
    }

    struct Harness {
        engine: Arc<SchedulerEngine>,
        store: Arc<ScheduleStore>,
        templates: Arc<TemplateStore>,
    }

    fn harness(reject_submissions: bool) -> Harness {
        let store = Arc::new(ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let templates =
            Arc::new(TemplateStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let exec_store = ExecutionStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let backend = Arc::new(StubBackend {
            reject_submissions,
            submissions: AtomicU32::new(0),
        });
        let executions = Arc::new(ExecutionManager::new(
            exec_store,
            backend,
            RetryPolicy {
                max_retries: 1,
                initial_delay: StdDuration::from_millis(1),
                max_delay: StdDuration::from_millis(2),
                base: 2.0,
                jitter: false,
            },
            &ExecutionConfig {
                poll_interval_secs: 0,
                poll_timeout_secs: 5,
                large_list_threshold: 100,
            },
            &BackendConfig::default(),
        ));
        let engine = SchedulerEngine::new(
            Arc::clone(&store),
            Arc::clone(&templates),
            executions,
            &SchedulerConfig {
                poll_interval_secs: 1,
                due_buffer_secs: 0,
            },
        );
        Harness {
            engine,
            store,
            templates,
        }
    }

    fn due_schedule(h: &Harness, failure_threshold: u32) -> Schedule {
        let template = h
            .templates
            .create("nightly", "SELECT {{n}}", &[])
            .unwrap();
        let mut parameters = Map::new();
        parameters.insert("n".to_string(), json!(1));
        let schedule = h
            .store
            .create(NewSchedule {
                template_id: template.id,
                target: TargetContext::new("inst-1"),
                trigger: Trigger::Cron {
                    expression: "0 2 * * *".to_string(),
                },
                timezone: "UTC".to_string(),
                parameters,
                failure_threshold,
                auto_pause_on_failure: true,
            })
            .unwrap();
        h.store
            .reschedule(&schedule.id, Utc::now() - Duration::minutes(1))
            .unwrap();
        h.store.get(&schedule.id).unwrap()
    }

    async fn wait_for_finished_run(h: &Harness, schedule_id: &str) -> ScheduleRun {
        for _ in 0..400 {
            if let Some(run) = h
                .store
                .runs_for(schedule_id)
                .unwrap()
                .into_iter()
                .find(|r| r.finished_at.is_some())
            {
                return run;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("run never finished for schedule {schedule_id}");
    }

    #[tokio::test]
    async fn due_schedule_fires_exactly_once_per_tick() {
        let h = harness(false);
        let schedule = due_schedule(&h, 3);

        h.engine.tick().await.unwrap();
        let run = wait_for_finished_run(&h, &schedule.id).await;
        assert_eq!(run.run_number, 1);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.successful_count, 1);
        assert_eq!(run.total_rows, 10);

        // The claim advanced next_run_at: a second scan finds nothing due.
        h.engine.tick().await.unwrap();
        assert_eq!(h.store.runs_for(&schedule.id).unwrap().len(), 1);

        let reloaded = h.store.get(&schedule.id).unwrap();
        assert!(reloaded.next_run_at.unwrap() > Utc::now().to_rfc3339());
        assert!(reloaded.last_run_at.is_some());
        assert_eq!(reloaded.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn failed_run_updates_failure_accounting() {
        let h = harness(true);
        let schedule = due_schedule(&h, 3);

        h.engine.tick().await.unwrap();
        let run = wait_for_finished_run(&h, &schedule.id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failed_count, 1);
        assert!(run.error_summary.unwrap().contains("invalid SQL"));

        let reloaded = h.store.get(&schedule.id).unwrap();
        assert_eq!(reloaded.consecutive_failures, 1);
        assert!(reloaded.is_active);
    }

    #[tokio::test]
    async fn repeated_failures_auto_pause_the_schedule() {
        let h = harness(true);
        let schedule = due_schedule(&h, 1);

        h.engine.tick().await.unwrap();
        wait_for_finished_run(&h, &schedule.id).await;

        let reloaded = h.store.get(&schedule.id).unwrap();
        assert!(!reloaded.is_active);
        assert!(reloaded.next_run_at.is_none());
    }

    #[tokio::test]
    async fn missing_template_marks_the_run_failed() {
        let h = harness(false);
        let schedule = h
            .store
            .create(NewSchedule {
                template_id: "no-such-template".to_string(),
                target: TargetContext::new("inst-1"),
                trigger: Trigger::Cron {
                    expression: "0 2 * * *".to_string(),
                },
                timezone: "UTC".to_string(),
                parameters: Map::new(),
                failure_threshold: 3,
                auto_pause_on_failure: true,
            })
            .unwrap();
        h.store
            .reschedule(&schedule.id, Utc::now() - Duration::minutes(1))
            .unwrap();

        h.engine.tick().await.unwrap();
        let run = wait_for_finished_run(&h, &schedule.id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_summary.unwrap().contains("no-such-template"));
        assert_eq!(
            h.store.get(&schedule.id).unwrap().consecutive_failures,
            1
        );
    }
}
