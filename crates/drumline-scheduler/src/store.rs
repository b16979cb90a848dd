use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use drumline_core::types::TargetContext;

use crate::cron::next_fire;
use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{RunStatus, Schedule, ScheduleRun, Trigger};

/// Input for creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub template_id: String,
    pub target: TargetContext,
    pub trigger: Trigger,
    pub timezone: String,
    pub parameters: Map<String, Value>,
    pub failure_threshold: u32,
    pub auto_pause_on_failure: bool,
}

#[derive(Debug, Default, Deserialize)]
struct IntervalConfig {
    #[serde(default)]
    at_hour: u8,
    #[serde(default)]
    at_minute: u8,
}

/// Persistence for schedules and schedule runs.
///
/// Thread-safe: wraps the SQLite connection in a Mutex. All cross-process
/// coordination happens through [`claim`](Self::claim) — a conditional update
/// using `next_run_at` as the version token — backed by the unique
/// `(schedule_id, run_number)` constraint on runs.
pub struct ScheduleStore {
    conn: Mutex<Connection>,
}

impl ScheduleStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an active schedule with its first fire time computed from the
    /// trigger in the schedule's timezone.
    pub fn create(&self, new: NewSchedule) -> Result<Schedule> {
        let now = Utc::now();
        let next = next_fire(&new.trigger, &new.timezone, now, None)?;
        let (cron_expression, interval_days, interval_config) = trigger_columns(&new.trigger);

        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now_str = now.to_rfc3339();
        conn.execute(
            "INSERT INTO schedules
             (id, template_id, target, cron_expression, interval_days, interval_config,
              timezone, parameters, is_active, next_run_at, consecutive_failures,
              failure_threshold, auto_pause_on_failure, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, 0, ?10, ?11, ?12, ?12)",
            rusqlite::params![
                id,
                new.template_id,
                serde_json::to_string(&new.target)?,
                cron_expression,
                interval_days,
                interval_config,
                new.timezone,
                serde_json::to_string(&new.parameters)?,
                next.to_rfc3339(),
                new.failure_threshold,
                new.auto_pause_on_failure,
                now_str
            ],
        )?;
        info!(schedule_id = %id, next_run_at = %next.to_rfc3339(), "schedule created");
        self.get_locked(&conn, &id)
    }

    pub fn get(&self, id: &str) -> Result<Schedule> {
        let conn = self.conn.lock().unwrap();
        self.get_locked(&conn, id)
    }

    /// Return all schedules ordered by creation time.
    pub fn list(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at"
        ))?;
        let schedules = stmt
            .query_map([], map_schedule_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(schedules)
    }

    /// Pause or resume a schedule. Resuming recomputes `next_run_at` from the
    /// trigger; pausing clears it, preserving the invariant that an inactive
    /// schedule has no fire time.
    pub fn set_active(&self, id: &str, active: bool) -> Result<Schedule> {
        let schedule = self.get(id)?;
        let now = Utc::now();
        let next = if active {
            Some(next_fire(&schedule.trigger, &schedule.timezone, now, None)?.to_rfc3339())
        } else {
            None
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedules SET is_active = ?1, next_run_at = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![active, next, now.to_rfc3339(), id],
        )?;
        self.get_locked(&conn, id)
    }

    /// Directly set the next fire time (backfill / ops surface).
    pub fn reschedule(&self, id: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE schedules SET next_run_at = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![next_run_at.to_rfc3339(), Utc::now().to_rfc3339(), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Active schedules whose `next_run_at` falls within `now + buffer`.
    ///
    /// The buffer absorbs clock/poll-interval skew; config keeps it below the
    /// poll interval so two consecutive scans cannot both see the same tick.
    pub fn due_schedules(&self, now: DateTime<Utc>, buffer: Duration) -> Result<Vec<Schedule>> {
        let cutoff = (now + buffer).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE is_active = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at"
        ))?;
        let schedules = stmt
            .query_map([cutoff], map_schedule_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(schedules)
    }

    /// Atomically claim one schedule tick.
    ///
    /// The update succeeds only while `next_run_at` still equals the value
    /// the caller read, advancing it to the newly computed fire time and
    /// stamping `last_run_at` in the same statement. Zero affected rows means
    /// another process claimed this tick first; the caller abandons the
    /// schedule without creating a run.
    pub fn claim(
        &self,
        id: &str,
        prev_next_run_at: &str,
        new_next_run_at: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE schedules
             SET next_run_at = ?1, last_run_at = ?2, updated_at = ?2
             WHERE id = ?3 AND is_active = 1 AND next_run_at = ?4",
            rusqlite::params![new_next_run_at, now.to_rfc3339(), id, prev_next_run_at],
        )?;
        Ok(n > 0)
    }

    /// Create the run record for a claimed tick. `run_number` is the next in
    /// sequence for the schedule; the unique constraint backstops any race.
    pub fn create_run(&self, schedule_id: &str) -> Result<ScheduleRun> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO schedule_runs (id, schedule_id, run_number, status, started_at)
             VALUES (?1, ?2,
                     (SELECT COALESCE(MAX(run_number), 0) + 1
                      FROM schedule_runs WHERE schedule_id = ?2),
                     'pending', ?3)",
            rusqlite::params![id, schedule_id, now],
        )?;
        self.get_run_locked(&conn, &id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<ScheduleRun> {
        let conn = self.conn.lock().unwrap();
        self.get_run_locked(&conn, run_id)
    }

    /// Runs for one schedule, newest first.
    pub fn runs_for(&self, schedule_id: &str) -> Result<Vec<ScheduleRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM schedule_runs
             WHERE schedule_id = ?1 ORDER BY run_number DESC"
        ))?;
        let runs = stmt
            .query_map([schedule_id], map_run_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(runs)
    }

    pub fn mark_run_running(&self, run_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedule_runs SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            [run_id],
        )?;
        Ok(())
    }

    /// Fold one execution outcome into the run's aggregate counters.
    pub fn record_execution(
        &self,
        run_id: &str,
        success: bool,
        rows: u64,
        cost: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedule_runs SET
                execution_count = execution_count + 1,
                successful_count = successful_count + (CASE WHEN ?1 THEN 1 ELSE 0 END),
                failed_count = failed_count + (CASE WHEN ?1 THEN 0 ELSE 1 END),
                total_rows = total_rows + ?2,
                total_cost = total_cost + ?3
             WHERE id = ?4",
            rusqlite::params![success, rows as i64, cost, run_id],
        )?;
        Ok(())
    }

    pub fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error_summary: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedule_runs
             SET status = ?1, error_summary = ?2, finished_at = ?3
             WHERE id = ?4",
            rusqlite::params![
                status.to_string(),
                error_summary,
                Utc::now().to_rfc3339(),
                run_id
            ],
        )?;
        Ok(())
    }

    /// Update the schedule's failure accounting for one finished run.
    ///
    /// Success resets `consecutive_failures`; failure increments it and, when
    /// auto-pause is enabled and the threshold is reached, clears `is_active`
    /// and `next_run_at` in the same statement — never as a separate write.
    /// Returns the resulting `(consecutive_failures, is_active)` so the
    /// caller can report an auto-pause distinctly.
    pub fn record_run_outcome(&self, schedule_id: &str, success: bool) -> Result<(u32, bool)> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedules SET
                consecutive_failures = CASE WHEN ?1 THEN 0
                                            ELSE consecutive_failures + 1 END,
                is_active = CASE WHEN (NOT ?1) AND auto_pause_on_failure = 1
                                      AND consecutive_failures + 1 >= failure_threshold
                                 THEN 0 ELSE is_active END,
                next_run_at = CASE WHEN (NOT ?1) AND auto_pause_on_failure = 1
                                        AND consecutive_failures + 1 >= failure_threshold
                                   THEN NULL ELSE next_run_at END,
                updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![success, Utc::now().to_rfc3339(), schedule_id],
        )?;
        let (failures, active): (u32, bool) = conn.query_row(
            "SELECT consecutive_failures, is_active FROM schedules WHERE id = ?1",
            [schedule_id],
            |row| Ok((row.get::<_, i64>(0)? as u32, row.get(1)?)),
        )?;
        debug!(
            schedule_id,
            success, consecutive_failures = failures, is_active = active, "run outcome recorded"
        );
        Ok((failures, active))
    }

    fn get_locked(&self, conn: &Connection, id: &str) -> Result<Schedule> {
        conn.query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
            [id],
            map_schedule_row,
        )
        .optional()?
        .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })
    }

    fn get_run_locked(&self, conn: &Connection, run_id: &str) -> Result<ScheduleRun> {
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM schedule_runs WHERE id = ?1"),
            [run_id],
            map_run_row,
        )
        .optional()?
        .ok_or_else(|| SchedulerError::RunNotFound {
            id: run_id.to_string(),
        })
    }
}

const SCHEDULE_COLUMNS: &str = "id, template_id, target, cron_expression, interval_days, \
     interval_config, timezone, parameters, is_active, next_run_at, last_run_at, \
     consecutive_failures, failure_threshold, auto_pause_on_failure, created_at, updated_at";

const RUN_COLUMNS: &str = "id, schedule_id, run_number, status, execution_count, \
     successful_count, failed_count, total_rows, total_cost, error_summary, \
     started_at, finished_at";

fn trigger_columns(trigger: &Trigger) -> (Option<String>, Option<i64>, Option<String>) {
    match trigger {
        Trigger::Cron { expression } => (Some(expression.clone()), None, None),
        Trigger::Interval {
            days,
            at_hour,
            at_minute,
        } => (
            None,
            Some(*days as i64),
            Some(
                serde_json::json!({ "at_hour": at_hour, "at_minute": at_minute }).to_string(),
            ),
        ),
    }
}

fn map_schedule_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let target_json: String = row.get(2)?;
    let cron_expression: Option<String> = row.get(3)?;
    let interval_days: Option<i64> = row.get(4)?;
    let interval_config: Option<String> = row.get(5)?;
    let params_json: String = row.get(7)?;

    let trigger = match (cron_expression, interval_days) {
        (Some(expression), _) => Trigger::Cron { expression },
        (None, Some(days)) => {
            let cfg: IntervalConfig = interval_config
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_default();
            Trigger::Interval {
                days: days as u32,
                at_hour: cfg.at_hour,
                at_minute: cfg.at_minute,
            }
        }
        // Unreachable: the schema CHECK requires one of the two.
        (None, None) => return Err(rusqlite::Error::InvalidQuery),
    };

    Ok(Schedule {
        id: row.get(0)?,
        template_id: row.get(1)?,
        target: serde_json::from_str(&target_json).unwrap_or(TargetContext {
            instance_id: String::new(),
            marketplace_id: None,
        }),
        trigger,
        timezone: row.get(6)?,
        parameters: serde_json::from_str(&params_json).unwrap_or_default(),
        is_active: row.get(8)?,
        next_run_at: row.get(9)?,
        last_run_at: row.get(10)?,
        consecutive_failures: row.get::<_, i64>(11)? as u32,
        failure_threshold: row.get::<_, i64>(12)? as u32,
        auto_pause_on_failure: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn map_run_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRun> {
    let status_str: String = row.get(3)?;
    Ok(ScheduleRun {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        run_number: row.get(2)?,
        status: RunStatus::from_str(&status_str).unwrap_or(RunStatus::Failed),
        execution_count: row.get::<_, i64>(4)? as u32,
        successful_count: row.get::<_, i64>(5)? as u32,
        failed_count: row.get::<_, i64>(6)? as u32,
        total_rows: row.get::<_, i64>(7)? as u64,
        total_cost: row.get(8)?,
        error_summary: row.get(9)?,
        started_at: row.get(10)?,
        finished_at: row.get(11)?,
    })
}
